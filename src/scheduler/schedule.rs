//! Maintenance-window schedule for unattended rolling updates

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::update::UpdateOptions;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Fire once, then disable
    Once,
    #[default]
    Recurring,
}

/// Day the window opens on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleDay {
    Daily,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    #[default]
    Sunday,
}

impl ScheduleDay {
    /// Day-of-week field of a cron expression
    fn cron_field(self) -> &'static str {
        match self {
            ScheduleDay::Daily => "*",
            ScheduleDay::Monday => "Mon",
            ScheduleDay::Tuesday => "Tue",
            ScheduleDay::Wednesday => "Wed",
            ScheduleDay::Thursday => "Thu",
            ScheduleDay::Friday => "Fri",
            ScheduleDay::Saturday => "Sat",
            ScheduleDay::Sunday => "Sun",
        }
    }
}

impl fmt::Display for ScheduleDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleDay::Daily => "daily",
            ScheduleDay::Monday => "monday",
            ScheduleDay::Tuesday => "tuesday",
            ScheduleDay::Wednesday => "wednesday",
            ScheduleDay::Thursday => "thursday",
            ScheduleDay::Friday => "friday",
            ScheduleDay::Saturday => "saturday",
            ScheduleDay::Sunday => "sunday",
        };
        f.write_str(s)
    }
}

/// Result of comparing a schedule against the clock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Due {
    NotDue,
    Fire,
    /// The window passed longer ago than the misfire grace
    Missed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    pub enabled: bool,
    pub schedule_type: ScheduleType,
    pub day: ScheduleDay,
    /// Local wall-clock time, `HH:MM`
    pub time: String,
    pub options: UpdateOptions,
    pub last_run: Option<DateTime<Local>>,
    pub next_run: Option<DateTime<Local>>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule_type: ScheduleType::Recurring,
            day: ScheduleDay::Sunday,
            time: "03:00".to_string(),
            options: UpdateOptions {
                include_reboot: true,
                ..Default::default()
            },
            last_run: None,
            next_run: None,
        }
    }
}

impl Schedule {
    fn parse_time(&self) -> Result<(u32, u32)> {
        let invalid = || Error::ScheduleError(format!("time must be HH:MM, got {:?}", self.time));
        let (hour, minute) = self.time.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        if hour > 23 || minute > 59 {
            return Err(invalid());
        }
        Ok((hour, minute))
    }

    /// Seven-field cron expression (seconds first, year last)
    pub fn cron_expression(&self) -> Result<String> {
        let (hour, minute) = self.parse_time()?;
        Ok(format!("0 {} {} * * {} *", minute, hour, self.day.cron_field()))
    }

    pub fn validate(&self) -> Result<()> {
        let expression = self.cron_expression()?;
        cron::Schedule::from_str(&expression)
            .map_err(|e| Error::ScheduleError(format!("{}: {}", expression, e)))?;
        if self.options.evacuation_timeout == 0 {
            return Err(Error::ScheduleError(
                "evacuation_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// First window strictly after `after`
    pub fn next_after(&self, after: DateTime<Local>) -> Result<Option<DateTime<Local>>> {
        let expression = self.cron_expression()?;
        let schedule = cron::Schedule::from_str(&expression)
            .map_err(|e| Error::ScheduleError(format!("{}: {}", expression, e)))?;
        Ok(schedule.after(&after).next())
    }

    /// Recompute `next_run` from `now`; disabled schedules have none
    pub fn refresh_next_run(&mut self, now: DateTime<Local>) -> Result<()> {
        self.next_run = if self.enabled {
            self.next_after(now)?
        } else {
            None
        };
        Ok(())
    }

    pub fn due(&self, now: DateTime<Local>, grace: chrono::Duration) -> Due {
        match self.next_run {
            Some(next) if self.enabled && now >= next => {
                if now - next > grace {
                    Due::Missed
                } else {
                    Due::Fire
                }
            }
            _ => Due::NotDue,
        }
    }

    /// Bookkeeping after a window was handled, fired or not
    pub fn advance(&mut self, now: DateTime<Local>) -> Result<()> {
        match self.schedule_type {
            ScheduleType::Once => {
                self.enabled = false;
                self.next_run = None;
                Ok(())
            }
            ScheduleType::Recurring => self.refresh_next_run(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_defaults() {
        let s = Schedule::default();
        assert!(!s.enabled);
        assert_eq!(s.day, ScheduleDay::Sunday);
        assert_eq!(s.time, "03:00");
        assert!(s.options.include_reboot);
        assert!(s.options.skip_up_to_date);
        assert!(s.options.wait_for_reboot);
        assert_eq!(s.options.evacuation_timeout, 1800);
    }

    #[test]
    fn test_next_run_weekly() {
        let s = Schedule {
            enabled: true,
            day: ScheduleDay::Wednesday,
            time: "02:30".to_string(),
            ..Default::default()
        };
        // 2026-10-19 is a Monday.
        let next = s.next_after(at(2026, 10, 19, 12, 0)).unwrap().unwrap();
        assert_eq!(next.weekday(), Weekday::Wed);
        assert_eq!(next.day(), 21);
        assert_eq!((next.hour(), next.minute()), (2, 30));
    }

    #[test]
    fn test_next_run_daily_rolls_over() {
        let s = Schedule {
            enabled: true,
            day: ScheduleDay::Daily,
            time: "03:00".to_string(),
            ..Default::default()
        };
        let next = s.next_after(at(2026, 10, 19, 4, 0)).unwrap().unwrap();
        assert_eq!(next.day(), 20);
        assert_eq!(next.hour(), 3);
    }

    #[test]
    fn test_invalid_time_rejected() {
        for time in ["25:00", "3", "ab:cd", "12:60"] {
            let s = Schedule {
                time: time.to_string(),
                ..Default::default()
            };
            assert!(s.validate().is_err(), "{} accepted", time);
        }
    }

    #[test]
    fn test_due_and_misfire() {
        let mut s = Schedule {
            enabled: true,
            ..Default::default()
        };
        let window = at(2026, 11, 8, 3, 0);
        s.next_run = Some(window);
        let grace = chrono::Duration::minutes(15);

        assert_eq!(s.due(at(2026, 11, 8, 2, 59), grace), Due::NotDue);
        assert_eq!(s.due(at(2026, 11, 8, 3, 5), grace), Due::Fire);
        assert_eq!(s.due(at(2026, 11, 8, 4, 0), grace), Due::Missed);

        s.enabled = false;
        assert_eq!(s.due(at(2026, 11, 8, 3, 5), grace), Due::NotDue);
    }

    #[test]
    fn test_once_disables_after_advance() {
        let mut s = Schedule {
            enabled: true,
            schedule_type: ScheduleType::Once,
            ..Default::default()
        };
        s.refresh_next_run(at(2026, 10, 19, 12, 0)).unwrap();
        assert!(s.next_run.is_some());

        s.advance(at(2026, 11, 8, 3, 0)).unwrap();
        assert!(!s.enabled);
        assert!(s.next_run.is_none());
    }
}

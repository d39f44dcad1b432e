//! HTTP handlers for the REST API

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::{error, instrument, warn};

use crate::error::Error;
use crate::orchestrator::Orchestrator;
use crate::scheduler::Schedule;
use crate::update::{ClusterUpdateSummary, JobSnapshot, JobStatus};

use super::dto::{
    ClusterListResponse, ErrorResponse, HealthResponse, MessageResponse, SingleNodeRequest,
    SingleNodeResponse, StartRollingRequest, StatusQuery, StatusResponse,
};

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::ClusterNotFound(_) | Error::NodeNotFound { .. } => StatusCode::NOT_FOUND,
        Error::JobActive { .. } | Error::InvalidJobState(_) | Error::MaintenanceRequired(_) => {
            StatusCode::CONFLICT
        }
        Error::ScheduleError(_) | Error::ConfigError(_) => StatusCode::BAD_REQUEST,
        Error::Http(_) | Error::BackendError(_) | Error::CommandFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a control-surface error onto a status code and JSON body
pub fn api_error(e: Error) -> ApiError {
    let status = status_for(&e);
    if status.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        warn!("Request rejected: {}", e);
    }
    #[cfg(feature = "metrics")]
    crate::metrics::inc_api_error(e.kind());
    (status, Json(ErrorResponse::new(e.kind(), &e.to_string())))
}

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[instrument(skip(state))]
pub async fn list_clusters(State(state): State<Arc<Orchestrator>>) -> Json<ClusterListResponse> {
    let items = state.list_clusters().await;
    let total = items.len();
    Json(ClusterListResponse { items, total })
}

#[instrument(skip(state))]
pub async fn check_updates(
    State(state): State<Arc<Orchestrator>>,
    Path(cluster): Path<String>,
) -> ApiResult<ClusterUpdateSummary> {
    state
        .check_updates(&cluster)
        .await
        .map(Json)
        .map_err(api_error)
}

#[instrument(skip(state, request))]
pub async fn start_rolling_update(
    State(state): State<Arc<Orchestrator>>,
    Path(cluster): Path<String>,
    Json(request): Json<StartRollingRequest>,
) -> Result<(StatusCode, Json<JobSnapshot>), ApiError> {
    state
        .start_rolling_update(&cluster, request.nodes, request.options)
        .await
        .map(|snapshot| (StatusCode::ACCEPTED, Json(snapshot)))
        .map_err(api_error)
}

#[instrument(skip(state))]
pub async fn cancel_rolling_update(
    State(state): State<Arc<Orchestrator>>,
    Path(cluster): Path<String>,
) -> ApiResult<JobSnapshot> {
    state
        .cancel_rolling_update(&cluster)
        .await
        .map(Json)
        .map_err(api_error)
}

#[instrument(skip(state))]
pub async fn resume_rolling_update(
    State(state): State<Arc<Orchestrator>>,
    Path(cluster): Path<String>,
) -> ApiResult<JobSnapshot> {
    state
        .resume_rolling_update(&cluster)
        .await
        .map(Json)
        .map_err(api_error)
}

#[instrument(skip(state))]
pub async fn pause_rolling_update(
    State(state): State<Arc<Orchestrator>>,
    Path(cluster): Path<String>,
) -> ApiResult<JobSnapshot> {
    state
        .pause_rolling_update(&cluster)
        .await
        .map(Json)
        .map_err(api_error)
}

#[instrument(skip(state))]
pub async fn get_rolling_status(
    State(state): State<Arc<Orchestrator>>,
    Path(cluster): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<StatusResponse> {
    let job = state
        .get_rolling_status(&cluster, query.wait.map(Duration::from_secs))
        .await
        .map_err(api_error)?;
    Ok(Json(StatusResponse {
        cluster,
        status: job.as_ref().map_or(JobStatus::Idle, |j| j.status),
        job,
    }))
}

#[instrument(skip(state))]
pub async fn clear_rolling_update(
    State(state): State<Arc<Orchestrator>>,
    Path(cluster): Path<String>,
) -> ApiResult<MessageResponse> {
    state
        .clear_rolling_update(&cluster)
        .await
        .map_err(api_error)?;
    Ok(Json(MessageResponse {
        message: format!("Rolling update status cleared for {}", cluster),
    }))
}

#[instrument(skip(state, request))]
pub async fn update_single_node(
    State(state): State<Arc<Orchestrator>>,
    Path((cluster, node)): Path<(String, String)>,
    Json(request): Json<SingleNodeRequest>,
) -> ApiResult<SingleNodeResponse> {
    let output = state
        .update_single_node(&cluster, &node, request.reboot, request.force)
        .await
        .map_err(api_error)?;
    Ok(Json(SingleNodeResponse {
        success: output.success(),
        node,
        exit_code: output.exit_code,
        output: output.output,
        rebooting: request.reboot,
    }))
}

#[instrument(skip(state))]
pub async fn get_schedule(
    State(state): State<Arc<Orchestrator>>,
    Path(cluster): Path<String>,
) -> ApiResult<Schedule> {
    state.get_schedule(&cluster).await.map(Json).map_err(api_error)
}

#[instrument(skip(state, schedule))]
pub async fn set_schedule(
    State(state): State<Arc<Orchestrator>>,
    Path(cluster): Path<String>,
    Json(schedule): Json<Schedule>,
) -> ApiResult<Schedule> {
    state
        .set_schedule(&cluster, schedule)
        .await
        .map(Json)
        .map_err(api_error)
}

#[instrument(skip(state))]
pub async fn delete_schedule(
    State(state): State<Arc<Orchestrator>>,
    Path(cluster): Path<String>,
) -> ApiResult<MessageResponse> {
    state.delete_schedule(&cluster).await.map_err(api_error)?;
    Ok(Json(MessageResponse {
        message: format!("Schedule deleted for {}", cluster),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&Error::ClusterNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::JobActive {
                cluster: "x".into(),
                status: "running".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::MaintenanceRequired("a".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::ScheduleError("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::BackendError("down".into())),
            StatusCode::BAD_GATEWAY
        );
    }
}

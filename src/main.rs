use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use rolling_updater::config::Config;
use rolling_updater::update::check_nodes;
use rolling_updater::Orchestrator;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the REST API and the update scheduler
    Run(RunArgs),
    /// Print pending updates for every node of a cluster as JSON
    Check(CheckArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the TOML configuration file
    #[arg(long, env = "ROLLING_UPDATER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the REST API listen address
    #[arg(long, env = "ROLLING_UPDATER_LISTEN")]
    listen: Option<SocketAddr>,

    /// Override the state directory
    #[arg(long, env = "ROLLING_UPDATER_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "ROLLING_UPDATER_LOG_JSON")]
    log_json: bool,
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Path to the TOML configuration file
    #[arg(long, env = "ROLLING_UPDATER_CONFIG")]
    config: PathBuf,

    /// Cluster id from the configuration file
    #[arg(long)]
    cluster: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("rolling-updater v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Check(check_args) => {
            init_tracing(false);
            run_check(check_args).await
        }
        Commands::Run(run_args) => {
            init_tracing(run_args.log_json);
            run_updater(run_args).await
        }
    }
}

/// Logs go to stderr so `check` output on stdout stays machine-readable
fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer);

    // Only enable OTEL if an endpoint is provided
    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        let otel_layer = rolling_updater::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => {
            warn!("No configuration file given, starting without clusters");
            Ok(Config::default())
        }
    }
}

async fn run_updater(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }

    info!("Starting rolling-updater v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "State directory {}, {} cluster(s) configured",
        config.state_dir.display(),
        config.clusters.len()
    );

    let orchestrator = Arc::new(
        Orchestrator::from_config(&config)
            .await
            .context("initializing clusters")?,
    );
    let scheduler = orchestrator.spawn_scheduler(config.scheduler_interval());

    #[cfg(feature = "rest-api")]
    let result = rolling_updater::rest_api::run_server(
        Arc::clone(&orchestrator),
        config.listen_addr,
        shutdown_signal(),
    )
    .await
    .context("REST API server");

    #[cfg(not(feature = "rest-api"))]
    let result: anyhow::Result<()> = {
        shutdown_signal().await;
        Ok(())
    };

    info!("Shutting down");
    scheduler.abort();

    // Flush any remaining traces
    rolling_updater::telemetry::shutdown_telemetry();

    result
}

async fn run_check(args: CheckArgs) -> anyhow::Result<()> {
    let config = load_config(Some(&args.config))?;
    let cluster = config
        .clusters
        .iter()
        .find(|c| c.id == args.cluster)
        .ok_or_else(|| anyhow!("cluster {} is not configured", args.cluster))?;

    // Probe directly; building the orchestrator would touch persisted jobs.
    let backend = cluster.backend.build()?;
    let mut nodes: Vec<String> = backend
        .list_nodes()
        .await?
        .into_iter()
        .map(|n| n.name)
        .collect();
    nodes.sort();

    let check_timeout = config.timings.runtime_settings().timings.check_timeout;
    let summary = check_nodes(backend.as_ref(), &nodes, true, check_timeout).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

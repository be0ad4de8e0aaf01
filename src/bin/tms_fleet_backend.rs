use anyhow::{Context, Result};
use flume::unbounded;
use tms_fleet_backend::config::FleetConfig;
use tms_fleet_backend::runtime::FleetRuntime;
use tms_fleet_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tms_fleet_backend=debug")),
        )
        .init();

    let config = FleetConfig::load();
    let (event_tx, event_rx) = unbounded();
    let runtime = FleetRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap fleet runtime")?;

    tracing::info!(
        "Starting TMS fleet backend (set TMS_BACKEND_TOKEN + optional TMS_BACKEND_BIND; auth mode via TMS_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime, event_rx))
}

use std::sync::Arc;

use anyhow::Result;
use power_diverter::{api, config, controller, hardware, telemetry};
use config::Config;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // configuration errors are fatal and reported before logging is set up
    let cfg = Arc::new(Config::load()?);
    let verbosity = init_tracing(cfg.debug);

    let (devices, feed) = hardware::DeviceFactory::new(&cfg).build()?;
    let app_state =
        controller::spawn_controller_tasks(cfg.clone(), devices, feed, Some(verbosity))?;

    let app = api::router(app_state, &cfg);
    let addr = cfg.server.socket_addr()?;

    if cfg.server.host == "0.0.0.0" {
        warn!(
            "status endpoint bound to 0.0.0.0, it accepts unauthenticated commands from the network"
        );
    }

    info!(
        %addr,
        source = %cfg.grid.source,
        loads = cfg.enabled_loads().count(),
        "starting power diverter"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    warn!("shutdown complete");
    Ok(())
}

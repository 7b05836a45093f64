use tokio::signal;
use tracing::info;
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

const QUIET_DEPENDENCIES: &str = "hyper=warn,reqwest=warn,tower_http=info";

/// Filter directives for a `debug` level from the configuration or the
/// status endpoint.
pub fn filter_for_level(debug: u8) -> String {
    let level = match debug {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    format!("{level},{QUIET_DEPENDENCIES}")
}

/// Changes log verbosity at runtime.
#[derive(Clone)]
pub struct VerbosityHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl VerbosityHandle {
    pub fn set_level(&self, debug: u8) -> anyhow::Result<()> {
        let filter = EnvFilter::try_new(filter_for_level(debug))?;
        self.handle.reload(filter)?;
        Ok(())
    }
}

/// Install the JSON subscriber. `RUST_LOG` wins over the configured level at
/// startup; later `debug=` commands replace it.
pub fn init_tracing(debug: u8) -> VerbosityHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_level(debug)));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    VerbosityHandle { handle }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert!(filter_for_level(0).starts_with("warn,"));
        assert!(filter_for_level(1).starts_with("info,"));
        assert!(filter_for_level(2).starts_with("debug,"));
        assert!(EnvFilter::try_new(filter_for_level(2)).is_ok());
    }
}

use derive_more::FromStr;
use serde::Serialize;
use std::env;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod config;
pub mod deadline;
pub mod drainer;
pub mod idempotency;
pub mod limiter;
pub mod pool;
pub mod queue;
pub mod request;
pub mod sender;
pub mod transport;

pub use config::EngineConfig;
pub use deadline::Deadline;
pub use drainer::{DrainSummary, Drainer};

#[derive(Debug, Default, Clone, Copy, FromStr, Serialize)]
pub enum Environment {
    Staging,
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn from_env() -> Self {
        env::var("ENVIRONMENT")
            .map(|s| s.parse())
            .inspect_err(|_| warn!("Did not find ENVIRONMENT env var, defaulting to development"))
            .unwrap_or(Ok(Environment::Development))
            .expect(
                "Invalid ENVIRONMENT env var, must be one of: development, production, or staging",
            )
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=debug,info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Spawn a background task that runs `task` every `period` until the token
/// is cancelled. A failing run is logged; the next tick runs regardless.
pub fn run_periodically<F, E, Fut>(task: F, period: std::time::Duration, cancel: CancellationToken)
where
    F: Fn() -> Fut + Send + 'static,
    E: std::error::Error,
    Fut: Future<Output = Result<(), E>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select!(
                _ = cancel.cancelled() => {
                    tracing::info!("periodic task cancelled");
                    return;
                },
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = task().await {
                        tracing::error!("periodic task failed: {e}");
                    }
                }
            )
        }
    });
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use mailpump::{Deadline, Drainer, EngineConfig, init_tracing, shutdown_signal};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Length of one drain round in continuous mode.
const ROUND_MS: u64 = 120_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let config = EngineConfig::from_env();
    let round = Duration::from_millis(
        std::env::var("PUMP_ROUND_MS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(ROUND_MS),
    );

    let drainer = Arc::new(Drainer::from_env_config(&config).await);

    let shutdown = CancellationToken::new();
    drainer.spawn_maintenance(shutdown.clone());

    let worker = {
        let drainer = drainer.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            while !shutdown.is_cancelled() {
                let summary = drainer.drain(Deadline::within(round)).await;
                info!(
                    processed = summary.processed,
                    failed = summary.failed,
                    permanent = summary.permanent,
                    stopped_reason = %summary.stopped_reason,
                    "drain round complete"
                );

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        })
    };

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    // give the running round the opportunity to finish queue actions
    tokio::select! {
        _ = worker => {}
        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
    }

    Ok(())
}

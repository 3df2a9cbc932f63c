use anyhow::Context;
use chrono::Utc;
use mailpump::{Deadline, Drainer, EngineConfig, init_tracing};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Window used when no absolute deadline is passed on the command line.
const DEFAULT_WINDOW_MS: u64 = 900_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let config = EngineConfig::from_env();

    // A single invocation is bounded either by an absolute epoch-millisecond
    // deadline (first argument, handed over by the external timer) or by the
    // DRAIN_WINDOW_MS fallback, minus the configured safety buffer.
    let window = match std::env::args().nth(1) {
        Some(raw) => {
            let target: i64 = raw
                .parse()
                .context("deadline argument must be epoch milliseconds")?;
            let remaining = target - Utc::now().timestamp_millis();
            Duration::from_millis(remaining.max(0) as u64)
        }
        None => {
            let fallback = std::env::var("DRAIN_WINDOW_MS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(DEFAULT_WINDOW_MS);
            Duration::from_millis(fallback)
        }
    };
    let window = window.saturating_sub(config.drain_buffer);

    let drainer = Drainer::from_env_config(&config).await;

    let maintenance = CancellationToken::new();
    drainer.spawn_maintenance(maintenance.clone());

    info!(window_ms = window.as_millis() as u64, "starting drain");
    let summary = drainer.drain(Deadline::within(window)).await;
    info!(
        processed = summary.processed,
        failed = summary.failed,
        permanent = summary.permanent,
        stopped_reason = %summary.stopped_reason,
        "drain invocation complete"
    );

    maintenance.cancel();

    Ok(())
}

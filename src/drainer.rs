use crate::{
    config::EngineConfig,
    deadline::Deadline,
    limiter::RateLimiter,
    pool::{MessageOutcome, WorkerPool},
    queue::{MAX_WAIT_SECONDS, MailQueue, QueueMessage},
    sender::{SendOutcome, Sender},
    transport::{PooledSmtpClient, SmtpTransport},
};
use derive_more::Display;
use serde::Serialize;
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Stop pulling new batches once less than this remains of the invocation.
const MIN_LOOP_MARGIN: Duration = Duration::from_secs(5);
const EMPTY_POLL_PAUSE: Duration = Duration::from_secs(1);
const BATCH_BREATHER: Duration = Duration::from_millis(100);
const ERROR_PAUSE: Duration = Duration::from_secs(2);
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppedReason {
    #[display("queue_empty")]
    QueueEmpty,
    #[display("timeout")]
    Timeout,
}

#[derive(Debug, Serialize)]
pub struct DrainSummary {
    pub processed: usize,
    pub failed: usize,
    pub permanent: usize,
    pub elapsed_seconds: f64,
    pub stopped_reason: StoppedReason,
}

/// Outcome of one event-driven batch, partitioned so the caller can report
/// partial failures upstream.
#[derive(Debug)]
pub struct BatchReport {
    pub acked: Vec<String>,
    pub retried: Vec<String>,
    pub outcomes: Vec<MessageOutcome>,
}

/// The outer controller: pulls batches from the queue and feeds the worker
/// pool until the queue runs dry or the invocation deadline nears.
pub struct Drainer {
    queue: Arc<dyn MailQueue>,
    pool: WorkerPool,
    sender: Arc<Sender>,
    limiter: Arc<RateLimiter>,
    batch_size: usize,
    empty_poll_threshold: u32,
}

impl Drainer {
    pub fn new(
        queue: Arc<dyn MailQueue>,
        transport: Arc<dyn SmtpTransport>,
        config: &EngineConfig,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.global_rate_per_second,
            config.domain_limits.clone(),
        ));
        let sender = Arc::new(Sender::new(
            transport,
            limiter.clone(),
            config.headers.clone(),
            config.retry.clone(),
            config.idempotency_window_ms,
        ));
        let pool = WorkerPool::new(sender.clone(), queue.clone(), config.max_concurrency);

        Self {
            queue,
            pool,
            sender,
            limiter,
            batch_size: config.batch_size,
            empty_poll_threshold: config.empty_poll_threshold,
        }
    }

    /// Production assembly: SQS queue plus the pooled SMTP client.
    pub async fn from_env_config(config: &EngineConfig) -> Self {
        let queue = Arc::new(crate::queue::sqs::SqsQueue::from_env(config.queue.clone()).await);
        let transport = Arc::new(PooledSmtpClient::new(config.smtp.clone()));

        Self::new(queue, transport, config)
    }

    /// Evict idle limiter state and sweep the idempotency table once a
    /// minute until `cancel` fires.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) {
        let limiter = self.limiter.clone();
        let sender = self.sender.clone();

        crate::run_periodically(
            move || {
                let limiter = limiter.clone();
                let sender = sender.clone();
                async move {
                    limiter.evict_idle();
                    sender.idempotency().sweep();
                    Ok::<(), Infallible>(())
                }
            },
            MAINTENANCE_PERIOD,
            cancel,
        );
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Drain the queue until it stays empty or the deadline nears.
    pub async fn drain(&self, deadline: Deadline) -> DrainSummary {
        let started = tokio::time::Instant::now();
        let mut tally = Tally::default();
        let mut empty_polls = 0u32;

        let stopped_reason = loop {
            let remaining = deadline.remaining();
            if remaining <= MIN_LOOP_MARGIN {
                break StoppedReason::Timeout;
            }
            if empty_polls >= self.empty_poll_threshold {
                break StoppedReason::QueueEmpty;
            }

            let wait = remaining.as_secs().saturating_sub(1).min(MAX_WAIT_SECONDS);

            match self.queue.fetch(self.batch_size, wait).await {
                Ok(messages) if messages.is_empty() => {
                    empty_polls += 1;
                    debug!(empty_polls, "queue poll came back empty");
                    deadline.sleep(EMPTY_POLL_PAUSE).await;
                }
                Ok(messages) => {
                    empty_polls = 0;
                    debug!(count = messages.len(), "dispatching batch");
                    let outcomes = self.pool.dispatch(messages, deadline).await;
                    tally.absorb(&outcomes);
                    deadline.sleep(BATCH_BREATHER).await;
                }
                Err(e) => {
                    error!("queue fetch failed: {e}");
                    deadline.sleep(ERROR_PAUSE).await;
                }
            }
        };

        let summary = DrainSummary {
            processed: tally.processed,
            failed: tally.failed,
            permanent: tally.permanent,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            stopped_reason,
        };

        info!(
            processed = summary.processed,
            failed = summary.failed,
            permanent = summary.permanent,
            elapsed_seconds = summary.elapsed_seconds,
            stopped_reason = %summary.stopped_reason,
            "drain finished"
        );
        if let Ok(stats) = serde_json::to_string(&self.limiter.stats()) {
            debug!(stats, "rate limiter utilization");
        }

        summary
    }

    /// Event-driven entry: process an externally supplied batch once, with
    /// no fetching, and report which messages were settled and which must be
    /// redelivered.
    pub async fn process_batch(
        &self,
        messages: Vec<QueueMessage>,
        deadline: Deadline,
    ) -> BatchReport {
        let outcomes = self.pool.dispatch(messages, deadline).await;

        let mut acked = Vec::new();
        let mut retried = Vec::new();
        for outcome in &outcomes {
            if outcome.outcome.should_ack() {
                acked.push(outcome.queue_message_id.clone());
            } else {
                retried.push(outcome.queue_message_id.clone());
            }
        }

        info!(
            acked = acked.len(),
            retried = retried.len(),
            "processed event batch"
        );

        BatchReport {
            acked,
            retried,
            outcomes,
        }
    }
}

#[derive(Default)]
struct Tally {
    processed: usize,
    failed: usize,
    permanent: usize,
}

impl Tally {
    fn absorb(&mut self, outcomes: &[MessageOutcome]) {
        for outcome in outcomes {
            match outcome.outcome {
                SendOutcome::Sent { .. } | SendOutcome::Skipped { .. } => self.processed += 1,
                SendOutcome::Retryable { .. } => self.failed += 1,
                SendOutcome::Permanent { .. } => self.permanent += 1,
            }
        }
    }
}

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

#[cfg(test)]
pub(crate) mod mock;
pub mod sqs;

/// Hard cap on messages per fetch, dictated by the queue service.
pub const MAX_FETCH: usize = 10;
/// Longest supported long-poll.
pub const MAX_WAIT_SECONDS: u64 = 20;

/// One raw message as fetched from the queue: opaque receipt for ack,
/// UTF-8 JSON body, and string-valued message attributes.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue fetch failed: {0}")]
    Fetch(String),
    #[error("queue ack failed: {0}")]
    Ack(String),
    #[error("dead-letter enqueue failed: {0}")]
    DeadLetter(String),
}

/// The at-least-once source queue and its dead-letter sibling.
///
/// Messages that are fetched but never acked become visible again once the
/// queue's visibility timeout elapses; that redelivery is the engine's whole
/// retry story for transient failures that survive the in-process attempts.
#[async_trait]
pub trait MailQueue: Send + Sync {
    /// Fetch up to `max` messages (capped at [`MAX_FETCH`]), long-polling for
    /// at most `wait_seconds` (clamped to [`MAX_WAIT_SECONDS`]).
    async fn fetch(&self, max: usize, wait_seconds: u64) -> Result<Vec<QueueMessage>, QueueError>;

    /// Remove a message from the source queue.
    async fn ack(&self, receipt: &str) -> Result<(), QueueError>;

    /// Forward a message body and its attributes to the dead-letter queue.
    /// The original must still be acked afterwards by the caller.
    async fn dead_letter(
        &self,
        body: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), QueueError>;
}

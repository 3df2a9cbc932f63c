use crate::{
    deadline::Deadline,
    queue::{MailQueue, QueueMessage},
    request::SendRequest,
    sender::{SendOutcome, Sender},
};
use std::{sync::Arc, time::Duration};
use tracing::{error, warn};

/// Chunks entered with less remaining time than this are refused outright;
/// the messages reappear through the queue's visibility timeout.
const MIN_CHUNK_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct MessageOutcome {
    pub queue_message_id: String,
    pub outcome: SendOutcome,
}

/// Fans a fetched batch out over at most `max_concurrency` concurrent send
/// tasks, one chunk at a time, and takes the queue-side action for each
/// outcome.
pub struct WorkerPool {
    sender: Arc<Sender>,
    queue: Arc<dyn MailQueue>,
    max_concurrency: usize,
}

impl WorkerPool {
    pub fn new(sender: Arc<Sender>, queue: Arc<dyn MailQueue>, max_concurrency: usize) -> Self {
        Self {
            sender,
            queue,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Process `batch` chunk by chunk. A chunk runs fully in parallel and is
    /// awaited before the next one starts; a failing task never aborts its
    /// peers. Outcomes come back in batch order.
    pub async fn dispatch(
        &self,
        batch: Vec<QueueMessage>,
        deadline: Deadline,
    ) -> Vec<MessageOutcome> {
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut messages = batch.into_iter();

        loop {
            let chunk: Vec<QueueMessage> =
                messages.by_ref().take(self.max_concurrency).collect();
            if chunk.is_empty() {
                break;
            }

            if deadline.remaining() < MIN_CHUNK_MARGIN {
                warn!(
                    refused = chunk.len() + messages.len(),
                    "deadline too close, refusing remaining messages"
                );
                for message in chunk.into_iter().chain(messages.by_ref()) {
                    outcomes.push(MessageOutcome {
                        queue_message_id: message.message_id,
                        outcome: SendOutcome::Retryable {
                            last_error: "invocation deadline reached before dispatch".to_owned(),
                            attempts: 0,
                            smtp_code: None,
                        },
                    });
                }
                break;
            }

            let mut handles = Vec::with_capacity(chunk.len());
            for message in chunk {
                let sender = self.sender.clone();
                let queue = self.queue.clone();
                let message_id = message.message_id.clone();

                let handle =
                    tokio::spawn(
                        async move { process_message(sender, queue, message, deadline).await },
                    );
                handles.push((message_id, handle));
            }

            for (message_id, handle) in handles {
                match handle.await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        error!(message_id, "send task died: {e}");
                        outcomes.push(MessageOutcome {
                            queue_message_id: message_id,
                            outcome: SendOutcome::Retryable {
                                last_error: format!("send task died: {e}"),
                                attempts: 0,
                                smtp_code: None,
                            },
                        });
                    }
                }
            }
        }

        outcomes
    }
}

async fn process_message(
    sender: Arc<Sender>,
    queue: Arc<dyn MailQueue>,
    message: QueueMessage,
    deadline: Deadline,
) -> MessageOutcome {
    let outcome = match SendRequest::parse(&message) {
        Ok(request) => sender.send(&request, &deadline).await,
        Err(e) => {
            warn!(
                message_id = message.message_id,
                "unparseable payload, dead-lettering: {e}"
            );
            SendOutcome::Permanent {
                last_error: e.to_string(),
                smtp_code: None,
            }
        }
    };

    take_queue_action(queue.as_ref(), &message, &outcome).await;

    MessageOutcome {
        queue_message_id: message.message_id,
        outcome,
    }
}

/// Ack on Sent/Skipped; dead-letter then ack on Permanent; leave Retryable
/// messages in place for visibility-timeout redelivery. Queue errors are
/// logged and swallowed so one sick message never takes the batch down.
async fn take_queue_action(queue: &dyn MailQueue, message: &QueueMessage, outcome: &SendOutcome) {
    if outcome.is_permanent() {
        if let Err(e) = queue.dead_letter(&message.body, &message.attributes).await {
            // Without a dead-letter copy the original must stay in the queue.
            error!(message_id = message.message_id, "dead-letter failed: {e}");
            return;
        }
    }

    if outcome.should_ack()
        && let Err(e) = queue.ack(&message.receipt).await
    {
        error!(message_id = message.message_id, "ack failed: {e}");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::{DomainLimits, HeaderConfig, RetryConfig},
        limiter::RateLimiter,
        queue::mock::MockQueue,
        transport::mock::MockTransport,
    };
    use std::collections::HashMap;

    fn pool(
        transport: Arc<MockTransport>,
        queue: Arc<MockQueue>,
        max_concurrency: usize,
    ) -> (WorkerPool, Arc<RateLimiter>) {
        let limiter = Arc::new(RateLimiter::new(100, DomainLimits::default()));
        let headers = HeaderConfig {
            from: "news@mail.example.com".to_owned(),
            reply_to: None,
            return_path: None,
            list_unsubscribe: None,
            x_mailer: "mailpump/test".to_owned(),
            custom: Vec::new(),
        };
        let sender = Arc::new(Sender::new(
            transport,
            limiter.clone(),
            headers,
            RetryConfig::default(),
            86_400_000,
        ));

        (WorkerPool::new(sender, queue, max_concurrency), limiter)
    }

    fn message(id: &str, recipient: &str) -> QueueMessage {
        QueueMessage {
            message_id: id.to_owned(),
            receipt: format!("receipt-{id}"),
            body: format!(r#"{{"to":"{recipient}","subject":"hi","text":"hello"}}"#),
            attributes: HashMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_batch_is_sent_and_acked() {
        let transport = Arc::new(MockTransport::accepting());
        let queue = Arc::new(MockQueue::new());
        let (pool, limiter) = pool(transport.clone(), queue.clone(), 10);
        let deadline = Deadline::within(Duration::from_secs(60));

        let batch = vec![
            message("m-1", "a@x.com"),
            message("m-2", "b@y.com"),
            message("m-3", "c@x.com"),
        ];
        let outcomes = pool.dispatch(batch, deadline).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| matches!(o.outcome, SendOutcome::Sent { .. })));
        // Ordered by input batch.
        let ids: Vec<_> = outcomes.iter().map(|o| o.queue_message_id.as_str()).collect();
        assert_eq!(ids, ["m-1", "m-2", "m-3"]);

        assert_eq!(transport.submission_count(), 3);
        assert_eq!(queue.acked().len(), 3);
        assert!(queue.dead_letters().is_empty());

        let stats = limiter.stats();
        assert_eq!(stats.global_in_window, 3);
        assert_eq!(stats.domains["x.com"].in_window, 2);
        assert_eq!(stats.domains["y.com"].in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_dead_lettered_and_acked() {
        let transport = Arc::new(MockTransport::scripted([Err(MockTransport::reply(
            550,
            "5.1.1 no such user",
        ))]));
        let queue = Arc::new(MockQueue::new());
        let (pool, _limiter) = pool(transport, queue.clone(), 10);
        let deadline = Deadline::within(Duration::from_secs(60));

        let mut bounced = message("m-1", "nobody@x.com");
        bounced
            .attributes
            .insert("campaign".to_owned(), "spring".to_owned());
        let original_body = bounced.body.clone();

        let outcomes = pool.dispatch(vec![bounced], deadline).await;
        assert!(outcomes[0].outcome.is_permanent());

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, original_body);
        assert_eq!(dead[0].1["campaign"], "spring");
        assert_eq!(queue.acked(), ["receipt-m-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_payload_goes_to_dead_letter() {
        let transport = Arc::new(MockTransport::accepting());
        let queue = Arc::new(MockQueue::new());
        let (pool, _limiter) = pool(transport.clone(), queue.clone(), 10);
        let deadline = Deadline::within(Duration::from_secs(60));

        let garbage = QueueMessage {
            message_id: "m-bad".to_owned(),
            receipt: "receipt-m-bad".to_owned(),
            body: "not json at all".to_owned(),
            attributes: HashMap::new(),
        };

        let outcomes = pool.dispatch(vec![garbage], deadline).await;

        assert!(outcomes[0].outcome.is_permanent());
        assert_eq!(transport.submission_count(), 0);
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.acked(), ["receipt-m-bad"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_outcome_leaves_message_unacked() {
        let transport = Arc::new(MockTransport::scripted([
            Err(MockTransport::reply(451, "greylisted")),
            Err(MockTransport::reply(451, "greylisted")),
            Err(MockTransport::reply(451, "greylisted")),
        ]));
        let queue = Arc::new(MockQueue::new());
        let (pool, _limiter) = pool(transport, queue.clone(), 10);
        let deadline = Deadline::within(Duration::from_secs(600));

        let outcomes = pool.dispatch(vec![message("m-1", "a@x.com")], deadline).await;

        assert!(matches!(
            outcomes[0].outcome,
            SendOutcome::Retryable { attempts: 3, .. }
        ));
        assert!(queue.acked().is_empty());
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn one_failure_never_aborts_peers() {
        // Sequential chunks of one keep the scripted replies deterministic.
        let transport = Arc::new(MockTransport::scripted([
            Ok(()),
            Err(MockTransport::reply(550, "5.1.1 no such user")),
            Ok(()),
        ]));
        let queue = Arc::new(MockQueue::new());
        let (pool, _limiter) = pool(transport, queue.clone(), 1);
        let deadline = Deadline::within(Duration::from_secs(600));

        let batch = vec![
            message("m-1", "a@x.com"),
            message("m-2", "nobody@x.com"),
            message("m-3", "c@x.com"),
        ];
        let outcomes = pool.dispatch(batch, deadline).await;

        assert!(matches!(outcomes[0].outcome, SendOutcome::Sent { .. }));
        assert!(outcomes[1].outcome.is_permanent());
        assert!(matches!(outcomes[2].outcome, SendOutcome::Sent { .. }));
        assert_eq!(queue.acked().len(), 3);
        assert_eq!(queue.dead_letters().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_deadline_refuses_the_whole_batch() {
        let transport = Arc::new(MockTransport::accepting());
        let queue = Arc::new(MockQueue::new());
        let (pool, _limiter) = pool(transport.clone(), queue.clone(), 10);
        let deadline = Deadline::within(Duration::from_secs(4));

        let batch: Vec<QueueMessage> = (0..20)
            .map(|i| message(&format!("m-{i}"), "a@x.com"))
            .collect();
        let outcomes = pool.dispatch(batch, deadline).await;

        assert_eq!(outcomes.len(), 20);
        assert!(outcomes.iter().all(|o| matches!(
            o.outcome,
            SendOutcome::Retryable { attempts: 0, .. }
        )));
        assert_eq!(transport.submission_count(), 0);
        assert!(queue.acked().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn later_chunks_are_refused_once_the_deadline_nears() {
        let transport = Arc::new(MockTransport::accepting());
        let queue = Arc::new(MockQueue::new());
        let (pool, _limiter) = pool(transport.clone(), queue.clone(), 2);
        // Enough for the first chunk; the gmail pre-send jitter (at least
        // 50 ms) pushes the second chunk past the margin.
        let deadline = Deadline::within(Duration::from_millis(5_049));

        let batch = vec![
            message("m-1", "a@gmail.com"),
            message("m-2", "b@gmail.com"),
            message("m-3", "c@gmail.com"),
            message("m-4", "d@gmail.com"),
        ];
        let outcomes = pool.dispatch(batch, deadline).await;

        assert!(matches!(outcomes[0].outcome, SendOutcome::Sent { .. }));
        assert!(matches!(outcomes[1].outcome, SendOutcome::Sent { .. }));
        assert!(matches!(outcomes[2].outcome, SendOutcome::Retryable { .. }));
        assert!(matches!(outcomes[3].outcome, SendOutcome::Retryable { .. }));
        assert_eq!(transport.submission_count(), 2);
    }
}

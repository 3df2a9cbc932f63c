use crate::{
    config::{HeaderConfig, RetryConfig},
    deadline::Deadline,
    idempotency::IdempotencyTable,
    limiter::{DEFAULT_COOLDOWN, RateLimiter},
    request::{ContentKind, SendRequest},
    transport::{Envelope, SmtpTransport},
};
use body::TextExtractor;
use chrono::Utc;
use classify::{Classifier, ErrorClass};
use derive_more::Display;
use mail_send::mail_builder::{MessageBuilder, headers::raw::Raw};
use rand::{Rng, distr::Alphanumeric};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

mod body;
mod classify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SkipReason {
    #[display("idempotent_duplicate")]
    IdempotentDuplicate,
}

/// The single terminal result of handling one [`SendRequest`].
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent {
        smtp_message_id: String,
        attempts: u32,
    },
    Skipped {
        reason: SkipReason,
    },
    Retryable {
        last_error: String,
        attempts: u32,
        smtp_code: Option<u16>,
    },
    Permanent {
        last_error: String,
        smtp_code: Option<u16>,
    },
}

impl SendOutcome {
    /// Whether the original queue message should be acknowledged. Retryable
    /// outcomes leave the message in place for visibility-timeout redelivery.
    pub fn should_ack(&self) -> bool {
        !matches!(self, Self::Retryable { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::Skipped { .. } => "skipped",
            Self::Retryable { .. } => "retryable",
            Self::Permanent { .. } => "permanent",
        }
    }
}

/// Assembles and submits outgoing mail: idempotency gate, rate-limit gate,
/// header construction, classified retries with capped backoff.
pub struct Sender {
    transport: Arc<dyn SmtpTransport>,
    limiter: Arc<RateLimiter>,
    idempotency: IdempotencyTable,
    headers: HeaderConfig,
    retry: RetryConfig,
    text: TextExtractor,
    classifier: Classifier,
}

impl Sender {
    pub fn new(
        transport: Arc<dyn SmtpTransport>,
        limiter: Arc<RateLimiter>,
        headers: HeaderConfig,
        retry: RetryConfig,
        idempotency_window_ms: i64,
    ) -> Self {
        Self {
            transport,
            limiter,
            idempotency: IdempotencyTable::new(idempotency_window_ms),
            headers,
            retry,
            text: TextExtractor::new(),
            classifier: Classifier::new(),
        }
    }

    pub fn idempotency(&self) -> &IdempotencyTable {
        &self.idempotency
    }

    #[tracing::instrument(
        skip(self, request, deadline),
        fields(queue_message_id = %request.queue_message_id, recipient = %request.recipient)
    )]
    pub async fn send(&self, request: &SendRequest, deadline: &Deadline) -> SendOutcome {
        if self.idempotency.is_duplicate(&request.fingerprint) {
            debug!("duplicate within idempotency window, skipping");
            return SendOutcome::Skipped {
                reason: SkipReason::IdempotentDuplicate,
            };
        }

        self.limiter.wait_until_allowed(&request.recipient).await;

        let domain = request.domain();
        presend_jitter(&domain).await;

        let mail_from = self
            .headers
            .return_path
            .as_deref()
            .unwrap_or(&self.headers.from);

        let mut attempt = 1u32;
        loop {
            let message_id = self.message_id();
            let body = match self.render(request, &message_id) {
                Ok(body) => body,
                Err(e) => {
                    return SendOutcome::Permanent {
                        last_error: format!("failed to render message: {e}"),
                        smtp_code: None,
                    };
                }
            };

            let result = self
                .transport
                .submit(Envelope {
                    mail_from,
                    rcpt_to: &request.recipient,
                    body: &body,
                })
                .await;

            let err = match result {
                Ok(()) => {
                    self.idempotency.record(&request.fingerprint);
                    self.limiter.record_send(&domain);
                    info!(domain, attempt, "message delivered to relay");
                    return SendOutcome::Sent {
                        smtp_message_id: message_id,
                        attempts: attempt,
                    };
                }
                Err(err) => err,
            };

            let smtp_code = err.smtp_code();
            let class = self.classifier.classify(&err);

            if matches!(class, ErrorClass::Retryable { cooldown: true }) {
                warn!(domain, "provider signalled rate limiting, cooling domain down");
                self.limiter.set_cooldown(&domain, DEFAULT_COOLDOWN);
            }

            match class {
                ErrorClass::Permanent => {
                    warn!(domain, attempt, %err, "permanent delivery failure");
                    return SendOutcome::Permanent {
                        last_error: err.to_string(),
                        smtp_code,
                    };
                }
                ErrorClass::Retryable { .. } if attempt >= self.retry.max_attempts => {
                    warn!(domain, attempt, %err, "out of delivery attempts");
                    return SendOutcome::Retryable {
                        last_error: err.to_string(),
                        attempts: attempt,
                        smtp_code,
                    };
                }
                ErrorClass::Retryable { .. } => {
                    let delay = backoff_delay(attempt, &self.retry);
                    debug!(domain, attempt, delay_ms = delay.as_millis() as u64, %err,
                        "transient delivery failure, backing off");

                    if !deadline.sleep(delay).await {
                        return SendOutcome::Retryable {
                            last_error: format!("deadline expired during retry backoff: {err}"),
                            attempts: attempt,
                            smtp_code,
                        };
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// `<{unix_ms}.{12 random alphanumerics}@{sender_domain}>`, fresh per
    /// attempt.
    fn message_id(&self) -> String {
        let token: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();

        format!(
            "{}.{}@{}",
            Utc::now().timestamp_millis(),
            token,
            self.headers.sender_domain()
        )
    }

    fn render(&self, request: &SendRequest, message_id: &str) -> std::io::Result<Vec<u8>> {
        // Small random perturbation of the Date header defeats bulk-pattern
        // detection on the receiving side.
        let date = (Utc::now()
            + chrono::Duration::milliseconds(rand::rng().random_range(-30_000..=30_000)))
        .to_rfc2822();

        let mut builder = MessageBuilder::new()
            .from(self.headers.from.as_str())
            .to(request.recipient.as_str())
            .subject(request.subject.as_str())
            .header("Message-ID", Raw::new(format!("<{message_id}>")))
            .header("Date", Raw::new(date))
            .header("MIME-Version", Raw::new("1.0"))
            .header("X-Mailer", Raw::new(self.headers.x_mailer.clone()));

        if let Some(reply_to) = &self.headers.reply_to {
            builder = builder.reply_to(reply_to.as_str());
        }
        if let Some(return_path) = &self.headers.return_path {
            builder = builder.header("Return-Path", Raw::new(format!("<{return_path}>")));
        }
        if let Some(unsubscribe) = &self.headers.list_unsubscribe {
            builder = builder
                .header("List-Unsubscribe", Raw::new(unsubscribe.clone()))
                .header(
                    "List-Unsubscribe-Post",
                    Raw::new("List-Unsubscribe=One-Click"),
                );
        }
        for (name, value) in &self.headers.custom {
            builder = builder.header(name.clone(), Raw::new(value.clone()));
        }

        builder = match request.content_kind {
            ContentKind::Html => builder
                .html_body(request.body.as_str())
                .text_body(self.text.plain_text_of(&request.body)),
            ContentKind::Text => builder.text_body(request.body.as_str()),
        };

        builder.write_to_vec()
    }
}

/// Short randomized pause before every submission. Google's receivers are
/// the most aggressive pattern detectors, so they get a wider band.
async fn presend_jitter(domain: &str) {
    let jitter = match domain {
        "gmail.com" | "googlemail.com" => rand::rng().random_range(50..=250),
        _ => rand::rng().random_range(0..=100),
    };

    if jitter > 0 {
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }
}

/// Capped exponential backoff with additive uniform jitter:
/// `min(initial * 2^(attempt-1) + uniform(0, 0.3 * initial * 2^(attempt-1)), max)`.
fn backoff_delay(attempt: u32, retry: &RetryConfig) -> Duration {
    let base = retry
        .initial_delay
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter = base.mul_f64(0.3 * rand::rng().random::<f64>());

    (base + jitter).min(retry.max_delay)
}

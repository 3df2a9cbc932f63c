use crate::transport::TransportError;
use regex::Regex;

/// Terminal failure classes. Retryable failures rely on the queue's
/// visibility timeout; permanent ones are routed to the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    Retryable {
        /// The provider signalled rate limiting; block the domain for a while.
        cooldown: bool,
    },
    Permanent,
}

pub(crate) struct Classifier {
    deferral_text: Regex,
    rate_limit_text: Regex,
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            deferral_text: Regex::new(
                r"(?i)rate limit|too many|quota|exceeded|temporarily deferred",
            )
            .expect("static regex"),
            rate_limit_text: Regex::new(r"(?i)rate limit").expect("static regex"),
        }
    }

    /// Classify a failed submission. Reply codes are checked before reply
    /// text, except that the deferral patterns outrank the permanent codes:
    /// providers routinely wrap throttling in 5xx replies ("550 daily sending
    /// quota exceeded"), and treating those as permanent would dead-letter
    /// mail that delivers fine an hour later.
    pub fn classify(&self, error: &TransportError) -> ErrorClass {
        let TransportError::Reply { code, message } = error else {
            // Connection resets, DNS failures, timeouts: all worth a retry.
            return ErrorClass::Retryable { cooldown: false };
        };

        let cooldown = *code == 421 || self.rate_limit_text.is_match(message);

        match *code {
            421 => ErrorClass::Retryable { cooldown },
            450 | 451 | 452 => ErrorClass::Retryable { cooldown },
            _ if self.deferral_text.is_match(message) => ErrorClass::Retryable { cooldown },
            550 | 551 | 552 => ErrorClass::Permanent,
            _ => ErrorClass::Retryable { cooldown },
        }
    }
}

use crate::Environment;
use derive_more::FromStr;
use std::{collections::HashMap, env, str::FromStr as _, time::Duration};
use tracing::warn;

const MAX_CONCURRENCY_CAP: usize = 50;
const BATCH_SIZE_CAP: usize = 10;

fn env_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            panic!("Invalid {key} environment variable: {raw:?}");
        }),
        Err(_) => default,
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Retry ceiling and backoff bounds for a single message.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_or("MAX_ATTEMPTS", 3),
            initial_delay: Duration::from_millis(env_or("INITIAL_RETRY_MS", 1_000)),
            max_delay: Duration::from_millis(env_or("MAX_RETRY_MS", 60_000)),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, FromStr)]
pub enum TlsMode {
    /// Plain connection upgraded with STARTTLS.
    #[default]
    StartTls,
    /// TLS from the first byte.
    Implicit,
    /// No TLS at all. Development only.
    Plain,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsMode,
    pub ehlo_domain: Option<String>,
    pub max_connections: usize,
    /// Submissions per connection before it is recycled.
    pub max_messages: u32,
    pub connect_timeout: Duration,
    pub greeting_timeout: Duration,
    pub socket_timeout: Duration,
}

impl SmtpConfig {
    pub fn from_env(environment: Environment) -> Self {
        let tls: TlsMode = env_or("SMTP_TLS", TlsMode::StartTls);
        if matches!(tls, TlsMode::Plain) && !matches!(environment, Environment::Development) {
            panic!("SMTP_TLS=plain is only allowed in development");
        }

        Self {
            host: env::var("SMTP_HOST").expect("SMTP_HOST must be set"),
            port: env_or("SMTP_PORT", 587),
            username: env_opt("SMTP_USERNAME"),
            password: env_opt("SMTP_PASSWORD"),
            tls,
            ehlo_domain: env_opt("SMTP_EHLO_DOMAIN"),
            max_connections: env_or("SMTP_POOL_MAX_CONNECTIONS", 10),
            max_messages: env_or("SMTP_POOL_MAX_MESSAGES", 50),
            connect_timeout: Duration::from_millis(env_or("SMTP_CONNECT_TIMEOUT_MS", 15_000)),
            greeting_timeout: Duration::from_millis(env_or("SMTP_GREETING_TIMEOUT_MS", 10_000)),
            socket_timeout: Duration::from_millis(env_or("SMTP_SOCKET_TIMEOUT_MS", 30_000)),
        }
    }
}

/// Outgoing header material: sender identity plus the optional
/// deliverability headers.
#[derive(Debug, Clone)]
pub struct HeaderConfig {
    pub from: String,
    pub reply_to: Option<String>,
    pub return_path: Option<String>,
    pub list_unsubscribe: Option<String>,
    pub x_mailer: String,
    pub custom: Vec<(String, String)>,
}

impl HeaderConfig {
    pub fn from_env() -> Self {
        Self {
            from: env::var("SMTP_FROM").expect("SMTP_FROM must be set"),
            reply_to: env_opt("SMTP_REPLY_TO"),
            return_path: env_opt("SMTP_RETURN_PATH"),
            list_unsubscribe: env_opt("SMTP_LIST_UNSUBSCRIBE"),
            x_mailer: env_or("SMTP_X_MAILER", concat!("mailpump/", env!("CARGO_PKG_VERSION")).to_string()),
            custom: env_opt("SMTP_CUSTOM_HEADERS")
                .map(|raw| parse_pairs(&raw))
                .unwrap_or_default(),
        }
    }

    /// Host part of the configured From address, used for Message-ID domains.
    pub fn sender_domain(&self) -> &str {
        self.from
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or("localhost")
    }
}

/// Per-recipient-domain sends-per-minute ceilings. The `"default"` entry is
/// reserved and applies to every domain without an explicit row.
#[derive(Debug, Clone)]
pub struct DomainLimits {
    table: HashMap<String, usize>,
    default: usize,
}

impl Default for DomainLimits {
    fn default() -> Self {
        // Provider thresholds; exceeding these gets outbound IPs throttled.
        let table = HashMap::from([
            ("gmail.com".to_owned(), 15),
            ("googlemail.com".to_owned(), 15),
            ("outlook.com".to_owned(), 20),
            ("hotmail.com".to_owned(), 20),
            ("live.com".to_owned(), 20),
            ("msn.com".to_owned(), 20),
            ("yahoo.com".to_owned(), 25),
            ("aol.com".to_owned(), 25),
        ]);

        Self { table, default: 30 }
    }
}

impl DomainLimits {
    pub fn from_env() -> Self {
        let mut limits = Self::default();
        if let Some(raw) = env_opt("DOMAIN_LIMITS") {
            for (domain, value) in parse_pairs(&raw) {
                match usize::from_str(&value) {
                    Ok(limit) if domain == "default" => limits.default = limit,
                    Ok(limit) => {
                        limits.table.insert(domain.to_lowercase(), limit);
                    }
                    Err(_) => warn!(domain, value, "ignoring unparseable DOMAIN_LIMITS entry"),
                }
            }
        }
        limits
    }

    pub fn limit_for(&self, domain: &str) -> usize {
        self.table.get(domain).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue_url: String,
    pub dead_letter_url: String,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            queue_url: env::var("QUEUE_URL").expect("QUEUE_URL must be set"),
            dead_letter_url: env::var("DEAD_LETTER_QUEUE_URL")
                .expect("DEAD_LETTER_QUEUE_URL must be set"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub environment: Environment,
    pub global_rate_per_second: usize,
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub empty_poll_threshold: u32,
    pub drain_buffer: Duration,
    pub idempotency_window_ms: i64,
    pub retry: RetryConfig,
    pub smtp: SmtpConfig,
    pub headers: HeaderConfig,
    pub domain_limits: DomainLimits,
    pub queue: QueueConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let environment = Environment::from_env();

        let mut max_concurrency: usize = env_or("MAX_CONCURRENCY", 10);
        if max_concurrency > MAX_CONCURRENCY_CAP {
            warn!(max_concurrency, "MAX_CONCURRENCY capped at {MAX_CONCURRENCY_CAP}");
            max_concurrency = MAX_CONCURRENCY_CAP;
        }

        let mut batch_size: usize = env_or("BATCH_SIZE", 10);
        if batch_size > BATCH_SIZE_CAP {
            warn!(batch_size, "BATCH_SIZE capped at {BATCH_SIZE_CAP}");
            batch_size = BATCH_SIZE_CAP;
        }

        Self {
            environment,
            global_rate_per_second: env_or("GLOBAL_RATE_PER_SECOND", 35),
            max_concurrency,
            batch_size,
            empty_poll_threshold: env_or("EMPTY_POLL_THRESHOLD", 3),
            drain_buffer: Duration::from_millis(env_or("DRAIN_BUFFER_MS", 60_000)),
            idempotency_window_ms: env_or("IDEMPOTENCY_WINDOW_MS", 86_400_000),
            retry: RetryConfig::from_env(),
            smtp: SmtpConfig::from_env(environment),
            headers: HeaderConfig::from_env(),
            domain_limits: DomainLimits::from_env(),
            queue: QueueConfig::from_env(),
        }
    }
}

/// Parse `key=value,key=value` lists, as used by `DOMAIN_LIMITS` and
/// `SMTP_CUSTOM_HEADERS`.
fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            match entry.split_once('=') {
                Some((key, value)) => Some((key.trim().to_owned(), value.trim().to_owned())),
                None => {
                    warn!(entry, "ignoring malformed key=value entry");
                    None
                }
            }
        })
        .collect()
}

use crate::config::{SmtpConfig, TlsMode};
use async_trait::async_trait;
use mail_send::{SmtpClient, SmtpClientBuilder, smtp};
use std::{fmt::Display, sync::Mutex};
use thiserror::Error;
use tokio::{net::TcpStream, sync::Semaphore};
use tokio_rustls::{
    client::TlsStream,
    rustls::{crypto, crypto::CryptoProvider},
};
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    /// The server answered with a definite SMTP reply code.
    #[error("smtp {code}: {message}")]
    Reply { code: u16, message: String },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("timed out talking to the SMTP server")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport misconfigured: {0}")]
    Config(String),
}

impl TransportError {
    pub fn smtp_code(&self) -> Option<u16> {
        match self {
            Self::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<mail_send::Error> for TransportError {
    fn from(err: mail_send::Error) -> Self {
        match err {
            mail_send::Error::Io(e) => Self::Connection(e.to_string()),
            mail_send::Error::Tls(e) => Self::Tls(e.to_string()),
            mail_send::Error::Timeout => Self::Timeout,
            mail_send::Error::UnexpectedReply(response)
            | mail_send::Error::AuthenticationFailed(response) => Self::Reply {
                code: response.code,
                message: response.message,
            },
            mail_send::Error::UnparseableReply => Self::Protocol("unparseable reply".to_owned()),
            mail_send::Error::Base64(e) => Self::Protocol(e.to_string()),
            mail_send::Error::Auth(e) => Self::Protocol(e.to_string()),
            mail_send::Error::InvalidTLSName => Self::Config("invalid TLS name".to_owned()),
            mail_send::Error::MissingCredentials => Self::Config("missing credentials".to_owned()),
            mail_send::Error::MissingMailFrom => Self::Config("missing MAIL FROM".to_owned()),
            mail_send::Error::MissingRcptTo => Self::Config("missing RCPT TO".to_owned()),
            mail_send::Error::UnsupportedAuthMechanism => {
                Self::Config("unsupported auth mechanism".to_owned())
            }
            mail_send::Error::MissingStartTls => {
                Self::Config("server does not offer STARTTLS".to_owned())
            }
        }
    }
}

/// One outgoing submission: envelope sender, a single recipient, and the
/// fully rendered message.
pub struct Envelope<'a> {
    pub mail_from: &'a str,
    pub rcpt_to: &'a str,
    pub body: &'a [u8],
}

#[async_trait]
pub trait SmtpTransport: Send + Sync {
    async fn submit(&self, envelope: Envelope<'_>) -> Result<(), TransportError>;
}

enum Connection {
    Tls(SmtpClient<TlsStream<TcpStream>>),
    Plain(SmtpClient<TcpStream>),
}

impl Connection {
    async fn send(&mut self, message: smtp::message::Message<'_>) -> mail_send::Result<()> {
        match self {
            Self::Tls(client) => client.send(message).await,
            Self::Plain(client) => client.send(message).await,
        }
    }

    async fn quit(self, hostname: impl Display) {
        let result = match self {
            Self::Tls(client) => client.quit().await,
            Self::Plain(client) => client.quit().await,
        };
        result
            .inspect_err(|err| {
                warn!("failed to close upstream SMTP connection with {hostname}: {err}");
            })
            .ok();
    }
}

struct PooledConnection {
    conn: Connection,
    sent: u32,
}

/// Keep-alive SMTP client pool over the configured relay: at most
/// `max_connections` open at a time, each recycled after `max_messages`
/// submissions.
pub struct PooledSmtpClient {
    config: SmtpConfig,
    idle: Mutex<Vec<PooledConnection>>,
    slots: Semaphore,
}

impl PooledSmtpClient {
    pub fn new(config: SmtpConfig) -> Self {
        if CryptoProvider::get_default().is_none() {
            // Losing the install race to another thread is fine.
            CryptoProvider::install_default(crypto::aws_lc_rs::default_provider()).ok();
        }

        Self {
            slots: Semaphore::new(config.max_connections),
            idle: Mutex::new(Vec::new()),
            config,
        }
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let mut builder = SmtpClientBuilder::new(self.config.host.clone(), self.config.port)
            .timeout(self.config.socket_timeout)
            .say_ehlo(true);

        if let Some(domain) = &self.config.ehlo_domain {
            builder = builder.helo_host(domain.clone());
        }
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            builder = builder.credentials((username.clone(), password.clone()));
        }

        // Connect and EHLO greeting share one setup budget.
        let setup = self.config.connect_timeout + self.config.greeting_timeout;

        let connection = match self.config.tls {
            TlsMode::Plain => {
                let client = tokio::time::timeout(setup, builder.connect_plain())
                    .await
                    .map_err(|_| TransportError::Timeout)??;
                trace!(host = self.config.host, "INSECURELY connected to relay");
                Connection::Plain(client)
            }
            mode => {
                let builder = builder.implicit_tls(matches!(mode, TlsMode::Implicit));
                let client = tokio::time::timeout(setup, builder.connect())
                    .await
                    .map_err(|_| TransportError::Timeout)??;
                trace!(host = self.config.host, "securely connected to relay");
                Connection::Tls(client)
            }
        };

        Ok(connection)
    }

    fn checkout(&self) -> Option<PooledConnection> {
        self.idle.lock().expect("connection pool lock poisoned").pop()
    }

    fn checkin(&self, pooled: PooledConnection) {
        self.idle
            .lock()
            .expect("connection pool lock poisoned")
            .push(pooled);
    }
}

#[async_trait]
impl SmtpTransport for PooledSmtpClient {
    async fn submit(&self, envelope: Envelope<'_>) -> Result<(), TransportError> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| TransportError::Connection("connection pool closed".to_owned()))?;

        let mut pooled = match self.checkout() {
            Some(pooled) => pooled,
            None => PooledConnection {
                conn: self.connect().await?,
                sent: 0,
            },
        };

        let message = smtp::message::Message {
            mail_from: envelope.mail_from.into(),
            rcpt_to: vec![envelope.rcpt_to.into()],
            body: envelope.body.into(),
        };

        match pooled.conn.send(message).await {
            Ok(()) => {
                pooled.sent += 1;
                if pooled.sent < self.config.max_messages {
                    self.checkin(pooled);
                } else {
                    debug!(
                        sent = pooled.sent,
                        "recycling SMTP connection after message cap"
                    );
                    pooled.conn.quit(&self.config.host).await;
                }
                Ok(())
            }
            Err(err) => {
                // State of the connection is unknown after a failure; tear it
                // down rather than returning it to the pool.
                pooled.conn.quit(&self.config.host).await;
                Err(err.into())
            }
        }
    }
}

//! SMTP delivery.
//!
//! [`SmtpMailer`] wraps a lettre `AsyncSmtpTransport` whose pool is capped at a
//! single connection, so one SMTP session is opened at startup and reused for
//! every message. Transport errors never escape [`Mailer::send`]; they come
//! back as [`DeliveryOutcome::Failed`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, Message},
    transport::smtp::PoolConfig,
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use thiserror::Error;
use tracing::{error, info};

/// Result of a single send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryOutcome::Sent)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Sent => f.write_str("sent"),
            DeliveryOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Startup failure of the SMTP session.
#[derive(Debug, Error)]
pub enum MailerError {
    #[error("SMTP server {host}:{port} is unreachable: {source}")]
    Unreachable {
        host: String,
        port: u16,
        #[source]
        source: lettre::transport::smtp::Error,
    },

    #[error("SMTP server {host}:{port} did not answer NOOP")]
    NotReady { host: String, port: u16 },
}

/// Sends one email per call.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        message: &str,
        from_address: &str,
        to_address: &str,
        subject: &str,
    ) -> DeliveryOutcome;
}

/// Plain SMTP mailer with one persistent session.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    port: u16,
}

impl SmtpMailer {
    /// Build the transport without touching the network.
    ///
    /// Uses an unencrypted, unauthenticated connection.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .timeout(Some(timeout))
            .pool_config(PoolConfig::new().min_idle(0).max_size(1))
            .build();

        Self {
            transport,
            host: host.to_string(),
            port,
        }
    }

    /// Build the transport and open the session.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, MailerError> {
        let mailer = Self::new(host, port, timeout);

        info!(smtp_host = %host, smtp_port = port, "smtp_connecting");

        match mailer.transport.test_connection().await {
            Ok(true) => {
                info!(smtp_host = %host, smtp_port = port, "smtp_connected");
                Ok(mailer)
            }
            Ok(false) => Err(MailerError::NotReady {
                host: host.to_string(),
                port,
            }),
            Err(source) => Err(MailerError::Unreachable {
                host: host.to_string(),
                port,
                source,
            }),
        }
    }

    /// Release the SMTP session.
    pub fn close(self) {
        drop(self.transport);
        info!(smtp_host = %self.host, smtp_port = self.port, "smtp_closed");
    }
}

/// Build a single-part plain-text email.
pub fn build_email(
    message: &str,
    from_address: &str,
    to_address: &str,
    subject: &str,
) -> Result<Message, String> {
    let from: Mailbox = from_address
        .parse()
        .map_err(|e| format!("invalid sender address: {e}"))?;
    let to: Mailbox = to_address
        .parse()
        .map_err(|e| format!("invalid recipient address: {e}"))?;

    Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(message.to_string())
        .map_err(|e| format!("failed to build email: {e}"))
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        message: &str,
        from_address: &str,
        to_address: &str,
        subject: &str,
    ) -> DeliveryOutcome {
        let email = match build_email(message, from_address, to_address, subject) {
            Ok(email) => email,
            Err(reason) => {
                error!(from = %from_address, to = %to_address, error = %reason, "smtp_build_failed");
                return DeliveryOutcome::Failed(reason);
            }
        };

        match self.transport.send(email).await {
            Ok(response) => {
                info!(
                    to = %to_address,
                    smtp_code = %response.code(),
                    "smtp_sent"
                );
                DeliveryOutcome::Sent
            }
            Err(e) => {
                let kind = if e.is_permanent() {
                    "permanent"
                } else if e.is_transient() {
                    "transient"
                } else {
                    "transport"
                };

                error!(
                    smtp_host = %self.host,
                    smtp_port = self.port,
                    to = %to_address,
                    kind = kind,
                    error = %e,
                    "smtp_send_failed"
                );
                DeliveryOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SmtpMailer>();
    }

    #[test]
    fn test_build_email_headers() {
        let email = build_email("hello there", "a@x.com", "b@x.com", "Greetings").unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();

        assert!(raw.contains("From: a@x.com"));
        assert!(raw.contains("To: b@x.com"));
        assert!(raw.contains("Subject: Greetings"));
        assert!(raw.contains("Content-Type: text/plain"));
        assert!(raw.contains("hello there"));
    }

    #[test]
    fn test_build_email_invalid_recipient() {
        let err = build_email("m", "a@x.com", "nope", "s").unwrap_err();
        assert!(err.contains("recipient"));
    }

    #[tokio::test]
    async fn test_send_invalid_address_is_failed_without_network() {
        let mailer = SmtpMailer::new("127.0.0.1", 1, Duration::from_secs(1));
        let outcome = mailer.send("m", "bad sender", "b@x.com", "s").await;
        assert!(matches!(outcome, DeliveryOutcome::Failed(ref r) if r.contains("sender")));
    }

    #[tokio::test]
    async fn test_send_to_closed_port_is_failed() {
        // Port 1 on loopback refuses connections.
        let mailer = SmtpMailer::new("127.0.0.1", 1, Duration::from_secs(2));
        let outcome = mailer.send("m", "a@x.com", "b@x.com", "s").await;
        assert!(!outcome.is_sent());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_errors() {
        let result = SmtpMailer::connect("127.0.0.1", 1, Duration::from_secs(2)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(DeliveryOutcome::Sent.to_string(), "sent");
        assert_eq!(
            DeliveryOutcome::Failed("boom".to_string()).to_string(),
            "failed: boom"
        );
    }
}

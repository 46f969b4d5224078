//! Configuration module for environment variable parsing.
//!
//! A `.env` file in the working directory is loaded first (if present), then
//! every value is read from the process environment. Missing required values
//! are reported as [`ConfigError`] so the binary can exit before it touches
//! the broker.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use lapin::uri::AMQPUri;
use thiserror::Error;
use tracing::warn;

use crate::dispatcher::FailurePolicy;

/// Default number of delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {var}")]
    Missing { var: &'static str },

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Deployment environment. Only affects log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    /// Default tracing directive for this environment.
    pub fn default_log_directive(self) -> &'static str {
        match self {
            Environment::Dev => "info",
            Environment::Prod => "error",
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(format!("expected \"dev\" or \"prod\", got {other:?}")),
        }
    }
}

/// RabbitMQ connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// RabbitMQ host
    pub host: String,

    /// RabbitMQ port
    pub port: u16,

    /// RabbitMQ username
    pub username: String,

    /// RabbitMQ password
    pub password: String,
}

impl BrokerConfig {
    /// Read `AMQP_HOST`, `AMQP_PORT`, `AMQP_USERNAME` and `AMQP_PASSWORD`.
    pub fn from_vars() -> Result<Self, ConfigError> {
        Ok(BrokerConfig {
            host: required("AMQP_HOST")?,
            port: required_parsed("AMQP_PORT")?,
            username: required("AMQP_USERNAME")?,
            password: required("AMQP_PASSWORD")?,
        })
    }

    /// Build the broker URI from its parts.
    pub fn amqp_uri(&self) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = self.host.clone();
        uri.authority.port = self.port;
        uri.authority.userinfo.username = self.username.clone();
        uri.authority.userinfo.password = self.password.clone();
        uri
    }
}

/// Relay configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,

    /// SMTP server host
    pub smtp_host: String,

    /// SMTP server port
    pub smtp_port: u16,

    /// Timeout applied to every SMTP command
    pub smtp_timeout: Duration,

    /// Deployment environment (log verbosity)
    pub environment: Environment,

    /// What to do with a message whose email could not be sent
    pub failure_policy: FailurePolicy,

    /// Delay before the second attempt, doubling on each later one
    pub retry_delay: Duration,

    /// Consumer tag announced to the broker
    pub consumer_tag: String,
}

impl Config {
    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Self::from_vars()
    }

    /// Load configuration from the process environment only.
    pub fn from_vars() -> Result<Self, ConfigError> {
        let max_attempts: u32 = optional("MAX_DELIVERY_ATTEMPTS", DEFAULT_MAX_DELIVERY_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_DELIVERY_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let failure_policy = match env::var("FAILED_DELIVERY_POLICY") {
            Err(_) => FailurePolicy::Requeue { max_attempts },
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "requeue" | "retry" => FailurePolicy::Requeue { max_attempts },
                "drop" | "ack" => FailurePolicy::Drop,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "FAILED_DELIVERY_POLICY",
                        value: raw,
                        reason: "expected \"requeue\" or \"drop\"".to_string(),
                    })
                }
            },
        };

        Ok(Config {
            broker: BrokerConfig::from_vars()?,
            smtp_host: required("SMTP_HOST")?,
            smtp_port: required_parsed("SMTP_PORT")?,
            smtp_timeout: Duration::from_secs(optional("SMTP_TIMEOUT_SECS", 30)?),
            environment: required_parsed("ENVIRONMENT")?,
            failure_policy,
            retry_delay: Duration::from_millis(optional("RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS)?),
            consumer_tag: env::var("CONSUMER_TAG")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "notification-relay".to_string()),
        })
    }
}

/// Settings for the `notification-publish` test utility.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub broker: BrokerConfig,

    /// Recipient of test notifications
    pub to_address: String,

    /// Sender of test notifications
    pub from_address: String,
}

impl PublishConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Ok(PublishConfig {
            broker: BrokerConfig::from_vars()?,
            to_address: required("PUBLISH_TO")?,
            from_address: env::var("PUBLISH_FROM")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "notificationservice@mail.com".to_string()),
        })
    }
}

fn load_dotenv() {
    // A missing .env file is the normal case in containers.
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!(error = %e, "dotenv_load_failed");
        }
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing { var }),
    }
}

fn required_parsed<T>(var: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = required(var)?;
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

/// Parse an optional variable, falling back to `default` when unset.
///
/// A set but unparsable value is an error rather than a silent default.
fn optional<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) if raw.trim().is_empty() => {
            warn!(env_var = var, "Empty value, using default");
            Ok(default)
        }
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

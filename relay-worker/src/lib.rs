//! Notification relay - RabbitMQ to SMTP.
//!
//! This library provides the modules for the two binaries:
//! - `notification-relay`: Consumes notifications and sends them as email
//! - `notification-publish`: Publishes a test notification
//!
//! ## Architecture
//!
//! ```text
//! notifications exchange → notification_queue → Consumer → Dispatcher → Mailer → SMTP
//!                                                   ↑            │
//!                                                   └─ ack / retry / dead-letter
//! ```

pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod mailer;
pub mod queue;

// Re-export commonly used types
pub use config::{BrokerConfig, Config, ConfigError, Environment, PublishConfig};
pub use consumer::{Consumer, ConsumerState};
pub use dispatcher::{Dispatcher, Disposition, FailurePolicy};
pub use mailer::{DeliveryOutcome, Mailer, MailerError, SmtpMailer};
pub use queue::{
    Broker, BrokerError, InMemoryBroker, InboundMessage, NotificationPayload, Publisher,
    RabbitMqBroker, ValidationError, NOTIFICATION_EXCHANGE, NOTIFICATION_QUEUE,
};

//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - Topology names and message types
//! - The [`Broker`] trait with RabbitMQ and in-memory implementations
//! - An async publisher for enqueueing notifications
//!
//! ## Architecture
//!
//! ```text
//! Publisher → notifications exchange → notification_queue → Relay → SMTP
//! ```

pub mod broker;
pub mod memory;
pub mod publisher;
pub mod rabbitmq;
pub mod types;

pub use broker::{Broker, BrokerError};
pub use memory::{InMemoryBroker, Settlement};
pub use publisher::Publisher;
pub use rabbitmq::RabbitMqBroker;
pub use types::{
    InboundMessage, NotificationPayload, ValidationError, ATTEMPT_HEADER, DEAD_LETTER_EXCHANGE,
    DEAD_LETTER_QUEUE, NOTIFICATION_EXCHANGE, NOTIFICATION_QUEUE, NOTIFICATION_ROUTING_KEY,
    PREFETCH_COUNT, RETRY_QUEUE,
};

//! Broker abstraction used by the consumer.
//!
//! [`RabbitMqBroker`](super::RabbitMqBroker) talks AMQP through lapin;
//! [`InMemoryBroker`](super::InMemoryBroker) backs tests and local runs.

use async_trait::async_trait;
use thiserror::Error;

use super::types::InboundMessage;
use crate::dispatcher::Disposition;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),

    #[error("broker operation {operation} failed: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: lapin::Error,
    },

    #[error("broker rejected republish of delivery {delivery_tag}")]
    RepublishNacked { delivery_tag: u64 },

    #[error("broker connection lost")]
    ConnectionLost,

    #[error("broker is not configured")]
    NotConfigured,

    #[error("prefetch limit exceeded with {in_flight} unsettled deliveries")]
    PrefetchExceeded { in_flight: usize },

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

impl BrokerError {
    pub(crate) fn op(operation: &'static str) -> impl FnOnce(lapin::Error) -> BrokerError {
        move |source| BrokerError::Operation { operation, source }
    }
}

/// Source of notification deliveries.
#[async_trait]
pub trait Broker: Send {
    /// Declare topology, set prefetch, and register the consumer.
    async fn configure(&mut self) -> Result<(), BrokerError>;

    /// Wait for the next delivery. `None` means the broker closed the consumer.
    async fn next_delivery(&mut self) -> Option<Result<InboundMessage, BrokerError>>;

    /// Settle a delivery. Must be called exactly once per delivery.
    async fn settle(
        &mut self,
        message: &InboundMessage,
        disposition: Disposition,
    ) -> Result<(), BrokerError>;

    /// Stop consuming and release the connection.
    async fn close(&mut self);
}

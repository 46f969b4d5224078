//! Async RabbitMQ publisher for notification messages.
//!
//! Used by the `notification-publish` utility to push test messages through
//! the same exchange the relay consumes from.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions},
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::types::{NotificationPayload, NOTIFICATION_EXCHANGE, NOTIFICATION_ROUTING_KEY};

/// Async RabbitMQ publisher with connection management.
///
/// The publisher keeps one connection and channel, reconnecting when the
/// channel is no longer usable.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    uri: AMQPUri,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl Publisher {
    pub fn new(uri: AMQPUri) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                uri,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_publisher_connecting");

        let conn = Connection::connect_uri(self.inner.uri.clone(), ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        info!("rabbitmq_publisher_connected");

        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        // Same declaration as the consumer (idempotent)
        ch.exchange_declare(
            NOTIFICATION_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare notification exchange")?;

        info!(exchange = NOTIFICATION_EXCHANGE, "rabbitmq_exchange_declared");

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Publish a notification to the notification exchange.
    ///
    /// Returns the generated message id. With `ttl` set, the broker discards
    /// the message if it is still queued when the TTL elapses.
    pub async fn publish(
        &self,
        payload: &NotificationPayload,
        ttl: Option<Duration>,
    ) -> Result<String> {
        let channel = self.ensure_connected().await?;

        let body = serde_json::to_vec(payload).context("Failed to serialize notification")?;
        let message_id = new_message_id();

        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_content_type("application/json".into())
            .with_message_id(message_id.clone().into());

        if let Some(ttl) = ttl {
            properties = properties.with_expiration(ttl.as_millis().to_string().into());
        }

        let confirmation = channel
            .basic_publish(
                NOTIFICATION_EXCHANGE,
                NOTIFICATION_ROUTING_KEY,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .context("Failed to publish notification")?
            .await
            .context("Failed to confirm publish")?;

        if confirmation.is_nack() {
            anyhow::bail!("Broker rejected notification {message_id}");
        }

        info!(
            exchange = NOTIFICATION_EXCHANGE,
            message_id = %message_id,
            to = %payload.to_address,
            body_length = body.len(),
            "rabbitmq_notification_published"
        );

        Ok(message_id)
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

fn new_message_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("notification-{nanos}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_creation() {
        let publisher = Publisher::new(AMQPUri::default());
        assert!(Arc::strong_count(&publisher.inner) == 1);
    }

    #[test]
    fn test_message_id_format() {
        let id = new_message_id();
        assert!(id.starts_with("notification-"));
        assert!(id["notification-".len()..].parse::<u128>().is_ok());
    }
}

//! RabbitMQ broker using lapin.
//!
//! Topology:
//!
//! ```text
//! notifications (direct) ──""──► notification_queue ──reject──► notifications.dead_letter (fanout)
//!                                   ▲          │                          │
//!                              expired         │ retry                    ▼
//!                                   │          ▼             notification_queue.dead_letter
//!                                notification_queue.retry
//! ```
//!
//! Retries are republished through the default exchange with an incremented
//! `x-delivery-attempt` header, confirmed by the broker, and only then is the
//! original acknowledged. With a non-zero retry delay the copy is parked in
//! `notification_queue.retry` with a per-message expiration that doubles on
//! every attempt; when it expires the broker dead-letters it back into
//! `notification_queue`. A zero delay republishes straight to the work queue.
//!
//! RabbitMQ only expires messages at the head of a queue, so a retry never
//! comes back earlier than its delay but may come back later when an older
//! retry with a longer delay sits in front of it.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tracing::{info, warn};

use super::broker::{Broker, BrokerError};
use super::types::{
    InboundMessage, ATTEMPT_HEADER, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE,
    NOTIFICATION_EXCHANGE, NOTIFICATION_QUEUE, NOTIFICATION_ROUTING_KEY, PREFETCH_COUNT,
    RETRY_QUEUE,
};
use crate::dispatcher::Disposition;

/// Upper bound on the backoff between two attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// One connection, one channel, one consumer.
pub struct RabbitMqBroker {
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
    consumer_tag: String,
    retry_delay: Duration,
}

impl RabbitMqBroker {
    /// Open the connection and a channel.
    pub async fn connect(uri: AMQPUri, consumer_tag: &str) -> Result<Self, BrokerError> {
        info!(
            host = %uri.authority.host,
            port = uri.authority.port,
            "rabbitmq_connecting"
        );

        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(BrokerError::Connect)?;

        info!("rabbitmq_connected");

        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::op("channel.open"))?;

        info!(channel_id = channel.id(), "rabbitmq_channel_created");

        Ok(Self {
            connection,
            channel,
            consumer: None,
            consumer_tag: consumer_tag.to_string(),
            retry_delay: Duration::ZERO,
        })
    }

    /// Delay before the second attempt. Later attempts double it.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    async fn declare_topology(&self) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                DEAD_LETTER_EXCHANGE,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::op("exchange.declare"))?;

        self.channel
            .queue_declare(
                DEAD_LETTER_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::op("queue.declare"))?;

        self.channel
            .queue_bind(
                DEAD_LETTER_QUEUE,
                DEAD_LETTER_EXCHANGE,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::op("queue.bind"))?;

        self.channel
            .queue_declare(
                RETRY_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                retry_queue_arguments(),
            )
            .await
            .map_err(BrokerError::op("queue.declare"))?;

        self.channel
            .exchange_declare(
                NOTIFICATION_EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::op("exchange.declare"))?;

        self.channel
            .queue_declare(
                NOTIFICATION_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                work_queue_arguments(),
            )
            .await
            .map_err(BrokerError::op("queue.declare"))?;

        self.channel
            .queue_bind(
                NOTIFICATION_QUEUE,
                NOTIFICATION_EXCHANGE,
                NOTIFICATION_ROUTING_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::op("queue.bind"))?;

        info!(
            exchange = NOTIFICATION_EXCHANGE,
            queue = NOTIFICATION_QUEUE,
            dead_letter_exchange = DEAD_LETTER_EXCHANGE,
            dead_letter_queue = DEAD_LETTER_QUEUE,
            retry_queue = RETRY_QUEUE,
            "rabbitmq_topology_declared"
        );

        Ok(())
    }

    async fn republish(
        &self,
        message: &InboundMessage,
        next_attempt: u32,
    ) -> Result<(), BrokerError> {
        let delay = retry_delay(self.retry_delay, next_attempt);
        let queue = if delay.is_zero() {
            NOTIFICATION_QUEUE
        } else {
            RETRY_QUEUE
        };

        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                retry_properties(message, next_attempt, delay),
            )
            .await
            .map_err(BrokerError::op("basic.publish"))?
            .await
            .map_err(BrokerError::op("basic.publish"))?;

        if confirmation.is_nack() {
            return Err(BrokerError::RepublishNacked {
                delivery_tag: message.delivery_tag,
            });
        }

        info!(
            delivery_tag = message.delivery_tag,
            queue = queue,
            next_attempt = next_attempt,
            delay_ms = delay.as_millis() as u64,
            "rabbitmq_retry_scheduled"
        );

        Ok(())
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn configure(&mut self) -> Result<(), BrokerError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(BrokerError::op("confirm.select"))?;

        self.declare_topology().await?;

        self.channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(BrokerError::op("basic.qos"))?;

        info!(prefetch_count = PREFETCH_COUNT, "rabbitmq_qos_set");

        let consumer = self
            .channel
            .basic_consume(
                NOTIFICATION_QUEUE,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::op("basic.consume"))?;

        info!(
            queue = NOTIFICATION_QUEUE,
            consumer_tag = %self.consumer_tag,
            "rabbitmq_consumer_started"
        );

        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<InboundMessage, BrokerError>> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Some(Err(BrokerError::NotConfigured));
        };

        match consumer.next().await {
            Some(Ok(delivery)) => Some(Ok(inbound_from(delivery))),
            Some(Err(e)) => Some(Err(BrokerError::Operation {
                operation: "basic.deliver",
                source: e,
            })),
            None => None,
        }
    }

    async fn settle(
        &mut self,
        message: &InboundMessage,
        disposition: Disposition,
    ) -> Result<(), BrokerError> {
        match disposition {
            Disposition::Ack => self
                .channel
                .basic_ack(message.delivery_tag, BasicAckOptions::default())
                .await
                .map_err(BrokerError::op("basic.ack")),
            Disposition::Retry { next_attempt } => {
                self.republish(message, next_attempt).await?;
                self.channel
                    .basic_ack(message.delivery_tag, BasicAckOptions::default())
                    .await
                    .map_err(BrokerError::op("basic.ack"))
            }
            Disposition::DeadLetter => self
                .channel
                .basic_reject(message.delivery_tag, BasicRejectOptions { requeue: false })
                .await
                .map_err(BrokerError::op("basic.reject")),
        }
    }

    async fn close(&mut self) {
        self.consumer = None;

        if let Err(e) = self.channel.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }

        if let Err(e) = self.connection.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
        }

        info!("rabbitmq_closed");
    }
}

/// Work queue arguments routing rejected messages to the dead-letter exchange.
fn work_queue_arguments() -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
    );
    args
}

/// Retry queue arguments sending expired messages back to the work queue.
fn retry_queue_arguments() -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString("".into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(NOTIFICATION_QUEUE.into()),
    );
    args
}

/// Backoff before `next_attempt`: `base` before the second attempt, doubling
/// after that, capped at [`MAX_RETRY_DELAY`].
fn retry_delay(base: Duration, next_attempt: u32) -> Duration {
    let doublings = next_attempt.saturating_sub(2).min(16);
    base.saturating_mul(1 << doublings).min(MAX_RETRY_DELAY)
}

fn inbound_from(delivery: Delivery) -> InboundMessage {
    let properties = &delivery.properties;

    InboundMessage {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        attempt: attempt_from(properties),
        message_id: properties.message_id().as_ref().map(|s| s.as_str().to_string()),
        expiration: properties.expiration().as_ref().map(|s| s.as_str().to_string()),
        body: delivery.data,
    }
}

/// Read the attempt header, defaulting to the first attempt.
fn attempt_from(properties: &BasicProperties) -> u32 {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == ATTEMPT_HEADER)
                .map(|(_, value)| value)
        })
        .and_then(amqp_value_as_u32)
        .filter(|attempt| *attempt >= 1)
        .unwrap_or(1)
}

fn amqp_value_as_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).trim().parse().ok(),
        _ => None,
    }
}

/// Properties of a retry copy. A non-zero `delay` becomes the expiration that
/// holds the copy in the retry queue; otherwise the original TTL is carried.
fn retry_properties(
    message: &InboundMessage,
    next_attempt: u32,
    delay: Duration,
) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(ATTEMPT_HEADER.into(), AMQPValue::LongUInt(next_attempt));

    let mut properties = BasicProperties::default()
        .with_delivery_mode(2) // Persistent
        .with_content_type("application/json".into())
        .with_headers(headers);

    if let Some(id) = &message.message_id {
        properties = properties.with_message_id(id.as_str().into());
    }
    if !delay.is_zero() {
        properties = properties.with_expiration(delay.as_millis().to_string().into());
    } else if let Some(expiration) = &message.expiration {
        properties = properties.with_expiration(expiration.as_str().into());
    }

    properties
}

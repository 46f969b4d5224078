//! Notification consumer.
//!
//! Drives one [`Broker`] through its lifecycle:
//!
//! ```text
//! Disconnected ─connect()─► Connected ─configure()─► Configured ─consume()─► Consuming ─► Stopped
//! ```
//!
//! The disconnected state has no value: a [`Consumer`] can only be built from
//! a broker that is already connected (see `RabbitMqBroker::connect`), so a
//! new consumer always starts in [`ConsumerState::Connected`].
//!
//! Messages are handled strictly one at a time: the next delivery is only
//! requested after the current one has been settled. Shutdown is checked
//! between messages, never in the middle of a send.

use std::future::Future;

use tracing::{error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::queue::{Broker, BrokerError, InboundMessage};

/// Lifecycle of a consumer built around a connected broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connected,
    Configured,
    Consuming,
    Stopped,
}

pub struct Consumer<B: Broker> {
    broker: B,
    dispatcher: Dispatcher,
    state: ConsumerState,
    processed: u64,
}

impl<B: Broker> Consumer<B> {
    /// Wrap an already connected broker.
    pub fn new(broker: B, dispatcher: Dispatcher) -> Self {
        Self {
            broker,
            dispatcher,
            state: ConsumerState::Connected,
            processed: 0,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Declare topology, set prefetch and register for deliveries.
    pub async fn configure(&mut self) -> Result<(), BrokerError> {
        self.broker.configure().await?;
        self.state = ConsumerState::Configured;
        info!(policy = ?self.dispatcher.policy(), "consumer_configured");
        Ok(())
    }

    /// Configure, then consume until `shutdown` resolves or the broker fails.
    pub async fn start<F>(mut self, shutdown: F) -> Result<(), BrokerError>
    where
        F: Future<Output = ()>,
    {
        if let Err(e) = self.configure().await {
            error!(error = %e, "consumer_configure_failed");
            self.broker.close().await;
            return Err(e);
        }
        self.consume(shutdown).await
    }

    /// Consume until `shutdown` resolves or the broker fails.
    ///
    /// The broker is closed before returning, whatever the outcome.
    pub async fn consume<F>(mut self, shutdown: F) -> Result<(), BrokerError>
    where
        F: Future<Output = ()>,
    {
        if self.state != ConsumerState::Configured {
            self.broker.close().await;
            return Err(BrokerError::NotConfigured);
        }

        self.state = ConsumerState::Consuming;
        info!("relay_ready");

        let result = self.receive_loop(shutdown).await;

        self.broker.close().await;
        self.state = ConsumerState::Stopped;

        match &result {
            Ok(()) => info!(processed = self.processed, "relay_shutdown_complete"),
            Err(e) => error!(processed = self.processed, error = %e, "relay_stopped_with_error"),
        }

        result
    }

    async fn receive_loop<F>(&mut self, shutdown: F) -> Result<(), BrokerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let delivery = tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("relay_stopping");
                    return Ok(());
                }
                delivery = self.broker.next_delivery() => delivery,
            };

            match delivery {
                Some(Ok(message)) => self.handle(message).await?,
                Some(Err(e)) => {
                    error!(error = %e, "rabbitmq_delivery_error");
                    return Err(e);
                }
                None => {
                    warn!("rabbitmq_consumer_closed");
                    return Err(BrokerError::ConnectionLost);
                }
            }
        }
    }

    async fn handle(&mut self, message: InboundMessage) -> Result<(), BrokerError> {
        let disposition = self.dispatcher.dispatch(&message).await;

        if let Err(e) = self.broker.settle(&message, disposition).await {
            error!(
                delivery_tag = message.delivery_tag,
                message_id = %message.log_id(),
                disposition = disposition.as_str(),
                error = %e,
                "rabbitmq_settle_failed"
            );
            return Err(e);
        }

        info!(
            delivery_tag = message.delivery_tag,
            message_id = %message.log_id(),
            disposition = disposition.as_str(),
            "notification_settled"
        );

        self.processed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dispatcher::tests::{EventLog, StubMailer};
    use crate::dispatcher::{Disposition, FailurePolicy};
    use crate::mailer::Mailer;
    use crate::queue::{InMemoryBroker, Settlement};

    const VALID_BODY: &[u8] = br#"{"message":"hi","from":"a@x.com","to":"b@x.com","subject":"s"}"#;

    /// Resolves once `count` deliveries have been settled.
    async fn settled(broker: InMemoryBroker, count: usize) {
        while broker.settlements().await.len() < count {
            tokio::task::yield_now().await;
        }
    }

    fn consumer(
        broker: &InMemoryBroker,
        mailer: Arc<dyn Mailer>,
        policy: FailurePolicy,
    ) -> Consumer<InMemoryBroker> {
        Consumer::new(broker.clone(), Dispatcher::new(mailer, policy))
    }

    #[tokio::test]
    async fn test_valid_message_sent_once_and_acked() {
        let broker = InMemoryBroker::new();
        broker.publish(VALID_BODY).await;
        let mailer = StubMailer::sent();

        consumer(&broker, mailer.clone(), FailurePolicy::default())
            .start(settled(broker.clone(), 1))
            .await
            .unwrap();

        assert_eq!(
            broker.settlements().await,
            vec![Settlement {
                delivery_tag: 1,
                disposition: Disposition::Ack
            }]
        );
        assert_eq!(
            mailer.calls(),
            vec![(
                "hi".to_string(),
                "a@x.com".to_string(),
                "b@x.com".to_string(),
                "s".to_string()
            )]
        );
        assert!(broker.is_closed().await);
    }

    #[tokio::test]
    async fn test_invalid_bodies_acked_without_sending() {
        let broker = InMemoryBroker::new();
        broker.publish(&br#"{"message":"hi"}"#[..]).await;
        broker.publish(&b"\x00\x01 not json"[..]).await;
        let mailer = StubMailer::sent();

        consumer(&broker, mailer.clone(), FailurePolicy::default())
            .start(settled(broker.clone(), 2))
            .await
            .unwrap();

        let settlements = broker.settlements().await;
        assert_eq!(settlements.len(), 2);
        assert!(settlements
            .iter()
            .all(|s| s.disposition == Disposition::Ack));
        assert!(mailer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_body_logged_once_and_settled_once() {
        let (log, _guard) = EventLog::capture();
        let broker = InMemoryBroker::new();
        broker.publish(&br#"{"message":"hi"}"#[..]).await;

        consumer(&broker, StubMailer::sent(), FailurePolicy::default())
            .start(settled(broker.clone(), 1))
            .await
            .unwrap();

        assert_eq!(log.count("notification_invalid"), 1);
        assert_eq!(log.count("notification_settled"), 1);
        assert_eq!(log.count("relay_shutdown_complete"), 1);
    }

    #[tokio::test]
    async fn test_failed_sends_retry_then_dead_letter() {
        let broker = InMemoryBroker::new();
        broker.publish(VALID_BODY).await;
        let mailer = StubMailer::failing();

        consumer(
            &broker,
            mailer.clone(),
            FailurePolicy::Requeue { max_attempts: 3 },
        )
        .start(settled(broker.clone(), 3))
        .await
        .unwrap();

        let dispositions: Vec<_> = broker
            .settlements()
            .await
            .into_iter()
            .map(|s| s.disposition)
            .collect();
        assert_eq!(
            dispositions,
            vec![
                Disposition::Retry { next_attempt: 2 },
                Disposition::Retry { next_attempt: 3 },
                Disposition::DeadLetter,
            ]
        );
        assert_eq!(mailer.calls().len(), 3);

        let dead = broker.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt, 3);
        assert_eq!(broker.pending().await, 0);
    }

    #[tokio::test]
    async fn test_failed_send_with_drop_policy_acks() {
        let broker = InMemoryBroker::new();
        broker.publish(VALID_BODY).await;

        consumer(&broker, StubMailer::failing(), FailurePolicy::Drop)
            .start(settled(broker.clone(), 1))
            .await
            .unwrap();

        let settlements = broker.settlements().await;
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0].disposition, Disposition::Ack);
        assert!(broker.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_messages_settled_in_delivery_order_one_at_a_time() {
        let broker = InMemoryBroker::new();
        for _ in 0..5 {
            broker.publish(VALID_BODY).await;
        }

        consumer(&broker, StubMailer::sent(), FailurePolicy::default())
            .start(settled(broker.clone(), 5))
            .await
            .unwrap();

        let tags: Vec<_> = broker
            .settlements()
            .await
            .into_iter()
            .map(|s| s.delivery_tag)
            .collect();
        assert_eq!(tags, vec![1, 2, 3, 4, 5]);
        assert_eq!(broker.max_in_flight().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_next_delivery() {
        let broker = InMemoryBroker::new();
        broker.publish(VALID_BODY).await;
        let mailer = StubMailer::sent();

        consumer(&broker, mailer.clone(), FailurePolicy::default())
            .start(std::future::ready(()))
            .await
            .unwrap();

        assert!(mailer.calls().is_empty());
        assert_eq!(broker.pending().await, 1);
        assert!(broker.is_closed().await);
    }

    #[tokio::test]
    async fn test_broker_closing_consumer_is_fatal() {
        let broker = InMemoryBroker::new();
        broker.publish(VALID_BODY).await;
        broker.finish().await;

        let result = consumer(&broker, StubMailer::sent(), FailurePolicy::default())
            .start(std::future::pending())
            .await;

        assert!(matches!(result, Err(BrokerError::ConnectionLost)));
        assert_eq!(broker.settlements().await.len(), 1);
        assert!(broker.is_closed().await);
    }

    #[tokio::test]
    async fn test_consume_requires_configuration() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker, StubMailer::sent(), FailurePolicy::default());
        assert_eq!(consumer.state(), ConsumerState::Connected);

        let result = consumer.consume(std::future::pending()).await;

        assert!(matches!(result, Err(BrokerError::NotConfigured)));
        assert!(!broker.is_configured().await);
        assert!(broker.is_closed().await);
    }

    #[tokio::test]
    async fn test_configure_transitions_state() {
        let broker = InMemoryBroker::new();
        let mut consumer = consumer(&broker, StubMailer::sent(), FailurePolicy::default());

        consumer.configure().await.unwrap();

        assert_eq!(consumer.state(), ConsumerState::Configured);
        assert!(broker.is_configured().await);
    }
}

//! Per-message handling.
//!
//! The dispatcher turns one [`InboundMessage`] into exactly one
//! [`Disposition`]. The consumer hands that disposition back to the broker, so
//! every message is settled once on every path:
//!
//! ```text
//! body ─ parse ─┬─ invalid ──────────────────────────► Ack
//!               └─ valid ─ send ─┬─ Sent ────────────► Ack
//!                                └─ Failed ─ policy ─► Ack | Retry | DeadLetter
//! ```

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::DEFAULT_MAX_DELIVERY_ATTEMPTS;
use crate::mailer::{DeliveryOutcome, Mailer};
use crate::queue::{InboundMessage, NotificationPayload};

/// What to do with a message whose email could not be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Acknowledge and drop the message.
    Drop,
    /// Republish until `max_attempts` sends have failed, then dead-letter.
    Requeue { max_attempts: u32 },
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Requeue {
            max_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
        }
    }
}

impl FailurePolicy {
    /// Disposition for a failed send on the given 1-based attempt.
    pub fn on_failure(self, attempt: u32) -> Disposition {
        match self {
            FailurePolicy::Drop => Disposition::Ack,
            FailurePolicy::Requeue { max_attempts } if attempt < max_attempts => Disposition::Retry {
                next_attempt: attempt.saturating_add(1),
            },
            FailurePolicy::Requeue { .. } => Disposition::DeadLetter,
        }
    }
}

/// How a message is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue.
    Ack,
    /// Put the message back with its attempt counter set to `next_attempt`.
    Retry { next_attempt: u32 },
    /// Reject without requeue so the broker dead-letters it.
    DeadLetter,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Retry { .. } => "retry",
            Disposition::DeadLetter => "dead_letter",
        }
    }
}

/// Parses notifications and relays them through a shared [`Mailer`].
#[derive(Clone)]
pub struct Dispatcher {
    mailer: Arc<dyn Mailer>,
    policy: FailurePolicy,
}

impl Dispatcher {
    pub fn new(mailer: Arc<dyn Mailer>, policy: FailurePolicy) -> Self {
        Self { mailer, policy }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Handle one message and decide how it is settled.
    pub async fn dispatch(&self, message: &InboundMessage) -> Disposition {
        info!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            delivery_tag = message.delivery_tag,
            message_id = %message.log_id(),
            attempt = message.attempt,
            redelivered = message.redelivered,
            body = %message.body_preview(),
            "notification_received"
        );

        let payload = match NotificationPayload::parse(&message.body) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    delivery_tag = message.delivery_tag,
                    message_id = %message.log_id(),
                    error = %e,
                    body = %message.body_preview(),
                    "notification_invalid"
                );
                return Disposition::Ack;
            }
        };

        let outcome = self
            .mailer
            .send(
                &payload.message,
                &payload.from_address,
                &payload.to_address,
                &payload.subject,
            )
            .await;

        match &outcome {
            DeliveryOutcome::Sent => {
                info!(
                    delivery_tag = message.delivery_tag,
                    message_id = %message.log_id(),
                    to = %payload.to_address,
                    "notification_sent"
                );
                Disposition::Ack
            }
            DeliveryOutcome::Failed(reason) => {
                let disposition = self.policy.on_failure(message.attempt);
                match disposition {
                    Disposition::Retry { next_attempt } => warn!(
                        delivery_tag = message.delivery_tag,
                        message_id = %message.log_id(),
                        to = %payload.to_address,
                        attempt = message.attempt,
                        next_attempt = next_attempt,
                        error = %reason,
                        "notification_send_failed_retrying"
                    ),
                    _ => error!(
                        delivery_tag = message.delivery_tag,
                        message_id = %message.log_id(),
                        to = %payload.to_address,
                        attempt = message.attempt,
                        disposition = disposition.as_str(),
                        error = %reason,
                        "notification_send_failed"
                    ),
                }
                disposition
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fmt;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tracing::field::{Field, Visit};
    use tracing::subscriber::DefaultGuard;
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    use super::*;

    /// Layer that records the message of every event emitted while installed.
    #[derive(Clone, Default)]
    pub(crate) struct EventLog {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl EventLog {
        /// Install a recording subscriber for the current thread.
        ///
        /// Events are captured until the returned guard is dropped, so async
        /// tests using this must run on the current-thread runtime.
        pub(crate) fn capture() -> (Self, DefaultGuard) {
            let log = Self::default();
            let subscriber = tracing_subscriber::registry().with(log.clone());
            (log, tracing::subscriber::set_default(subscriber))
        }

        pub(crate) fn count(&self, name: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| event.as_str() == name)
                .count()
        }
    }

    impl<S: Subscriber> Layer<S> for EventLog {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor(None);
            event.record(&mut visitor);
            if let Some(message) = visitor.0 {
                self.events.lock().unwrap().push(message);
            }
        }
    }

    struct MessageVisitor(Option<String>);

    impl Visit for MessageVisitor {
        fn record_str(&mut self, field: &Field, value: &str) {
            if field.name() == "message" {
                self.0 = Some(value.to_string());
            }
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = Some(format!("{value:?}"));
            }
        }
    }

    /// Mailer stub that records calls and returns a fixed outcome.
    pub(crate) struct StubMailer {
        outcome: DeliveryOutcome,
        calls: Mutex<Vec<(String, String, String, String)>>,
    }

    impl StubMailer {
        pub(crate) fn sent() -> Arc<Self> {
            Arc::new(Self {
                outcome: DeliveryOutcome::Sent,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn failing() -> Arc<Self> {
            Arc::new(Self {
                outcome: DeliveryOutcome::Failed("421 service not available".to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn calls(&self) -> Vec<(String, String, String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Mailer for StubMailer {
        async fn send(
            &self,
            message: &str,
            from_address: &str,
            to_address: &str,
            subject: &str,
        ) -> DeliveryOutcome {
            self.calls.lock().unwrap().push((
                message.to_string(),
                from_address.to_string(),
                to_address.to_string(),
                subject.to_string(),
            ));
            self.outcome.clone()
        }
    }

    const VALID_BODY: &[u8] = br#"{"message":"hi","from":"a@x.com","to":"b@x.com","subject":"s"}"#;

    #[tokio::test]
    async fn test_valid_message_is_sent_and_acked() {
        let mailer = StubMailer::sent();
        let dispatcher = Dispatcher::new(mailer.clone(), FailurePolicy::default());

        let disposition = dispatcher.dispatch(&InboundMessage::new(1, VALID_BODY)).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(
            mailer.calls(),
            vec![(
                "hi".to_string(),
                "a@x.com".to_string(),
                "b@x.com".to_string(),
                "s".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_missing_fields_acked_without_sending() {
        let mailer = StubMailer::sent();
        let dispatcher = Dispatcher::new(mailer.clone(), FailurePolicy::default());

        let disposition = dispatcher
            .dispatch(&InboundMessage::new(1, &br#"{"message":"hi"}"#[..]))
            .await;

        assert_eq!(disposition, Disposition::Ack);
        assert!(mailer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_body_acked_without_sending() {
        let mailer = StubMailer::sent();
        let dispatcher = Dispatcher::new(mailer.clone(), FailurePolicy::default());

        let disposition = dispatcher
            .dispatch(&InboundMessage::new(1, &b"{\"message\":\"hi\",\"fro"[..]))
            .await;

        assert_eq!(disposition, Disposition::Ack);
        assert!(mailer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_with_drop_policy_is_acked() {
        let mailer = StubMailer::failing();
        let dispatcher = Dispatcher::new(mailer.clone(), FailurePolicy::Drop);

        let disposition = dispatcher.dispatch(&InboundMessage::new(1, VALID_BODY)).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(mailer.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_retries_then_dead_letters() {
        let mailer = StubMailer::failing();
        let dispatcher =
            Dispatcher::new(mailer.clone(), FailurePolicy::Requeue { max_attempts: 3 });

        let mut message = InboundMessage::new(1, VALID_BODY);
        assert_eq!(
            dispatcher.dispatch(&message).await,
            Disposition::Retry { next_attempt: 2 }
        );

        message.attempt = 2;
        assert_eq!(
            dispatcher.dispatch(&message).await,
            Disposition::Retry { next_attempt: 3 }
        );

        message.attempt = 3;
        assert_eq!(dispatcher.dispatch(&message).await, Disposition::DeadLetter);
        assert_eq!(mailer.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_send_decision_is_deterministic() {
        let dispatcher = Dispatcher::new(StubMailer::failing(), FailurePolicy::default());
        let message = InboundMessage::new(7, VALID_BODY);

        let first = dispatcher.dispatch(&message).await;
        let second = dispatcher.dispatch(&message).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_invalid_bodies_log_one_error_each() {
        let (log, _guard) = EventLog::capture();
        let mailer = StubMailer::sent();
        let dispatcher = Dispatcher::new(mailer.clone(), FailurePolicy::default());

        for body in [&br#"{"message":"hi"}"#[..], &b"\x00\x01 not json"[..], &b"[1,2]"[..]] {
            dispatcher.dispatch(&InboundMessage::new(1, body)).await;
        }

        assert_eq!(log.count("notification_received"), 3);
        assert_eq!(log.count("notification_invalid"), 3);
        assert_eq!(log.count("notification_sent"), 0);
        assert!(mailer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_each_failed_send_logs_one_failure() {
        let (log, _guard) = EventLog::capture();
        let dispatcher =
            Dispatcher::new(StubMailer::failing(), FailurePolicy::Requeue { max_attempts: 2 });

        let mut message = InboundMessage::new(1, VALID_BODY);
        dispatcher.dispatch(&message).await;
        assert_eq!(log.count("notification_send_failed_retrying"), 1);
        assert_eq!(log.count("notification_send_failed"), 0);

        message.attempt = 2;
        dispatcher.dispatch(&message).await;
        assert_eq!(log.count("notification_send_failed_retrying"), 1);
        assert_eq!(log.count("notification_send_failed"), 1);
        assert_eq!(log.count("notification_sent"), 0);
    }

    #[tokio::test]
    async fn test_failed_send_with_drop_policy_logs_error() {
        let (log, _guard) = EventLog::capture();
        let dispatcher = Dispatcher::new(StubMailer::failing(), FailurePolicy::Drop);

        dispatcher.dispatch(&InboundMessage::new(1, VALID_BODY)).await;

        assert_eq!(log.count("notification_send_failed"), 1);
        assert_eq!(log.count("notification_send_failed_retrying"), 0);
    }

    #[tokio::test]
    async fn test_successful_send_logs_sent() {
        let (log, _guard) = EventLog::capture();
        let dispatcher = Dispatcher::new(StubMailer::sent(), FailurePolicy::default());

        dispatcher.dispatch(&InboundMessage::new(1, VALID_BODY)).await;

        assert_eq!(log.count("notification_sent"), 1);
        assert_eq!(log.count("notification_invalid"), 0);
        assert_eq!(log.count("notification_send_failed"), 0);
    }

    #[test]
    fn test_policy_on_failure() {
        assert_eq!(FailurePolicy::Drop.on_failure(1), Disposition::Ack);
        assert_eq!(FailurePolicy::Drop.on_failure(99), Disposition::Ack);

        let single = FailurePolicy::Requeue { max_attempts: 1 };
        assert_eq!(single.on_failure(1), Disposition::DeadLetter);

        let policy = FailurePolicy::default();
        assert_eq!(policy.on_failure(1), Disposition::Retry { next_attempt: 2 });
        assert_eq!(policy.on_failure(3), Disposition::DeadLetter);
        assert_eq!(policy.on_failure(10), Disposition::DeadLetter);
    }
}

//! In-memory broker for tests and local pipelines.
//!
//! Behaves like a single RabbitMQ queue with prefetch 1: a delivery must be
//! settled before the next one is handed out. `Retry` puts the body back at
//! the tail with the new attempt number and `DeadLetter` moves it to a
//! separate list. Every settlement is recorded so tests can check that each
//! delivery was settled exactly once.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::info;

use super::broker::{Broker, BrokerError};
use super::types::{InboundMessage, PREFETCH_COUNT};
use crate::dispatcher::Disposition;

/// One settlement call made by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub delivery_tag: u64,
    pub disposition: Disposition,
}

#[derive(Default)]
struct State {
    configured: bool,
    closed: bool,
    /// No more messages will be published; the consumer is cancelled once drained.
    finished: bool,
    next_tag: u64,
    queue: VecDeque<InboundMessage>,
    in_flight: Vec<InboundMessage>,
    max_in_flight: usize,
    settlements: Vec<Settlement>,
    dead_letters: Vec<InboundMessage>,
}

impl State {
    fn enqueue(&mut self, mut message: InboundMessage) {
        self.next_tag += 1;
        message.delivery_tag = self.next_tag;
        self.queue.push_back(message);
    }
}

/// Shared in-memory queue. Clones see the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a first-attempt message with the given body.
    pub async fn publish(&self, body: impl Into<Vec<u8>>) {
        self.publish_message(InboundMessage::new(0, body)).await;
    }

    /// Publish a prepared message. Its delivery tag is reassigned.
    pub async fn publish_message(&self, message: InboundMessage) {
        self.state.lock().await.enqueue(message);
        self.notify.notify_one();
    }

    /// Cancel the consumer once the queue has drained.
    pub async fn finish(&self) {
        self.state.lock().await.finished = true;
        self.notify.notify_one();
    }

    pub async fn settlements(&self) -> Vec<Settlement> {
        self.state.lock().await.settlements.clone()
    }

    pub async fn dead_letters(&self) -> Vec<InboundMessage> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Messages waiting in the queue.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Highest number of unsettled deliveries observed.
    pub async fn max_in_flight(&self) -> usize {
        self.state.lock().await.max_in_flight
    }

    pub async fn is_configured(&self) -> bool {
        self.state.lock().await.configured
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn configure(&mut self) -> Result<(), BrokerError> {
        self.state.lock().await.configured = true;
        info!("memory_broker_configured");
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<InboundMessage, BrokerError>> {
        loop {
            {
                let mut state = self.state.lock().await;

                if !state.configured {
                    return Some(Err(BrokerError::NotConfigured));
                }
                if state.closed {
                    return None;
                }
                if state.in_flight.len() >= usize::from(PREFETCH_COUNT) {
                    return Some(Err(BrokerError::PrefetchExceeded {
                        in_flight: state.in_flight.len(),
                    }));
                }

                if let Some(message) = state.queue.pop_front() {
                    state.in_flight.push(message.clone());
                    state.max_in_flight = state.max_in_flight.max(state.in_flight.len());
                    return Some(Ok(message));
                }

                if state.finished {
                    return None;
                }
            }

            self.notify.notified().await;
        }
    }

    async fn settle(
        &mut self,
        message: &InboundMessage,
        disposition: Disposition,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;

        let position = state
            .in_flight
            .iter()
            .position(|m| m.delivery_tag == message.delivery_tag)
            .ok_or(BrokerError::UnknownDelivery(message.delivery_tag))?;
        let settled = state.in_flight.remove(position);

        state.settlements.push(Settlement {
            delivery_tag: settled.delivery_tag,
            disposition,
        });

        match disposition {
            Disposition::Ack => {}
            Disposition::Retry { next_attempt } => {
                let mut retry = settled;
                retry.attempt = next_attempt;
                retry.redelivered = false;
                state.enqueue(retry);
            }
            Disposition::DeadLetter => state.dead_letters.push(settled),
        }

        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        // Unsettled deliveries go back to the queue, as on a real channel close.
        let unsettled: Vec<_> = state.in_flight.drain(..).collect();
        for mut message in unsettled.into_iter().rev() {
            message.redelivered = true;
            state.queue.push_front(message);
        }
        info!("memory_broker_closed");
    }
}

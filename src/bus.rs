//! Event Bus Adapter. Delivery is at-least-once: every delivery must be
//! settled (ack, requeue or dead-letter) before the broker moves past it, and
//! handlers are expected to be idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::models::events::Event;
use crate::services::ServiceError;

pub mod kafka;
pub mod memory;

pub use kafka::KafkaBus;
pub use memory::MemoryBus;

pub const ATTEMPT_HEADER: &str = "x-delivery-attempt";
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscription failed: {0}")]
    Subscription(String),
    #[error("undecodable message: {0}")]
    Decode(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Redeliver with the attempt counter incremented.
    Requeue,
    DeadLetter { reason: String },
}

/// What the consumer loop does with a failed delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Redeliver until the attempt budget runs out.
    Retry,
    DeadLetter,
    /// Dead-letter and flag for manual reconciliation. Never retried.
    Reconcile,
}

/// One received event. Dropping it unsettled counts as a requeue.
#[derive(Debug)]
pub struct Delivery {
    pub topic: String,
    pub event: Event,
    /// Starts at 1.
    pub attempt: u32,
    settle: oneshot::Sender<Settlement>,
}

impl Delivery {
    pub fn new(topic: String, event: Event, attempt: u32) -> (Self, oneshot::Receiver<Settlement>) {
        let (settle, settled) = oneshot::channel();
        (
            Delivery {
                topic,
                event,
                attempt,
                settle,
            },
            settled,
        )
    }

    pub fn settle(self, settlement: Settlement) {
        // The adapter side is gone when the subscription was torn down.
        let _ = self.settle.send(settlement);
    }

    pub fn ack(self) {
        self.settle(Settlement::Ack)
    }

    pub fn requeue(self) {
        self.settle(Settlement::Requeue)
    }

    pub fn dead_letter(self, reason: impl Into<String>) {
        self.settle(Settlement::DeadLetter {
            reason: reason.into(),
        })
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes to the topic named by the event type.
    async fn publish(&self, event: &Event) -> Result<(), BusError>;
    async fn subscribe(
        &self,
        topics: &[&str],
        group: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BusError>;
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), ServiceError>;
}

/// Feeds deliveries from `topics` to `handler` and settles each one from the
/// handler's outcome. Returns when `shutdown` flips or the subscription ends.
pub async fn consume(
    bus: Arc<dyn EventBus>,
    topics: &[&str],
    group: &str,
    handler: Arc<dyn EventHandler>,
    max_attempts: u32,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BusError> {
    let mut deliveries = bus.subscribe(topics, group).await?;
    info!("Consumer {} subscribed to {:?}", group, topics);

    loop {
        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            next = deliveries.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let result = handler.handle(&delivery.event).await;
        settle(delivery, result, max_attempts);
    }

    info!("Consumer {} stopped", group);
    Ok(())
}

fn settle(delivery: Delivery, result: Result<(), ServiceError>, max_attempts: u32) {
    let err = match result {
        Ok(()) => {
            debug!(
                "{} {} handled on attempt {}",
                delivery.topic, delivery.event.idempotency_key, delivery.attempt
            );
            return delivery.ack();
        }
        Err(err) => err,
    };

    match err.disposition() {
        Disposition::Retry if delivery.attempt < max_attempts => {
            warn!(
                "{} attempt {}/{} failed, requeueing: {}",
                delivery.topic, delivery.attempt, max_attempts, err
            );
            delivery.requeue()
        }
        Disposition::Retry => {
            error!(
                "{} exhausted {} attempts, dead-lettering: {}",
                delivery.topic, max_attempts, err
            );
            delivery.dead_letter(err.to_string())
        }
        Disposition::DeadLetter => {
            warn!("{} rejected, dead-lettering: {}", delivery.topic, err);
            delivery.dead_letter(err.to_string())
        }
        Disposition::Reconcile => {
            error!(
                target: "reconciliation",
                "{} {}: {}", delivery.topic, delivery.event.idempotency_key, err
            );
            delivery.dead_letter(err.to_string())
        }
    }
}

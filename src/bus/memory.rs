use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use tokio::sync::{mpsc, Mutex, Notify};

use super::{BusError, Delivery, EventBus, Settlement};
use crate::models::events::Event;

const DELIVERY_BUFFER: usize = 64;

struct Subscriber {
    group: String,
    sender: mpsc::Sender<Delivery>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    pub topic: String,
    pub event: Event,
    pub attempt: u32,
    pub reason: String,
}

#[derive(Default)]
struct Inner {
    topics: DashMap<String, Vec<Subscriber>>,
    published: Mutex<Vec<Event>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    acked: AtomicUsize,
    in_flight: AtomicUsize,
    idle: Notify,
    fail_publishes: AtomicBool,
}

/// Process-local bus with the same settlement semantics as the broker
/// adapter. Each consumer group on a topic gets every event once.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail, to simulate a broker outage.
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<Event> {
        self.inner.published.lock().await.clone()
    }

    pub async fn published_of(&self, event_type: &str) -> Vec<Event> {
        self.inner
            .published
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().await.clone()
    }

    pub fn acked(&self) -> usize {
        self.inner.acked.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner
            .topics
            .get(topic)
            .is_some_and(|subscribers| !subscribers.is_empty())
    }

    /// Resolves once every dispatched delivery has been acked or
    /// dead-lettered.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn dispatch(&self, topic: String, event: Event, attempt: u32) {
        let targets: Vec<mpsc::Sender<Delivery>> = match self.inner.topics.get(&topic) {
            Some(subscribers) => {
                let mut seen = HashSet::new();
                subscribers
                    .iter()
                    .filter(|s| !s.sender.is_closed() && seen.insert(s.group.clone()))
                    .map(|s| s.sender.clone())
                    .collect()
            }
            None => Vec::new(),
        };

        for sender in targets {
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            let bus = self.clone();
            let topic = topic.clone();
            let event = event.clone();

            tokio::spawn(async move {
                let (delivery, settled) = Delivery::new(topic.clone(), event.clone(), attempt);
                let settlement = if sender.send(delivery).await.is_err() {
                    None
                } else {
                    Some(settled.await.unwrap_or(Settlement::Requeue))
                };

                match settlement {
                    Some(Settlement::Ack) => {
                        bus.inner.acked.fetch_add(1, Ordering::SeqCst);
                    }
                    Some(Settlement::Requeue) => {
                        debug!("Requeueing {} (attempt {})", topic, attempt + 1);
                        bus.dispatch(topic, event, attempt + 1);
                    }
                    Some(Settlement::DeadLetter { reason }) => {
                        bus.inner.dead_letters.lock().await.push(DeadLetter {
                            topic,
                            event,
                            attempt,
                            reason,
                        });
                    }
                    None => debug!("Subscriber for {} went away", topic),
                }

                if bus.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    bus.inner.idle.notify_waiters();
                }
            });
        }
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, event: &Event) -> Result<(), BusError> {
        if self.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                topic: event.event_type().to_string(),
                reason: "broker unavailable".to_string(),
            });
        }

        self.inner.published.lock().await.push(event.clone());
        self.dispatch(event.event_type().to_string(), event.clone(), 1);
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[&str],
        group: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BusError> {
        let (sender, receiver) = mpsc::channel(DELIVERY_BUFFER);
        for topic in topics {
            self.inner
                .topics
                .entry(topic.to_string())
                .or_default()
                .push(Subscriber {
                    group: group.to_string(),
                    sender: sender.clone(),
                });
        }
        Ok(receiver)
    }
}

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio::sync::mpsc;

use super::{
    BusError, Delivery, EventBus, Settlement, ATTEMPT_HEADER, DEAD_LETTER_REASON_HEADER,
};
use crate::models::events::Event;
use crate::settings::Broker;

const DELIVERY_BUFFER: usize = 64;
const COPY_BACKOFF_START: Duration = Duration::from_millis(100);
const COPY_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Producer half shared between `publish` and the consumer tasks, which
/// republish for requeue and dead-letter.
#[derive(Clone)]
struct Producer {
    inner: FutureProducer,
    timeout: Duration,
}

impl Producer {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        attempt: u32,
        reason: Option<&str>,
    ) -> Result<(), BusError> {
        let attempt = attempt.to_string();
        let mut headers = OwnedHeaders::new().insert(Header {
            key: ATTEMPT_HEADER,
            value: Some(attempt.as_str()),
        });
        if let Some(reason) = reason {
            headers = headers.insert(Header {
                key: DEAD_LETTER_REASON_HEADER,
                value: Some(reason),
            });
        }

        let record = FutureRecord::to(topic)
            .payload(payload)
            .key(key)
            .headers(headers);

        match self.inner.send(record, Timeout::After(self.timeout)).await {
            Ok(_) => {
                debug!("Published {} to {} (attempt {})", key, topic, attempt);
                Ok(())
            }
            Err((e, _)) => Err(BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Kafka-compatible adapter. Offsets are committed manually, only after the
/// delivery has been settled and any requeue or dead-letter copy is written.
pub struct KafkaBus {
    producer: Producer,
    brokers: String,
    dead_letter_suffix: String,
}

impl KafkaBus {
    pub fn new(settings: &Broker) -> Result<Self, BusError> {
        let inner: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("message.timeout.ms", settings.publish_timeout_ms.to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create producer: {e}")))?;

        info!("Kafka producer created for {}", settings.brokers);

        Ok(KafkaBus {
            producer: Producer {
                inner,
                timeout: Duration::from_millis(settings.publish_timeout_ms),
            },
            brokers: settings.brokers.clone(),
            dead_letter_suffix: settings.dead_letter_suffix.clone(),
        })
    }
}

fn delivery_attempt(message: &BorrowedMessage<'_>) -> u32 {
    message
        .headers()
        .and_then(|headers| {
            headers
                .iter()
                .find(|h| h.key == ATTEMPT_HEADER)
                .and_then(|h| h.value)
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(1)
}

fn commit(consumer: &StreamConsumer, message: &BorrowedMessage<'_>) {
    if let Err(e) = consumer.commit_message(message, CommitMode::Async) {
        warn!(
            "Failed to commit {}[{}]@{} (may be redelivered): {}",
            message.topic(),
            message.partition(),
            message.offset(),
            e
        );
    }
}

/// Repeats `write` until it succeeds. Returns false if `abandon` resolves
/// first, in which case nothing was written.
async fn write_with_backoff<F, Fut>(
    what: &str,
    mut write: F,
    abandon: impl Future<Output = ()>,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), BusError>>,
{
    tokio::pin!(abandon);
    let mut backoff = COPY_BACKOFF_START;
    loop {
        match write().await {
            Ok(()) => return true,
            Err(e) => error!("Could not write {} (retrying in {:?}): {}", what, backoff, e),
        }
        tokio::select! {
            _ = &mut abandon => return false,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(COPY_BACKOFF_MAX);
    }
}

/// Writes the requeue or dead-letter copy, then commits. Commits are per
/// partition position, so the consumer must not move past a message whose
/// copy is missing: the write is retried until it lands. Returns false when
/// the subscription is torn down first; the offset then stays uncommitted.
async fn apply_settlement(
    producer: &Producer,
    consumer: &StreamConsumer,
    deliveries: &mpsc::Sender<Delivery>,
    message: &BorrowedMessage<'_>,
    dead_letter_suffix: &str,
    settlement: Settlement,
    attempt: u32,
) -> bool {
    let topic = message.topic();
    let key = message
        .key()
        .and_then(|k| std::str::from_utf8(k).ok())
        .unwrap_or_default();
    let payload = message.payload().unwrap_or_default();

    let written = match &settlement {
        Settlement::Ack => true,
        Settlement::Requeue => {
            write_with_backoff(
                &format!("requeue of {topic}@{}", message.offset()),
                move || producer.send(topic, key, payload, attempt + 1, None),
                deliveries.closed(),
            )
            .await
        }
        Settlement::DeadLetter { reason } => {
            let dead_letter_topic = format!("{topic}{dead_letter_suffix}");
            let dead_letter_topic = dead_letter_topic.as_str();
            let reason = reason.as_str();
            write_with_backoff(
                &format!("dead-letter copy of {topic}@{}", message.offset()),
                move || producer.send(dead_letter_topic, key, payload, attempt, Some(reason)),
                deliveries.closed(),
            )
            .await
        }
    };

    if written {
        commit(consumer, message);
    } else {
        warn!(
            "Left {}[{}]@{} uncommitted after {:?}",
            topic,
            message.partition(),
            message.offset(),
            settlement
        );
    }
    written
}

#[async_trait]
impl EventBus for KafkaBus {
    async fn publish(&self, event: &Event) -> Result<(), BusError> {
        let topic = event.event_type();
        let payload = serde_json::to_vec(event).map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            reason: format!("Failed to serialize event: {e}"),
        })?;

        self.producer
            .send(topic, &event.idempotency_key, &payload, 1, None)
            .await
    }

    async fn subscribe(
        &self,
        topics: &[&str],
        group: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create consumer: {e}")))?;

        consumer
            .subscribe(topics)
            .map_err(|e| BusError::Subscription(format!("Failed to subscribe to {topics:?}: {e}")))?;

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let producer = self.producer.clone();
        let dead_letter_suffix = self.dead_letter_suffix.clone();
        let group = group.to_string();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => break,
                    received = consumer.recv() => match received {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Consumer {} receive error: {}", group, e);
                            continue;
                        }
                    },
                };

                let attempt = delivery_attempt(&message);
                let decoded = message
                    .payload()
                    .ok_or_else(|| BusError::Decode("message has no payload".to_string()))
                    .and_then(|payload| {
                        serde_json::from_slice::<Event>(payload)
                            .map_err(|e| BusError::Decode(e.to_string()))
                    });

                let settlement = match decoded {
                    Ok(event) => {
                        let (delivery, settled) =
                            Delivery::new(message.topic().to_string(), event, attempt);
                        if tx.send(delivery).await.is_err() {
                            // Consumer loop gone; leave the offset uncommitted.
                            break;
                        }
                        settled.await.unwrap_or(Settlement::Requeue)
                    }
                    Err(e) => {
                        warn!("Dead-lettering undecodable message on {}: {}", message.topic(), e);
                        Settlement::DeadLetter {
                            reason: e.to_string(),
                        }
                    }
                };

                let settled = apply_settlement(
                    &producer,
                    &consumer,
                    &tx,
                    &message,
                    &dead_letter_suffix,
                    settlement,
                    attempt,
                )
                .await;
                if !settled {
                    break;
                }
            }

            debug!("Consumer task for {} exiting", group);
        });

        Ok(rx)
    }
}

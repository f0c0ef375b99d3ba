//! In-memory bus backend: bounded per-topic queues, a worker pool per
//! subscription, exponential-backoff retry and dead-letter queues.
//!
//! Enqueue is non-blocking and surfaces backpressure as `Ok(false)`. Dequeue
//! polls with a bounded timeout so workers notice shutdown promptly. A failed
//! delivery is re-enqueued at the tail after a backoff delay; once the retry
//! budget is spent the payload moves to `<topic>.DLQ` with the attempt count
//! and last error attached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::MessagingSettings;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{dlq_topic, BusError, DeliveryHandler, MessageBus};

/// One queued message with its retry bookkeeping.
#[derive(Debug)]
struct Delivery {
    payload: Value,
    attempts: u32,
    last_error: Option<String>,
}

struct TopicQueue {
    tx: mpsc::Sender<Delivery>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    subscribed: AtomicBool,
}

struct Inner {
    settings: MessagingSettings,
    topics: DashMap<String, Arc<TopicQueue>>,
    cancel: CancellationToken,
    shutting_down: AtomicBool,
}

impl Inner {
    fn topic(&self, name: &str) -> Arc<TopicQueue> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
                Arc::new(TopicQueue {
                    tx,
                    rx: tokio::sync::Mutex::new(rx),
                    subscribed: AtomicBool::new(false),
                })
            })
            .clone()
    }

    fn enqueue(&self, topic: &str, delivery: Delivery) -> Result<bool, BusError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown);
        }
        match self.topic(topic).tx.try_send(delivery) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(topic, "queue full, enqueue refused");
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::ShuttingDown),
        }
    }

    /// Moves an exhausted delivery to the topic's DLQ, exactly once.
    fn dead_letter(&self, topic: &str, delivery: Delivery) {
        let dlq = dlq_topic(topic);
        let payload = attach_failure(delivery.payload, delivery.attempts, delivery.last_error);
        match self.enqueue(&dlq, Delivery {
            payload,
            attempts: 0,
            last_error: None,
        }) {
            Ok(true) => tracing::warn!(topic, dlq = %dlq, "message dead-lettered"),
            Ok(false) => tracing::error!(topic, dlq = %dlq, "DLQ full, message dropped"),
            Err(e) => tracing::error!(topic, dlq = %dlq, error = %e, "DLQ enqueue failed"),
        }
    }
}

/// Attaches retry bookkeeping to a dead-lettered payload.
fn attach_failure(payload: Value, attempts: u32, last_error: Option<String>) -> Value {
    let mut obj = match payload {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("payload".into(), other);
            map
        }
    };
    obj.insert("attempts".into(), Value::from(attempts));
    if let Some(err) = last_error {
        obj.insert("lastError".into(), Value::String(err));
    }
    Value::Object(obj)
}

/// Backoff before re-enqueueing attempt `n` (1-based): flat, or
/// `min(retry_delay * 2^(n-1), max_retry_delay)` when exponential.
fn retry_delay(settings: &MessagingSettings, attempt: u32) -> Duration {
    let base = settings.retry_delay_ms;
    let ms = if settings.exponential_backoff {
        let factor = 1u64 << (attempt.saturating_sub(1)).min(20);
        base.saturating_mul(factor).min(settings.max_retry_delay_ms)
    } else {
        base
    };
    Duration::from_millis(ms)
}

/// In-process [`MessageBus`] with bounded queues, retries and DLQs.
pub struct LocalBus {
    inner: Arc<Inner>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl LocalBus {
    pub fn new(settings: MessagingSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                topics: DashMap::new(),
                cancel: CancellationToken::new(),
                shutting_down: AtomicBool::new(false),
            }),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn spawn_worker(&self, topic: String, handler: DeliveryHandler) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let queue = inner.topic(&topic);
            let poll = Duration::from_secs(inner.settings.poll_timeout_seconds.max(1));
            loop {
                if inner.cancel.is_cancelled() {
                    break;
                }
                let received = {
                    let mut rx = queue.rx.lock().await;
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        polled = tokio::time::timeout(poll, rx.recv()) => polled,
                    }
                };
                let mut delivery = match received {
                    Ok(Some(d)) => d,
                    Ok(None) => break,     // channel closed
                    Err(_) => continue,    // poll timeout, re-check shutdown
                };

                match handler(delivery.payload.clone()).await {
                    Ok(()) => {
                        tracing::debug!(topic = %topic, "message acked");
                    }
                    Err(e) => {
                        delivery.attempts += 1;
                        delivery.last_error = Some(e.reason.clone());
                        let attempt = delivery.attempts;
                        tracing::warn!(
                            topic = %topic,
                            attempt,
                            error = %e,
                            "delivery failed"
                        );
                        if attempt > inner.settings.retry_attempts {
                            inner.dead_letter(&topic, delivery);
                        } else {
                            let delay = retry_delay(&inner.settings, attempt);
                            let tx = queue.tx.clone();
                            let inner = Arc::clone(&inner);
                            let topic = topic.clone();
                            // Redelivery lands at the tail, after the delay.
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                if inner.shutting_down.load(Ordering::SeqCst) {
                                    tracing::warn!(topic = %topic, "retry dropped at shutdown");
                                    return;
                                }
                                if tx.send(delivery).await.is_err() {
                                    tracing::warn!(topic = %topic, "retry dropped, queue closed");
                                }
                            });
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, message: Value) -> Result<bool, BusError> {
        self.inner.enqueue(
            topic,
            Delivery {
                payload: message,
                attempts: 0,
                last_error: None,
            },
        )
    }

    async fn publish_response(&self, message: Value) -> Result<bool, BusError> {
        let topic = self.inner.settings.topics.response.clone();
        self.publish(&topic, message).await
    }

    async fn subscribe(&self, topic: &str, handler: DeliveryHandler) -> Result<(), BusError> {
        let queue = self.inner.topic(topic);
        if queue.subscribed.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadySubscribed(topic.to_string()));
        }
        let threads = self.inner.settings.consumer_threads.max(1);
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        for _ in 0..threads {
            workers.push(self.spawn_worker(topic.to_string(), Arc::clone(&handler)));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> MessagingSettings {
        MessagingSettings::default()
    }

    /// **Scenario**: retry delays double from the base and cap at the max.
    #[test]
    fn retry_delay_doubles_and_caps() {
        let mut s = settings();
        s.retry_delay_ms = 1000;
        s.max_retry_delay_ms = 30_000;
        assert_eq!(retry_delay(&s, 1), Duration::from_millis(1000));
        assert_eq!(retry_delay(&s, 2), Duration::from_millis(2000));
        assert_eq!(retry_delay(&s, 3), Duration::from_millis(4000));
        assert_eq!(retry_delay(&s, 6), Duration::from_millis(30_000));
        assert_eq!(retry_delay(&s, 31), Duration::from_millis(30_000));

        s.exponential_backoff = false;
        assert_eq!(retry_delay(&s, 5), Duration::from_millis(1000));
    }

    /// **Scenario**: non-object payloads are wrapped before dead-lettering.
    #[test]
    fn attach_failure_wraps_non_objects() {
        let out = attach_failure(Value::String("raw".into()), 4, Some("boom".into()));
        assert_eq!(out["payload"], "raw");
        assert_eq!(out["attempts"], 4);
        assert_eq!(out["lastError"], "boom");

        let out = attach_failure(serde_json::json!({"type": "x"}), 2, None);
        assert_eq!(out["type"], "x");
        assert_eq!(out["attempts"], 2);
        assert!(out.get("lastError").is_none());
    }

    /// **Scenario**: enqueue is refused once shutdown begins.
    #[tokio::test]
    async fn shutdown_refuses_enqueue() {
        let bus = LocalBus::new(settings());
        assert!(bus.publish("event", serde_json::json!({})).await.unwrap());
        bus.shutdown().await;
        assert!(matches!(
            bus.publish("event", serde_json::json!({})).await,
            Err(BusError::ShuttingDown)
        ));
    }

    /// **Scenario**: a full queue surfaces backpressure as `Ok(false)`.
    #[tokio::test]
    async fn full_queue_returns_false() {
        let mut s = settings();
        s.queue_capacity = 1;
        let bus = LocalBus::new(s);
        assert!(bus.publish("event", serde_json::json!({"n": 1})).await.unwrap());
        assert!(!bus.publish("event", serde_json::json!({"n": 2})).await.unwrap());
    }
}

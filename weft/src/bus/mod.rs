//! Provider-agnostic pub/sub bus with at-least-once delivery.
//!
//! Two interchangeable backends implement [`MessageBus`]: the in-process
//! [`LocalBus`] (bounded queues, worker pool, retry + DLQ) and the AMQP
//! [`BrokerBus`] (ack on handler success, nack + redeliver on failure).
//! Handlers signal failure by returning [`DeliveryError`]; the backend decides
//! how redelivery happens.

mod broker;
mod local;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

pub use broker::BrokerBus;
pub use local::LocalBus;

/// Handler failure: the delivered message must be retried by the backend.
#[derive(Debug, Error)]
#[error("delivery failed: {reason}")]
pub struct DeliveryError {
    pub reason: String,
}

impl DeliveryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Bus-level failures (as opposed to handler failures).
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is shutting down")]
    ShuttingDown,
    #[error("topic {0} already subscribed")]
    AlreadySubscribed(String),
    #[error("queue {0} is full")]
    QueueFull(String),
    #[error("broker: {0}")]
    Broker(String),
    #[error("serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Delivery callback: invoked once per delivered message; `Err` triggers
/// redelivery per the backend's policy.
pub type DeliveryHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), DeliveryError>> + Send + Sync>;

/// Provider-agnostic publish/subscribe contract.
///
/// Delivery is at-least-once. With a single consumer per topic, delivery
/// order is enqueue order (retries re-appear at the tail). The `audit` topic
/// is publish-only from the core.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a message. Returns `false` when the backend refused it for
    /// backpressure (local backend with a full queue); the caller decides
    /// whether to back off.
    async fn publish(&self, topic: &str, message: Value) -> Result<bool, BusError>;

    /// Shorthand for publishing on the configured `response` topic.
    async fn publish_response(&self, message: Value) -> Result<bool, BusError>;

    /// Registers the delivery callback for a topic. At most one subscription
    /// per topic per bus instance; later calls replace nothing and error on
    /// the local backend.
    async fn subscribe(&self, topic: &str, handler: DeliveryHandler) -> Result<(), BusError>;

    /// Graceful shutdown: refuse new enqueues, drain in-flight callbacks.
    async fn shutdown(&self);
}

/// Dead-letter topic for `topic`.
pub fn dlq_topic(topic: &str) -> String {
    format!("{topic}.DLQ")
}

/// Wraps an async closure as a [`DeliveryHandler`].
pub fn handler<F, Fut>(f: F) -> DeliveryHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), DeliveryError>> + Send + 'static,
{
    Arc::new(move |value| Box::pin(f(value)))
}

//! External-broker bus backend over AMQP.
//!
//! Delivery is transactional from the handler's point of view: the message is
//! acked when the callback returns `Ok` and nacked with requeue when it
//! returns `Err`, so the broker redelivers it. Publishing from inside a
//! delivery callback rides the same channel and is confirmed by the broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use config::MessagingSettings;
use dashmap::DashMap;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BusError, DeliveryError, DeliveryHandler, MessageBus};

fn broker_err(e: lapin::Error) -> BusError {
    BusError::Broker(e.to_string())
}

/// How one consumed delivery is settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Settlement {
    /// Settle the message: the handler succeeded, or the payload can never
    /// route and redelivery would only loop it.
    Ack,
    /// Roll the delivery back so the broker redelivers it.
    Requeue,
}

/// Decodes a consumed payload. `Err` means the bytes are not JSON at all;
/// such a message is settled without redelivery (it would poison the queue).
fn decode_payload(data: &[u8]) -> Result<Value, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Maps one handler outcome onto the ack/nack decision.
fn settle(outcome: &Result<(), DeliveryError>) -> Settlement {
    match outcome {
        Ok(()) => Settlement::Ack,
        Err(_) => Settlement::Requeue,
    }
}

/// Nack options for a rolled-back delivery: back onto the queue, this
/// delivery only.
fn requeue_options() -> BasicNackOptions {
    BasicNackOptions {
        requeue: true,
        ..Default::default()
    }
}

/// AMQP-backed [`MessageBus`]. One durable queue per topic, manual ack.
pub struct BrokerBus {
    _connection: Connection,
    channel: Channel,
    settings: MessagingSettings,
    declared: DashMap<String, ()>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    shutting_down: AtomicBool,
}

impl BrokerBus {
    /// Connects to the broker and opens the publish/consume channel with
    /// publisher confirms and per-consumer prefetch of one (preserved order).
    pub async fn connect(settings: MessagingSettings) -> Result<Self, BusError> {
        let connection =
            Connection::connect(&settings.broker_url, ConnectionProperties::default())
                .await
                .map_err(broker_err)?;
        let channel = connection.create_channel().await.map_err(broker_err)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker_err)?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(broker_err)?;
        Ok(Self {
            _connection: connection,
            channel,
            settings,
            declared: DashMap::new(),
            consumers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    async fn ensure_queue(&self, topic: &str) -> Result<(), BusError> {
        if self.declared.contains_key(topic) {
            return Ok(());
        }
        self.channel
            .queue_declare(
                topic,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;
        self.declared.insert(topic.to_string(), ());
        Ok(())
    }
}

#[async_trait]
impl MessageBus for BrokerBus {
    async fn publish(&self, topic: &str, message: Value) -> Result<bool, BusError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown);
        }
        self.ensure_queue(topic).await?;
        let payload = serde_json::to_vec(&message)?;
        let confirm = self
            .channel
            .basic_publish(
                "",
                topic,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(broker_err)?;
        confirm.await.map_err(broker_err)?;
        Ok(true)
    }

    async fn publish_response(&self, message: Value) -> Result<bool, BusError> {
        let topic = self.settings.topics.response.clone();
        self.publish(&topic, message).await
    }

    async fn subscribe(&self, topic: &str, handler: DeliveryHandler) -> Result<(), BusError> {
        self.ensure_queue(topic).await?;
        let tag = format!("weft-{}-{}", topic, uuid::Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                topic,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;

        let cancel = self.cancel.clone();
        let topic = topic.to_string();
        let task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = consumer.next() => next,
                };
                let delivery = match next {
                    Some(Ok(d)) => d,
                    Some(Err(e)) => {
                        tracing::warn!(topic = %topic, error = %e, "consume error");
                        continue;
                    }
                    None => break,
                };

                let value = match decode_payload(&delivery.data) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "discarding non-JSON payload");
                        if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                            tracing::warn!(topic = %topic, error = %e, "ack failed");
                        }
                        continue;
                    }
                };

                let outcome = handler(value).await;
                if let Err(e) = &outcome {
                    tracing::warn!(topic = %topic, error = %e, "rolling back delivery");
                }
                match settle(&outcome) {
                    Settlement::Ack => {
                        if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                            tracing::warn!(topic = %topic, error = %e, "ack failed");
                        }
                    }
                    Settlement::Requeue => {
                        if let Err(e) = delivery.acker.nack(requeue_options()).await {
                            tracing::warn!(topic = %topic, error = %e, "nack failed");
                        }
                    }
                }
            }
        });
        self.consumers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task);
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let consumers = {
            let mut guard = self.consumers.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        for consumer in consumers {
            let _ = consumer.await;
        }
        let _ = self.channel.close(200, "shutdown").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: handler success acks, handler failure rolls back.
    #[test]
    fn settlement_follows_handler_outcome() {
        assert_eq!(settle(&Ok(())), Settlement::Ack);
        assert_eq!(
            settle(&Err(DeliveryError::new("boom"))),
            Settlement::Requeue
        );
    }

    /// **Scenario**: a rolled-back delivery goes back onto the queue, and
    /// only that delivery.
    #[test]
    fn requeue_options_return_the_message() {
        let options = requeue_options();
        assert!(options.requeue);
        assert!(!options.multiple);
    }

    /// **Scenario**: JSON payloads decode; non-JSON bytes are poison and are
    /// settled without redelivery.
    #[test]
    fn decode_payload_accepts_only_json() {
        let value = decode_payload(br#"{"type": "cmdA", "eventKey": "e1"}"#).unwrap();
        assert_eq!(value["type"], "cmdA");
        assert!(decode_payload(b"not json at all").is_err());
        assert!(decode_payload(b"").is_err());
    }
}

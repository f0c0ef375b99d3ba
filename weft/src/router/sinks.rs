//! Terminal sinks: where chains end and where unroutable payloads go.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::bus::MessageBus;

/// Terminal service for envelopes that do not route to a command.
#[async_trait]
pub trait TerminalSink: Send + Sync {
    async fn accept(&self, envelope: &Value, reason: &str);
}

fn envelope_field<'a>(envelope: &'a Value, key: &str) -> &'a str {
    envelope.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Marks the end of a chain of commands.
pub struct EndNodeSink {
    bus: Arc<dyn MessageBus>,
    audit_topic: String,
}

impl EndNodeSink {
    pub fn new(bus: Arc<dyn MessageBus>, audit_topic: impl Into<String>) -> Self {
        Self {
            bus,
            audit_topic: audit_topic.into(),
        }
    }
}

#[async_trait]
impl TerminalSink for EndNodeSink {
    async fn accept(&self, envelope: &Value, _reason: &str) {
        let event_key = envelope_field(envelope, "eventKey");
        tracing::info!(
            event_key,
            session_id = envelope_field(envelope, "sessionId"),
            "command chain completed"
        );
        let record = json!({
            "event": "chain_completed",
            "eventKey": event_key,
            "sessionId": envelope_field(envelope, "sessionId"),
            "messageType": envelope_field(envelope, "messageType"),
        });
        if let Err(e) = self.bus.publish(&self.audit_topic, record).await {
            tracing::debug!(error = %e, "audit publish skipped");
        }
    }
}

/// Handles payloads whose structured output failed to parse or whose command
/// could not be resolved.
pub struct IncompleteSink {
    bus: Arc<dyn MessageBus>,
    audit_topic: String,
}

impl IncompleteSink {
    pub fn new(bus: Arc<dyn MessageBus>, audit_topic: impl Into<String>) -> Self {
        Self {
            bus,
            audit_topic: audit_topic.into(),
        }
    }
}

#[async_trait]
impl TerminalSink for IncompleteSink {
    async fn accept(&self, envelope: &Value, reason: &str) {
        let has_trace = envelope.get("llmConversation").is_some();
        tracing::warn!(
            reason,
            event_key = envelope_field(envelope, "eventKey"),
            session_id = envelope_field(envelope, "sessionId"),
            has_trace,
            "incomplete payload"
        );
        let record = json!({
            "event": "incomplete",
            "reason": reason,
            "eventKey": envelope_field(envelope, "eventKey"),
            "sessionId": envelope_field(envelope, "sessionId"),
        });
        if let Err(e) = self.bus.publish(&self.audit_topic, record).await {
            tracing::debug!(error = %e, "audit publish skipped");
        }
    }
}

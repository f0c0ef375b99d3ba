//! Handler contract: per-command post-processing invoked on end of flow.
//!
//! A handler is named by the command name and decides where the chain goes
//! next. The runtime assembles the routing map (identifiers + parsed
//! structured output, or the unstructured trace on parse failure), enforces
//! the wire-size cap, and publishes exactly one message on the `response`
//! topic.

use std::sync::Arc;

use async_trait::async_trait;
use config::HandlerSettings;
use dashmap::DashMap;
use serde_json::{Map, Value};
use task_frame::{TaskResponse, END_NODE_TYPE, INCOMPLETE_TYPE};
use thiserror::Error;

use crate::bus::{BusError, MessageBus};
use crate::session::CommandSession;

/// Where the chain goes after a completed session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Chain into the named command.
    Next(String),
    /// Terminal cleanup.
    End,
    /// Validation-failure path.
    Incomplete,
}

impl Route {
    /// The `type` value this route produces on the wire.
    pub fn type_name(&self) -> &str {
        match self {
            Route::Next(name) => name,
            Route::End => END_NODE_TYPE,
            Route::Incomplete => INCOMPLETE_TYPE,
        }
    }
}

#[derive(Debug, Error)]
#[error("handler: {0}")]
pub struct HandlerError(pub String);

/// Per-command extension point, called with the completed session and the
/// ordered agent responses. `output` is the parsed structured output, absent
/// when parsing failed (the runtime then forces the incomplete route).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        session: &CommandSession,
        responses: &[TaskResponse],
        output: Option<&Value>,
    ) -> Result<Route, HandlerError>;
}

/// Chains into a fixed next command when the agent reported success.
pub struct ChainHandler {
    next: String,
}

impl ChainHandler {
    pub fn to(next: impl Into<String>) -> Self {
        Self { next: next.into() }
    }
}

#[async_trait]
impl Handler for ChainHandler {
    async fn handle(
        &self,
        _session: &CommandSession,
        _responses: &[TaskResponse],
        output: Option<&Value>,
    ) -> Result<Route, HandlerError> {
        if success_flag(output) {
            Ok(Route::Next(self.next.clone()))
        } else {
            Ok(Route::End)
        }
    }
}

/// Terminal handler: always ends the chain.
pub struct EndHandler;

#[async_trait]
impl Handler for EndHandler {
    async fn handle(
        &self,
        _session: &CommandSession,
        _responses: &[TaskResponse],
        _output: Option<&Value>,
    ) -> Result<Route, HandlerError> {
        Ok(Route::End)
    }
}

/// True when the structured output carries `"success": true`.
pub fn success_flag(output: Option<&Value>) -> bool {
    output
        .and_then(|o| o.get("success"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Name-keyed handler registry with a terminal fallback.
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn Handler>>,
    fallback: Arc<dyn Handler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            fallback: Arc::new(EndHandler),
        }
    }

    pub fn register(&self, command: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(command.into(), handler);
    }

    /// The handler for a command, or the terminal fallback.
    pub fn resolve(&self, command: &str) -> Arc<dyn Handler> {
        self.handlers
            .get(command)
            .map(|h| Arc::clone(h.value()))
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

/// Assembles the routing map for one completed session.
///
/// Structured-output fields land at the top level, identifier fields are
/// added on top, and `type` is set last so the route always wins. On the
/// incomplete route the full unstructured trace rides along as
/// `llmConversation`.
pub fn build_routing_map(
    session: &CommandSession,
    request_id: &str,
    checkpoint_id: Option<&str>,
    responses: &[TaskResponse],
    output: Option<&Value>,
    route: &Route,
) -> Map<String, Value> {
    let mut map = match output {
        Some(Value::Object(fields)) => fields.clone(),
        _ => Map::new(),
    };
    map.insert("eventKey".into(), Value::String(session.event_key.clone()));
    map.insert("sessionId".into(), Value::String(session.session_id.clone()));
    map.insert("requestId".into(), Value::String(request_id.to_string()));
    map.insert(
        "checkpointId".into(),
        checkpoint_id
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null),
    );
    map.insert(
        "messageType".into(),
        Value::String(session.message_type.clone()),
    );
    if matches!(route, Route::Incomplete) {
        let trace = responses
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect::<Vec<_>>();
        map.insert("llmConversation".into(), Value::Array(trace));
    }
    map.insert("type".into(), Value::String(route.type_name().to_string()));
    map
}

/// Enforces the wire-size cap: when the serialized map exceeds it, the
/// `llmConversation` field is stripped and the map re-serialized. Nothing is
/// ever truncated silently.
pub fn apply_wire_cap(mut map: Map<String, Value>, max_bytes: usize) -> Map<String, Value> {
    let size = serde_json::to_string(&map).map(|s| s.len()).unwrap_or(0);
    if size > max_bytes && map.contains_key("llmConversation") {
        tracing::warn!(
            size,
            cap = max_bytes,
            "routing message over wire cap, stripping conversation trace"
        );
        map.remove("llmConversation");
    }
    map
}

/// Serializes the map under the wire-size cap and publishes it on `response`.
pub async fn publish_routing(
    bus: &dyn MessageBus,
    settings: &HandlerSettings,
    map: Map<String, Value>,
) -> Result<(), BusError> {
    let map = apply_wire_cap(map, settings.max_message_size_bytes);
    if !bus.publish_response(Value::Object(map)).await? {
        return Err(BusError::QueueFull("response".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> CommandSession {
        CommandSession::from_envelope("cmdA", json!({"EventKey": "e1"}))
    }

    /// **Scenario**: output fields merge at top level and identifiers win.
    #[test]
    fn routing_map_merges_output() {
        let s = session();
        let output = json!({"success": true, "summary": "ok", "type": "spoofed"});
        let map = build_routing_map(
            &s,
            "req-9",
            Some("c7"),
            &[],
            Some(&output),
            &Route::Next("cmdB".into()),
        );
        assert_eq!(map["summary"], "ok");
        assert_eq!(map["type"], "cmdB");
        assert_eq!(map["eventKey"], "e1");
        assert_eq!(map["requestId"], "req-9");
        assert_eq!(map["checkpointId"], "c7");
        assert_eq!(map["messageType"], "cmdA");
    }

    /// **Scenario**: the incomplete route carries the full trace and a null
    /// checkpoint when none was assigned.
    #[test]
    fn incomplete_route_carries_trace() {
        let s = session();
        let responses = vec![TaskResponse {
            kind: Some("userresponse".into()),
            ..Default::default()
        }];
        let map = build_routing_map(&s, "req-1", None, &responses, None, &Route::Incomplete);
        assert_eq!(map["type"], INCOMPLETE_TYPE);
        assert_eq!(map["checkpointId"], Value::Null);
        assert_eq!(map["llmConversation"].as_array().unwrap().len(), 1);
    }

    /// **Scenario**: an over-cap map loses its trace, never its data; a map
    /// within the cap keeps everything.
    #[test]
    fn wire_cap_strips_only_the_trace() {
        let s = session();
        let responses = vec![TaskResponse {
            kind: Some("userresponse".into()),
            error: Some("x".repeat(512)),
            ..Default::default()
        }];
        let map = build_routing_map(&s, "req-1", None, &responses, None, &Route::Incomplete);

        let capped = apply_wire_cap(map.clone(), 256);
        assert!(!capped.contains_key("llmConversation"));
        assert_eq!(capped["type"], INCOMPLETE_TYPE);
        assert_eq!(capped["eventKey"], "e1");

        let uncapped = apply_wire_cap(map, 1024 * 1024);
        assert!(uncapped.contains_key("llmConversation"));
    }

    /// **Scenario**: success flag reads only a boolean `success`.
    #[test]
    fn success_flag_requires_bool() {
        assert!(success_flag(Some(&json!({"success": true}))));
        assert!(!success_flag(Some(&json!({"success": "true"}))));
        assert!(!success_flag(Some(&json!({}))));
        assert!(!success_flag(None));
    }

    /// **Scenario**: unregistered commands resolve to the terminal fallback.
    #[tokio::test]
    async fn registry_falls_back_to_end() {
        let registry = HandlerRegistry::new();
        registry.register("cmdA", Arc::new(ChainHandler::to("cmdB")));

        let s = session();
        let out = json!({"success": true});
        let route = registry
            .resolve("cmdA")
            .handle(&s, &[], Some(&out))
            .await
            .unwrap();
        assert_eq!(route, Route::Next("cmdB".into()));

        let route = registry
            .resolve("unknown")
            .handle(&s, &[], Some(&out))
            .await
            .unwrap();
        assert_eq!(route, Route::End);
    }
}

//! Bus envelopes and outbound route-keyed framing.
//!
//! Every bus payload is a JSON object with a mandatory string `type` field
//! naming a command or a sentinel. Outbound session traffic is framed as
//! `"<ROUTE_KEY> <json>\n"`.

use serde_json::Value;

/// Sentinel `type` marking the end of a command chain.
pub const END_NODE_TYPE: &str = "end_node";
/// Sentinel `type` for payloads whose structured output failed to parse or
/// whose command could not be resolved.
pub const INCOMPLETE_TYPE: &str = "incomplete";

/// Route key of an outbound session frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteKey {
    UserQuery,
    IdeRetrievalAnswer,
    Resume,
}

impl RouteKey {
    /// Wire name of this route key.
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKey::UserQuery => "UserQuery",
            RouteKey::IdeRetrievalAnswer => "IDERetrievalAnswer",
            RouteKey::Resume => "Resume",
        }
    }

    /// Encodes one outbound frame: `"<ROUTE_KEY> <json>\n"`.
    pub fn encode(&self, payload: &Value) -> String {
        format!("{} {}\n", self.as_str(), payload)
    }
}

/// Parses a bus payload into a JSON value. The payload must be an object;
/// anything else is rejected so the router can route it to the incomplete sink.
pub fn parse_envelope(raw: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Reads the routing `type` field of an envelope. `None` when the field is
/// absent, null, or not a string.
pub fn message_type(envelope: &Value) -> Option<&str> {
    envelope.get("type").and_then(Value::as_str)
}

//! Command sessions: the runtime value for one command invocation and the
//! agent-session runtime that drives it.

pub mod runtime;

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::bus::BusError;
use crate::catalog::AgentCommand;
use crate::transport::TransportError;

/// Runtime value carrying identifiers and payload for one command invocation.
///
/// Owned exclusively by the session service handling it. `session_id` and
/// `message_type` are non-empty by the time the runtime sees it; on reconnect
/// only the request id and checkpoint change (tracked by the transport), all
/// other fields stay stable.
#[derive(Clone, Debug)]
pub struct CommandSession {
    pub session_id: String,
    /// Initial request id; the transport regenerates it per connect attempt.
    pub request_id: String,
    /// Server-assigned resume token, absent until the first READY carries one.
    pub check_point_id: Option<String>,
    /// Idempotency key from the ingress side, propagated unchanged.
    pub event_key: String,
    /// Command name selecting the agent command and the downstream handler.
    pub message_type: String,
    /// Parsed JSON payload of the triggering event.
    pub payload: Value,
    pub agent_command: Option<Arc<AgentCommand>>,
    pub attempt_count: u32,
    pub project_structure: Option<String>,
    /// Names of the tool servers attached for this session.
    pub tool_clients: Vec<String>,
}

impl CommandSession {
    /// Builds a session from a routed envelope. The session id is taken from
    /// the envelope when a chained invocation carries one, else minted fresh;
    /// the event key is propagated from either accepted spelling.
    pub fn from_envelope(message_type: impl Into<String>, envelope: Value) -> Self {
        let session_id = envelope
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let event_key = envelope
            .get("eventKey")
            .or_else(|| envelope.get("EventKey"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            session_id,
            request_id: Uuid::new_v4().to_string(),
            check_point_id: None,
            event_key,
            message_type: message_type.into(),
            payload: envelope,
            agent_command: None,
            attempt_count: 0,
            project_structure: None,
            tool_clients: Vec::new(),
        }
    }
}

/// Lifecycle of one session run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestBuild,
    Connecting,
    AwaitReady,
    Sending,
    Streaming,
    Complete,
    Failed,
}

/// Fatal session failure. Thrown on the delivery task so the enclosing bus
/// delivery rolls back and the message is redelivered.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("service not initialized")]
    NotInitialized,
    #[error("session {session_id}: no agent command resolved for {message_type}")]
    MissingCommand {
        session_id: String,
        message_type: String,
    },
    #[error("session {session_id}: READY signal timed out after {seconds} seconds")]
    ReadyTimeout { session_id: String, seconds: u64 },
    #[error("session {session_id}: transport: {source}")]
    Transport {
        session_id: String,
        #[source]
        source: TransportError,
    },
    #[error("session {session_id}: connection closed before end of flow")]
    ClosedEarly { session_id: String },
    #[error("session {session_id}: publish routing message: {source}")]
    Publish {
        session_id: String,
        #[source]
        source: BusError,
    },
}

//! Stdio tool-server session: spawn the server process, perform the
//! initialize handshake, and speak line-delimited JSON-RPC 2.0.
//!
//! Requests are correlated by numeric id through a pending map; a background
//! reader task routes responses to their waiting callers. Server-initiated
//! requests and notifications are ignored; the registry only needs
//! `tools/list` and `tools/call`.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use task_frame::ToolDescriptor;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::catalog::ToolServerDescriptor;

/// Protocol version sent in the initialize handshake.
const PROTOCOL_VERSION: &str = "2025-11-25";
/// Bound on the initialize round trip.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(20);

/// Errors from one stdio session.
#[derive(Debug, thiserror::Error)]
pub enum ToolSessionError {
    #[error("spawn: {0}")]
    Spawn(std::io::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("initialize: {0}")]
    Initialize(String),
    #[error("json-rpc: {0}")]
    JsonRpc(String),
    #[error("malformed response: {0}")]
    Protocol(String),
    #[error("request timed out")]
    Timeout,
    #[error("server closed the session")]
    Closed,
}

/// Result of one `tools/call`: the raw content blocks and the error flag.
#[derive(Clone, Debug)]
pub struct ToolCallOutcome {
    pub content: Vec<Value>,
    pub is_error: bool,
}

impl ToolCallOutcome {
    /// Texts of all `{"type": "text"}` content blocks, in order.
    pub fn texts(&self) -> Vec<String> {
        self.content
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

/// One spawned tool-server process with its JSON-RPC plumbing.
pub struct StdioToolSession {
    _child: Child,
    stdin: Mutex<ChildStdin>,
    pending: Arc<DashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    _reader: JoinHandle<()>,
}

impl StdioToolSession {
    /// Spawns the server and completes the initialize handshake.
    pub async fn spawn(descriptor: &ToolServerDescriptor) -> Result<Self, ToolSessionError> {
        let mut child = Command::new(&descriptor.command)
            .args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(ToolSessionError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolSessionError::Protocol("no stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolSessionError::Protocol("no stdout pipe".into()))?;

        let pending: Arc<DashMap<u64, oneshot::Sender<Value>>> = Arc::new(DashMap::new());
        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let message: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping non-JSON line from tool server");
                        continue;
                    }
                };
                // Responses carry an id and no method; requests/notifications
                // from the server are not part of the contract and are skipped.
                if message.get("method").is_some() {
                    continue;
                }
                if let Some(id) = message.get("id").and_then(Value::as_u64) {
                    if let Some((_, tx)) = reader_pending.remove(&id) {
                        let _ = tx.send(message);
                    }
                }
            }
        });

        let session = Self {
            _child: child,
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            _reader: reader,
        };
        session.initialize().await?;
        Ok(session)
    }

    /// Initialize handshake: `initialize` request then `notifications/initialized`.
    async fn initialize(&self) -> Result<(), ToolSessionError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": "weft",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let result = self
            .request("initialize", params, INITIALIZE_TIMEOUT)
            .await
            .map_err(|e| ToolSessionError::Initialize(e.to_string()))?;
        if result.get("error").is_some() {
            return Err(ToolSessionError::Initialize(
                rpc_error_message(&result).unwrap_or_else(|| "unknown".into()),
            ));
        }
        self.notify("notifications/initialized", json!({})).await
    }

    async fn write_line(&self, message: &Value) -> Result<(), ToolSessionError> {
        let mut line = message.to_string();
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), ToolSessionError> {
        self.write_line(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    /// Sends one request and waits for its response up to `timeout`.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ToolSessionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_line(&message).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ToolSessionError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(ToolSessionError::Timeout)
            }
        }
    }

    /// `tools/call`: returns the outcome with its error flag intact.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolCallOutcome, ToolSessionError> {
        let params = json!({ "name": name, "arguments": arguments });
        let response = self.request("tools/call", params, timeout).await?;
        parse_call_result(&response)
    }

    /// `tools/list`: the server's current tool set.
    pub async fn list_tools(
        &self,
        timeout: Duration,
    ) -> Result<Vec<ToolDescriptor>, ToolSessionError> {
        let response = self
            .request("tools/list", json!({}), timeout)
            .await?;
        parse_list_result(&response)
    }
}

fn rpc_error_message(response: &Value) -> Option<String> {
    response
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Parses a `tools/call` response into an outcome.
fn parse_call_result(response: &Value) -> Result<ToolCallOutcome, ToolSessionError> {
    if response.get("error").is_some() {
        return Err(ToolSessionError::JsonRpc(
            rpc_error_message(response).unwrap_or_else(|| "rpc failed".into()),
        ));
    }
    let result = response
        .get("result")
        .ok_or_else(|| ToolSessionError::Protocol("no result in tools/call response".into()))?;
    let content = result
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(ToolCallOutcome { content, is_error })
}

/// Parses a `tools/list` response into descriptors.
fn parse_list_result(response: &Value) -> Result<Vec<ToolDescriptor>, ToolSessionError> {
    if response.get("error").is_some() {
        return Err(ToolSessionError::JsonRpc(
            rpc_error_message(response).unwrap_or_else(|| "rpc failed".into()),
        ));
    }
    let tools = response
        .get("result")
        .and_then(|r| r.get("tools"))
        .ok_or_else(|| ToolSessionError::Protocol("no tools in response".into()))?;
    serde_json::from_value(tools.clone())
        .map_err(|e| ToolSessionError::Protocol(format!("tools not decodable: {e}")))
}

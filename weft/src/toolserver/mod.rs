//! Tool-server registry: spawn, health-check and pool client handles to the
//! tool servers a command declares.
//!
//! Handles are shared by server name across concurrent sessions; calls to the
//! same server are serialized through the session mutex because not every
//! server tolerates interleaved requests. Spawn and first-call failures mark
//! the server failed for health reporting but never panic the runtime;
//! individual call failures surface to the session runtime, which answers the
//! agent with a tool-failed frame.

mod session;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use config::ToolServerSettings;
use dashmap::DashMap;
use serde_json::Value;
use task_frame::ToolDescriptor;
use thiserror::Error;

use crate::catalog::ToolServerDescriptor;

pub use session::{StdioToolSession, ToolCallOutcome, ToolSessionError};

/// Errors surfaced to callers of the registry.
#[derive(Debug, Error)]
pub enum ToolServerError {
    #[error("tool server {name}: spawn failed: {message}")]
    Spawn { name: String, message: String },
    #[error("tool server {name} is unavailable")]
    Unavailable { name: String },
    #[error("tool {tool} timed out after {seconds} seconds")]
    Timeout { tool: String, seconds: u64 },
    #[error("tool server {name}: {message}")]
    Call { name: String, message: String },
}

/// Health of one registered server.
#[derive(Clone, Debug)]
pub struct ServerHealth {
    pub name: String,
    pub healthy: bool,
    pub error: Option<String>,
}

/// The call surface the session runtime depends on. Split from the concrete
/// registry so tests can substitute a scripted implementation.
#[async_trait]
pub trait ToolServers: Send + Sync {
    /// Spawns and initializes the named server unless already registered.
    async fn ensure(
        &self,
        name: &str,
        descriptor: &ToolServerDescriptor,
    ) -> Result<(), ToolServerError>;

    /// Invokes one tool with the configured per-request timeout.
    async fn call(
        &self,
        server: &str,
        tool: &str,
        args: Value,
    ) -> Result<ToolCallOutcome, ToolServerError>;

    /// Last known tool list of the server (refreshed by health probes).
    fn cached_tools(&self, server: &str) -> Vec<ToolDescriptor>;
}

struct ServerHandle {
    session: tokio::sync::Mutex<StdioToolSession>,
    tools: std::sync::RwLock<Vec<ToolDescriptor>>,
    failed: AtomicBool,
    last_error: std::sync::Mutex<Option<String>>,
}

impl ServerHandle {
    fn mark_failed(&self, message: &str) {
        self.failed.store(true, Ordering::SeqCst);
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(message.to_string());
    }

    fn mark_healthy(&self) {
        self.failed.store(false, Ordering::SeqCst);
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

/// Registry of spawned tool servers keyed by name.
pub struct ToolServerRegistry {
    settings: ToolServerSettings,
    servers: DashMap<String, Arc<ServerHandle>>,
    /// Servers that never came up, kept for health reporting.
    spawn_failures: DashMap<String, String>,
}

impl ToolServerRegistry {
    pub fn new(settings: ToolServerSettings) -> Self {
        Self {
            settings,
            servers: DashMap::new(),
            spawn_failures: DashMap::new(),
        }
    }

    /// Health of every server the registry has seen, including spawn failures.
    pub async fn health(&self) -> Vec<ServerHealth> {
        let mut report = Vec::new();
        for entry in self.servers.iter() {
            let (name, handle) = (entry.key().clone(), Arc::clone(entry.value()));
            // Probe: a tools/list round trip refreshes the cache.
            let probe = {
                let session = handle.session.lock().await;
                session.list_tools(self.settings.request_timeout()).await
            };
            match probe {
                Ok(tools) => {
                    *handle.tools.write().unwrap_or_else(|p| p.into_inner()) = tools;
                    handle.mark_healthy();
                    report.push(ServerHealth {
                        name,
                        healthy: true,
                        error: None,
                    });
                }
                Err(e) => {
                    handle.mark_failed(&e.to_string());
                    report.push(ServerHealth {
                        name,
                        healthy: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        for entry in self.spawn_failures.iter() {
            report.push(ServerHealth {
                name: entry.key().clone(),
                healthy: false,
                error: Some(entry.value().clone()),
            });
        }
        report
    }
}

#[async_trait]
impl ToolServers for ToolServerRegistry {
    async fn ensure(
        &self,
        name: &str,
        descriptor: &ToolServerDescriptor,
    ) -> Result<(), ToolServerError> {
        if self.servers.contains_key(name) {
            return Ok(());
        }
        let session = match StdioToolSession::spawn(descriptor).await {
            Ok(s) => s,
            Err(e) => {
                let message = e.to_string();
                self.spawn_failures.insert(name.to_string(), message.clone());
                tracing::warn!(server = %name, error = %message, "tool server spawn failed");
                return Err(ToolServerError::Spawn {
                    name: name.to_string(),
                    message,
                });
            }
        };

        // First probe doubles as the health check and seeds the tool cache.
        let tools = match session.list_tools(self.settings.request_timeout()).await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "tool server first probe failed");
                Vec::new()
            }
        };

        let handle = Arc::new(ServerHandle {
            session: tokio::sync::Mutex::new(session),
            tools: std::sync::RwLock::new(tools),
            failed: AtomicBool::new(false),
            last_error: std::sync::Mutex::new(None),
        });
        self.servers.insert(name.to_string(), handle);
        self.spawn_failures.remove(name);
        tracing::info!(server = %name, command = %descriptor.command, "tool server registered");
        Ok(())
    }

    async fn call(
        &self,
        server: &str,
        tool: &str,
        args: Value,
    ) -> Result<ToolCallOutcome, ToolServerError> {
        let handle = self
            .servers
            .get(server)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| ToolServerError::Unavailable {
                name: server.to_string(),
            })?;

        let timeout = self.settings.request_timeout();
        let result = {
            let session = handle.session.lock().await;
            session.call_tool(tool, args, timeout).await
        };

        match result {
            Ok(outcome) => {
                handle.mark_healthy();
                Ok(outcome)
            }
            Err(ToolSessionError::Timeout) => Err(ToolServerError::Timeout {
                tool: tool.to_string(),
                seconds: self.settings.request_timeout_seconds,
            }),
            Err(e @ (ToolSessionError::Closed | ToolSessionError::Io(_))) => {
                handle.mark_failed(&e.to_string());
                Err(ToolServerError::Call {
                    name: server.to_string(),
                    message: e.to_string(),
                })
            }
            Err(e) => Err(ToolServerError::Call {
                name: server.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn cached_tools(&self, server: &str) -> Vec<ToolDescriptor> {
        self.servers
            .get(server)
            .map(|h| {
                h.tools
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: a spawn failure is recorded for health reporting and the
    /// server stays unavailable for calls.
    #[tokio::test]
    async fn spawn_failure_marks_server_failed() {
        let registry = ToolServerRegistry::new(ToolServerSettings::default());
        let descriptor = ToolServerDescriptor {
            command: "_weft_no_such_binary_".into(),
            args: vec![],
            env: Default::default(),
        };
        let err = registry.ensure("broken", &descriptor).await.unwrap_err();
        assert!(matches!(err, ToolServerError::Spawn { ref name, .. } if name == "broken"));

        let err = registry
            .call("broken", "read", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerError::Unavailable { .. }));

        let health = registry.health().await;
        assert_eq!(health.len(), 1);
        assert!(!health[0].healthy);
        assert!(health[0].error.is_some());
    }

    /// **Scenario**: unknown servers have no cached tools.
    #[test]
    fn cached_tools_empty_for_unknown() {
        let registry = ToolServerRegistry::new(ToolServerSettings::default());
        assert!(registry.cached_tools("nope").is_empty());
    }
}

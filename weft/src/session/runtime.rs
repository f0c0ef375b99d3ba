//! Agent-session runtime: drives one command session end to end.
//!
//! One service instance handles one delivery: it renders the request from the
//! command template, opens the resilient transport, waits for READY, sends
//! exactly one user query, dispatches the interleaved frame stream (tool
//! calls, responses, structured output), and on ENDNODE invokes the
//! per-command handler and publishes exactly one routing message. The
//! delivery task blocks for the whole run, which keeps the enclosing bus
//! delivery open: fatal errors propagate as [`CommandError`] and roll it
//! back.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use config::Settings;
use serde_json::{json, Value};
use task_frame::{FrameTag, IdeRetrievalAnswer, RouteKey, TaskResponse, ToolAnswer};
use tokio::sync::mpsc;

use crate::bus::MessageBus;
use crate::catalog::AgentCommand;
use crate::handler::{self, HandlerRegistry, Route};
use crate::metrics::Metrics;
use crate::router::MessageService;
use crate::session::{CommandError, CommandSession, SessionState};
use crate::template;
use crate::toolserver::{ToolServerError, ToolServers};
use crate::transport::{SessionTransport, TransportEvent};

/// Everything a session service needs besides the session itself. Shared
/// across services; one `Arc` per runtime.
pub struct SessionDeps {
    pub settings: Settings,
    pub bus: Arc<dyn MessageBus>,
    pub tools: Arc<dyn ToolServers>,
    pub handlers: Arc<HandlerRegistry>,
    pub metrics: Arc<Metrics>,
}

/// Per-delivery session service; a fresh instance handles each message.
pub struct AgentSessionService {
    deps: Arc<SessionDeps>,
    session: Option<CommandSession>,
    state: SessionState,
}

impl AgentSessionService {
    pub fn new(deps: Arc<SessionDeps>) -> Self {
        Self {
            deps,
            session: None,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn run(&mut self, session: &mut CommandSession) -> Result<(), CommandError> {
        let command = session
            .agent_command
            .clone()
            .ok_or_else(|| CommandError::MissingCommand {
                session_id: session.session_id.clone(),
                message_type: session.message_type.clone(),
            })?;

        self.state = SessionState::RequestBuild;
        let instructions = template::render(&command.instructions, &session.payload);

        for (name, descriptor) in &command.tool_servers {
            match self.deps.tools.ensure(name, descriptor).await {
                Ok(()) => session.tool_clients.push(name.clone()),
                Err(e) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        server = %name,
                        error = %e,
                        "tool server unavailable for session"
                    );
                }
            }
        }

        self.state = SessionState::Connecting;
        let transport = SessionTransport::new(
            session.session_id.clone(),
            self.deps.settings.transport.clone(),
            Arc::clone(&self.deps.metrics),
        );
        let mut events = transport
            .open()
            .await
            .map_err(|source| CommandError::Transport {
                session_id: session.session_id.clone(),
                source,
            })?;

        self.audit("session_started", session, None).await;
        self.state = SessionState::AwaitReady;

        let mut responses: Vec<TaskResponse> = Vec::new();
        let mut structured = String::new();
        let outcome = self
            .stream(session, &command, &instructions, &transport, &mut events, &mut responses, &mut structured)
            .await;

        match outcome {
            Ok(()) => {
                let result = self
                    .finish(session, &transport, &responses, &structured)
                    .await;
                transport.disconnect(1000, "end of flow").await;
                match result {
                    Ok(route) => {
                        self.state = SessionState::Complete;
                        self.audit("session_completed", session, Some(route.type_name()))
                            .await;
                        Ok(())
                    }
                    Err(e) => {
                        self.state = SessionState::Failed;
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.state = SessionState::Failed;
                transport.disconnect(1001, "session failed").await;
                self.audit("session_failed", session, None).await;
                Err(e)
            }
        }
    }

    /// Frame loop: from transport open to ENDNODE.
    #[allow(clippy::too_many_arguments)]
    async fn stream(
        &mut self,
        session: &mut CommandSession,
        command: &AgentCommand,
        instructions: &str,
        transport: &SessionTransport,
        events: &mut mpsc::Receiver<TransportEvent>,
        responses: &mut Vec<TaskResponse>,
        structured: &mut String,
    ) -> Result<(), CommandError> {
        let ready_timeout = self.deps.settings.transport.ready_signal_timeout();
        let opened_at = Instant::now();
        let mut ready_seen = false;
        let mut query_sent = false;
        let mut resume_pending = false;

        loop {
            let event = if ready_seen {
                events.recv().await
            } else {
                match tokio::time::timeout(ready_timeout, events.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        self.deps
                            .metrics
                            .ready_timeouts
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        return Err(CommandError::ReadyTimeout {
                            session_id: session.session_id.clone(),
                            seconds: self.deps.settings.transport.ready_signal_timeout_seconds,
                        });
                    }
                }
            };

            let Some(event) = event else {
                return Err(CommandError::ClosedEarly {
                    session_id: session.session_id.clone(),
                });
            };

            match event {
                TransportEvent::Connected { reconnects } => {
                    if reconnects > 0 {
                        resume_pending = transport.checkpoint().is_some();
                    }
                }
                TransportEvent::Failed(source) => {
                    return Err(CommandError::Transport {
                        session_id: session.session_id.clone(),
                        source,
                    });
                }
                TransportEvent::Closed { .. } => {
                    return Err(CommandError::ClosedEarly {
                        session_id: session.session_id.clone(),
                    });
                }
                TransportEvent::Frame(frame) => {
                    // Structured output accumulates by arrival order; these
                    // frames never dispatch as tool calls.
                    if frame.is_structured_output() {
                        if let Some(chunk) = frame.structured_chunk() {
                            structured.push_str(&chunk);
                        }
                        responses.push(frame);
                        continue;
                    }

                    match frame.tag() {
                        FrameTag::Ready => {
                            if let Some(cp) = frame.checkpoint_id() {
                                transport.set_checkpoint(cp);
                                session.check_point_id = Some(cp.to_string());
                            }
                            if !ready_seen {
                                ready_seen = true;
                                tracing::debug!(
                                    session_id = %session.session_id,
                                    elapsed_ms = opened_at.elapsed().as_millis() as u64,
                                    "READY received"
                                );
                            }
                            if !query_sent {
                                self.state = SessionState::Sending;
                                let body =
                                    build_query(session, command, instructions, transport);
                                self.send(session, transport, RouteKey::UserQuery, &body)
                                    .await?;
                                query_sent = true;
                                self.state = SessionState::Streaming;
                            } else if resume_pending {
                                let body = json!({
                                    "sessionId": session.session_id,
                                    "requestId": transport.request_id(),
                                    "checkpointId": transport.checkpoint(),
                                });
                                self.send(session, transport, RouteKey::Resume, &body).await?;
                                resume_pending = false;
                            }
                        }
                        FrameTag::UserResponse => responses.push(frame),
                        FrameTag::Thinking | FrameTag::ReviewerNotes => {
                            tracing::debug!(
                                session_id = %session.session_id,
                                tag = ?frame.tag(),
                                "informational frame"
                            );
                        }
                        FrameTag::EndNode => {
                            // Close codes after this point are normal whatever
                            // their wire value.
                            transport.mark_expected_close();
                            return Ok(());
                        }
                        FrameTag::ToolCall(tool) => {
                            let answer = self.invoke_tool(session, &frame, &tool).await;
                            let server = frame
                                .data
                                .as_ref()
                                .and_then(|d| d.server_name.as_deref())
                                .unwrap_or_default();
                            let body = IdeRetrievalAnswer {
                                identifier: frame
                                    .data
                                    .as_ref()
                                    .and_then(|d| d.identifier.clone()),
                                answer,
                                tools: self.deps.tools.cached_tools(server),
                            };
                            let body = serde_json::to_value(&body).unwrap_or(Value::Null);
                            self.send(session, transport, RouteKey::IdeRetrievalAnswer, &body)
                                .await?;
                            // The ready gate re-arms: the next READY gates the
                            // next tool step.
                        }
                        FrameTag::Empty => {
                            tracing::debug!(
                                session_id = %session.session_id,
                                "frame without tool tag skipped"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn send(
        &self,
        session: &CommandSession,
        transport: &SessionTransport,
        route: RouteKey,
        body: &Value,
    ) -> Result<(), CommandError> {
        transport
            .send(route, body)
            .await
            .map_err(|source| CommandError::Transport {
                session_id: session.session_id.clone(),
                source,
            })
    }

    /// Services one tool invocation; failures become in-band answers and the
    /// transport always stays open.
    async fn invoke_tool(
        &self,
        session: &CommandSession,
        frame: &TaskResponse,
        tool: &str,
    ) -> ToolAnswer {
        use std::sync::atomic::Ordering;

        self.deps.metrics.tool_invocations.fetch_add(1, Ordering::Relaxed);
        let data = frame.data.as_ref();
        let server = data
            .and_then(|d| d.server_name.as_deref())
            .unwrap_or_default()
            .to_string();
        let args = data
            .and_then(|d| d.tool_args.clone())
            .unwrap_or_else(|| json!({}));

        let started = Instant::now();
        match self.deps.tools.call(&server, tool, args).await {
            Ok(outcome) => {
                self.deps
                    .metrics
                    .record_tool_time(tool, started.elapsed());
                if outcome.is_error {
                    self.deps.metrics.tool_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        session_id = %session.session_id,
                        server = %server,
                        tool,
                        "tool reported failure"
                    );
                    ToolAnswer::failure()
                } else {
                    self.deps.metrics.tool_successes.fetch_add(1, Ordering::Relaxed);
                    ToolAnswer::success(outcome.texts())
                }
            }
            Err(ToolServerError::Timeout { tool, seconds }) => {
                self.deps.metrics.tool_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session_id = %session.session_id,
                    server = %server,
                    tool = %tool,
                    seconds,
                    "tool call timed out"
                );
                ToolAnswer::failure_with_text(format!(
                    "The tool '{tool}' did not respond within the configured \
                     timeout of {seconds} seconds. It may still be running; \
                     please retry or continue without it."
                ))
            }
            Err(e) => {
                self.deps.metrics.tool_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session_id = %session.session_id,
                    server = %server,
                    tool,
                    error = %e,
                    "tool call failed"
                );
                ToolAnswer::failure()
            }
        }
    }

    /// ENDNODE handling: parse structured output, consult the handler,
    /// publish exactly one routing message.
    async fn finish(
        &self,
        session: &CommandSession,
        transport: &SessionTransport,
        responses: &[TaskResponse],
        structured: &str,
    ) -> Result<Route, CommandError> {
        let output = parse_structured_output(structured);
        if output.is_none() && !structured.is_empty() {
            tracing::warn!(
                session_id = %session.session_id,
                "structured output did not parse as a JSON object"
            );
        }

        let handler = self.deps.handlers.resolve(&session.message_type);
        let decided = match handler.handle(session, responses, output.as_ref()).await {
            Ok(route) => route,
            Err(e) => {
                tracing::error!(
                    session_id = %session.session_id,
                    error = %e,
                    "handler failed, routing to incomplete"
                );
                Route::Incomplete
            }
        };
        let route = sanitize_route(decided, output.as_ref());

        let request_id = transport.request_id();
        let checkpoint = transport.checkpoint();
        let map = handler::build_routing_map(
            session,
            &request_id,
            checkpoint.as_deref(),
            responses,
            output.as_ref(),
            &route,
        );
        handler::publish_routing(self.deps.bus.as_ref(), &self.deps.settings.handler, map)
            .await
            .map_err(|source| CommandError::Publish {
                session_id: session.session_id.clone(),
                source,
            })?;
        Ok(route)
    }

    /// Fire-and-forget audit record; never blocks or fails the session.
    async fn audit(&self, event: &str, session: &CommandSession, route: Option<&str>) {
        let topic = self.deps.settings.messaging.topics.audit.clone();
        let mut record = json!({
            "event": event,
            "sessionId": session.session_id,
            "eventKey": session.event_key,
            "messageType": session.message_type,
        });
        if let (Some(obj), Some(route)) = (record.as_object_mut(), route) {
            obj.insert("route".into(), Value::String(route.to_string()));
        }
        if let Err(e) = self.deps.bus.publish(&topic, record).await {
            tracing::debug!(error = %e, "audit publish skipped");
        }
    }
}

/// Structured output must parse as a JSON object to count.
fn parse_structured_output(structured: &str) -> Option<Value> {
    if structured.is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(structured)
        .ok()
        .filter(Value::is_object)
}

/// The runtime's routing policy: parse failure forces the incomplete route;
/// chaining requires the agent to have reported success.
fn sanitize_route(decided: Route, output: Option<&Value>) -> Route {
    match (&decided, output) {
        (_, None) => Route::Incomplete,
        (Route::Next(_), Some(_)) if !handler::success_flag(output) => {
            tracing::warn!("handler chained without success=true, ending chain");
            Route::End
        }
        _ => decided,
    }
}

/// Body of the single user-query frame sent after the first READY.
fn build_query(
    session: &CommandSession,
    command: &AgentCommand,
    instructions: &str,
    transport: &SessionTransport,
) -> Value {
    json!({
        "sessionId": session.session_id,
        "requestId": transport.request_id(),
        "eventKey": session.event_key,
        "command": command.name,
        "systemPrompt": command.system_prompt,
        "instructions": instructions,
        "model": command.model,
        "tools": command.tools,
        "executionStrategy": command.execution_strategy,
        "outputSchema": command.output_schema,
    })
}

#[async_trait]
impl MessageService for AgentSessionService {
    fn init(&mut self, session: CommandSession) {
        self.session = Some(session);
    }

    async fn process(&mut self) -> Result<(), CommandError> {
        let mut session = self.session.take().ok_or(CommandError::NotInitialized)?;
        tracing::info!(
            session_id = %session.session_id,
            message_type = %session.message_type,
            event_key = %session.event_key,
            "processing command session"
        );
        let result = self.run(&mut session).await;
        if let Err(e) = &result {
            tracing::error!(
                session_id = %session.session_id,
                error = %e,
                "command session failed"
            );
        }
        self.session = Some(session);
        result
    }
}

//! Shared helpers for the session integration tests: a scripted WebSocket
//! agent server, scripted tool servers, and a wired-up runtime harness.
//! Received wire lines are logged with `[test] ...`; run with `--nocapture`
//! to see them.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use config::Settings;
use weft::toolserver::ToolCallOutcome;
use weft::{
    AgentConfig, HandlerRegistry, LocalBus, MessageBus, Metrics, Router, SessionDeps,
    ToolServerDescriptor, ToolServerError, ToolServers,
};

pub type Ws = WebSocketStream<TcpStream>;
pub type ConnFn = Box<dyn FnOnce(Ws) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Boxes one per-connection script.
pub fn conn<F, Fut>(f: F) -> ConnFn
where
    F: FnOnce(Ws) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |ws| Box::pin(f(ws)))
}

pub struct AgentServer {
    pub url: String,
    /// Connect URIs in accept order (session_id / request_id / checkpoint_id).
    pub uris: Arc<StdMutex<Vec<String>>>,
    pub handle: JoinHandle<()>,
}

impl AgentServer {
    pub fn uri(&self, index: usize) -> String {
        self.uris.lock().unwrap()[index].clone()
    }

    pub fn connections(&self) -> usize {
        self.uris.lock().unwrap().len()
    }
}

/// Binds a port-0 listener and serves the given per-connection scripts in
/// accept order.
pub async fn spawn_agent(scripts: Vec<ConnFn>) -> AgentServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let uris: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    let accept_uris = Arc::clone(&uris);

    let handle = tokio::spawn(async move {
        for script in scripts {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let uris = Arc::clone(&accept_uris);
            let record =
                move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    uris.lock().unwrap().push(req.uri().to_string());
                    Ok(resp)
                };
            match accept_hdr_async(stream, record).await {
                Ok(ws) => script(ws).await,
                Err(_) => continue,
            }
        }
    });

    AgentServer {
        url: format!("ws://{addr}/session"),
        uris,
        handle,
    }
}

pub async fn send_frame(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

pub fn ready_frame(checkpoint: Option<&str>) -> Value {
    json!({"type": "status", "data": {"tool": "READY", "checkpointId": checkpoint}})
}

pub fn structured_frame(args: Value) -> Value {
    json!({"type": "structured_output", "data": {"tool": "OUTPUT", "toolArgs": args}})
}

pub fn user_response_frame(text: &str) -> Value {
    json!({"type": "userresponse", "data": {"tool": "USERRESPONSE", "toolArgs": text}})
}

pub fn endnode_frame() -> Value {
    json!({"type": "status", "data": {"tool": "ENDNODE"}})
}

pub fn tool_call_frame(server: &str, tool: &str, args: Value, identifier: &str) -> Value {
    json!({
        "type": "tool_use",
        "data": {"tool": tool, "serverName": server, "identifier": identifier, "toolArgs": args}
    })
}

/// Next route-keyed application line from the client, skipping control
/// frames. `None` when the connection ends.
pub async fn recv_route(ws: &mut Ws) -> Option<(String, Value)> {
    while let Some(msg) = ws.next().await {
        let msg = msg.ok()?;
        match msg {
            Message::Text(text) => {
                eprintln!("[test] received: {}", text.trim_end());
                let (key, body) = text.trim_end().split_once(' ')?;
                let value = serde_json::from_str(body).ok()?;
                return Some((key.to_string(), value));
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

/// How a scripted tool responds.
pub enum ToolScript {
    Ok(Vec<&'static str>),
    Fail,
    Timeout { seconds: u64 },
}

/// Scripted [`ToolServers`] implementation keyed by tool name.
pub struct ScriptedTools {
    scripts: StdMutex<HashMap<String, ToolScript>>,
    pub calls: StdMutex<Vec<(String, String, Value)>>,
}

impl ScriptedTools {
    pub fn new(scripts: Vec<(&str, ToolScript)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(
                scripts
                    .into_iter()
                    .map(|(name, s)| (name.to_string(), s))
                    .collect(),
            ),
            calls: StdMutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ToolServers for ScriptedTools {
    async fn ensure(
        &self,
        _name: &str,
        _descriptor: &ToolServerDescriptor,
    ) -> Result<(), ToolServerError> {
        Ok(())
    }

    async fn call(
        &self,
        server: &str,
        tool: &str,
        args: Value,
    ) -> Result<ToolCallOutcome, ToolServerError> {
        self.calls
            .lock()
            .unwrap()
            .push((server.to_string(), tool.to_string(), args));
        let scripts = self.scripts.lock().unwrap();
        match scripts.get(tool) {
            Some(ToolScript::Ok(texts)) => Ok(ToolCallOutcome {
                content: texts
                    .iter()
                    .map(|t| json!({"type": "text", "text": t}))
                    .collect(),
                is_error: false,
            }),
            Some(ToolScript::Fail) => Ok(ToolCallOutcome {
                content: vec![],
                is_error: true,
            }),
            Some(ToolScript::Timeout { seconds }) => Err(ToolServerError::Timeout {
                tool: tool.to_string(),
                seconds: *seconds,
            }),
            None => Err(ToolServerError::Unavailable {
                name: server.to_string(),
            }),
        }
    }

    fn cached_tools(&self, _server: &str) -> Vec<task_frame::ToolDescriptor> {
        vec![task_frame::ToolDescriptor {
            name: "read".into(),
            description: Some("Read a file".into()),
            input_schema: json!({"type": "object"}),
        }]
    }
}

/// Catalog used by the session scenarios.
pub const TEST_CATALOG: &str = r#"
version: "1"
systemPrompt: "You are a build agent."
commands:
  cmdA:
    instructions: "fix {/issue}"
    outputSchema:
      type: object
      properties:
        success: { type: boolean }
        summary: { type: string }
  cmdB:
    instructions: "verify {/issue}"
    outputSchema:
      type: object
      properties:
        success: { type: boolean }
"#;

/// Fast-knob settings pointed at the scripted agent server.
pub fn test_settings(agent_url: &str) -> Settings {
    let mut settings = Settings::default();
    settings.transport.agent_url = agent_url.to_string();
    settings.transport.agent_token = Some("test-token".into());
    settings.transport.ready_signal_timeout_seconds = 5;
    settings.transport.initial_reconnect_delay_ms = 100;
    settings.transport.max_reconnect_delay_ms = 400;
    settings.messaging.poll_timeout_seconds = 1;
    settings.messaging.retry_delay_ms = 50;
    settings.messaging.max_retry_delay_ms = 200;
    settings
}

/// A wired runtime: local bus, router on `event`, response collector.
pub struct Harness {
    pub bus: Arc<LocalBus>,
    pub deps: Arc<SessionDeps>,
    pub router: Arc<Router>,
    pub responses: mpsc::Receiver<Value>,
}

pub async fn harness(
    settings: Settings,
    tools: Arc<dyn ToolServers>,
    handlers: HandlerRegistry,
) -> Harness {
    let bus = Arc::new(LocalBus::new(settings.messaging.clone()));
    let deps = Arc::new(SessionDeps {
        settings: settings.clone(),
        bus: Arc::clone(&bus) as Arc<dyn MessageBus>,
        tools,
        handlers: Arc::new(handlers),
        metrics: Arc::new(Metrics::new()),
    });
    let catalog = Arc::new(AgentConfig::parse(TEST_CATALOG).unwrap());
    let router = Arc::new(Router::with_defaults(catalog, Arc::clone(&deps)));

    let event_topic = settings.messaging.topics.event.clone();
    let route_to = Arc::clone(&router);
    bus.subscribe(
        &event_topic,
        weft::bus::handler(move |envelope| {
            let router = Arc::clone(&route_to);
            async move { router.route(envelope).await }
        }),
    )
    .await
    .unwrap();

    let (tx, rx) = mpsc::channel(16);
    let response_topic = settings.messaging.topics.response.clone();
    bus.subscribe(
        &response_topic,
        weft::bus::handler(move |envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(envelope).await;
                Ok(())
            }
        }),
    )
    .await
    .unwrap();

    Harness {
        bus,
        deps,
        router,
        responses: rx,
    }
}

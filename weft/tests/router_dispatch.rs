//! Router dispatch: envelopes route to exactly the service named by their
//! `type`, sentinels and unroutable payloads go to the sinks, and service
//! failures propagate for redelivery.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use weft::{
    AgentConfig, CommandError, CommandSession, MessageService, Router, TerminalSink,
};

const CATALOG: &str = r#"
commands:
  cmdA:
    instructions: "do {/x}"
    outputSchema: { type: object }
  cmdB:
    instructions: "other"
    outputSchema: { type: object }
"#;

struct RecordingSink {
    label: &'static str,
    tx: mpsc::Sender<(String, String)>,
}

#[async_trait]
impl TerminalSink for RecordingSink {
    async fn accept(&self, envelope: &Value, reason: &str) {
        let kind = envelope
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("<none>")
            .to_string();
        let _ = self
            .tx
            .send((format!("{}:{kind}", self.label), reason.to_string()))
            .await;
    }
}

struct RecordingService {
    tx: mpsc::Sender<CommandSession>,
    fail: bool,
    session: Option<CommandSession>,
}

#[async_trait]
impl MessageService for RecordingService {
    fn init(&mut self, session: CommandSession) {
        self.session = Some(session);
    }

    async fn process(&mut self) -> Result<(), CommandError> {
        let session = self.session.take().expect("initialized");
        let session_id = session.session_id.clone();
        let _ = self.tx.send(session).await;
        if self.fail {
            return Err(CommandError::ClosedEarly { session_id });
        }
        Ok(())
    }
}

struct Fixture {
    router: Router,
    sessions: mpsc::Receiver<CommandSession>,
    sinks: mpsc::Receiver<(String, String)>,
}

fn fixture(fail: bool) -> Fixture {
    let catalog = Arc::new(AgentConfig::parse(CATALOG).unwrap());
    let (sink_tx, sinks) = mpsc::channel(16);
    let router = Router::new(
        catalog,
        config::TopicNames::default(),
        Arc::new(RecordingSink {
            label: "end",
            tx: sink_tx.clone(),
        }),
        Arc::new(RecordingSink {
            label: "incomplete",
            tx: sink_tx,
        }),
    );
    let (tx, sessions) = mpsc::channel(16);
    for name in ["cmdA", "cmdB", "ghost"] {
        let tx = tx.clone();
        router.register_service(
            name,
            Arc::new(move || {
                Box::new(RecordingService {
                    tx: tx.clone(),
                    fail,
                    session: None,
                }) as Box<dyn MessageService>
            }),
        );
    }
    Fixture {
        router,
        sessions,
        sinks,
    }
}

/// **Scenario**: dispatch for `{type: X}` calls exactly the service named X
/// with the command resolved and the event key propagated.
#[tokio::test]
async fn dispatch_by_type_field() {
    let mut f = fixture(false);
    f.router
        .route(json!({"type": "cmdA", "EventKey": "e1", "x": 1}))
        .await
        .unwrap();

    let session = f.sessions.recv().await.unwrap();
    assert_eq!(session.message_type, "cmdA");
    assert_eq!(session.event_key, "e1");
    assert_eq!(session.agent_command.as_ref().unwrap().name, "cmdA");
    assert!(!session.session_id.is_empty());

    // Nothing else was dispatched or sunk.
    assert!(f.sessions.try_recv().is_err());
    assert!(f.sinks.try_recv().is_err());
}

/// **Scenario**: a chained envelope keeps its session id.
#[tokio::test]
async fn chained_envelope_preserves_session_id() {
    let mut f = fixture(false);
    f.router
        .route(json!({"type": "cmdB", "sessionId": "s-keep", "eventKey": "e2"}))
        .await
        .unwrap();
    let session = f.sessions.recv().await.unwrap();
    assert_eq!(session.session_id, "s-keep");
    assert_eq!(session.message_type, "cmdB");
}

/// **Scenario**: sentinels route to their sinks and are acked.
#[tokio::test]
async fn sentinels_route_to_sinks() {
    let mut f = fixture(false);
    f.router.route(json!({"type": "end_node"})).await.unwrap();
    f.router.route(json!({"type": "incomplete"})).await.unwrap();

    let (label, _) = f.sinks.recv().await.unwrap();
    assert_eq!(label, "end:end_node");
    let (label, _) = f.sinks.recv().await.unwrap();
    assert_eq!(label, "incomplete:incomplete");
}

/// **Scenario**: missing type, unknown type, and a service without a catalog
/// command all land in the incomplete sink.
#[tokio::test]
async fn unroutable_envelopes_go_incomplete() {
    let mut f = fixture(false);

    f.router.route(json!({"payload": 1})).await.unwrap();
    let (label, reason) = f.sinks.recv().await.unwrap();
    assert_eq!(label, "incomplete:<none>");
    assert!(reason.contains("type"));

    f.router.route(json!({"type": "zzz"})).await.unwrap();
    let (label, reason) = f.sinks.recv().await.unwrap();
    assert_eq!(label, "incomplete:zzz");
    assert!(reason.contains("no service"));

    // Registered service but no catalog command behind it.
    f.router.route(json!({"type": "ghost"})).await.unwrap();
    let (label, reason) = f.sinks.recv().await.unwrap();
    assert_eq!(label, "incomplete:ghost");
    assert!(reason.contains("no agent command"));

    assert!(f.sessions.try_recv().is_err());
}

/// **Scenario**: a failing service propagates so the bus redelivers.
#[tokio::test]
async fn service_failure_propagates() {
    let mut f = fixture(true);
    let err = f
        .router
        .route(json!({"type": "cmdA", "eventKey": "e3"}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("closed before end of flow"));
    assert!(f.sessions.recv().await.is_some());
}

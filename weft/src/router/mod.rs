//! Router: turns delivered envelopes into command sessions.
//!
//! Dispatch is a name-keyed lookup registered at startup: each command maps
//! to a service factory producing a fresh [`MessageService`] per delivery
//! (no mutable state is shared across sessions). The sentinel types
//! `end_node` and `incomplete` route to terminal sinks, as do envelopes with
//! no `type` or no matching command.

mod sinks;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use task_frame::{message_type, END_NODE_TYPE, INCOMPLETE_TYPE};

use crate::bus::{handler, BusError, DeliveryError, MessageBus};
use crate::catalog::AgentConfig;
use crate::session::runtime::{AgentSessionService, SessionDeps};
use crate::session::{CommandError, CommandSession};

pub use sinks::{EndNodeSink, IncompleteSink, TerminalSink};

/// One command invocation's service: `init` receives the session, `process`
/// may block for the lifetime of the agent session.
#[async_trait]
pub trait MessageService: Send {
    fn init(&mut self, session: CommandSession);
    async fn process(&mut self) -> Result<(), CommandError>;
}

/// Produces a fresh service per delivery.
pub type ServiceFactory = Arc<dyn Fn() -> Box<dyn MessageService> + Send + Sync>;

/// Name-keyed dispatch of envelopes to command services and terminal sinks.
pub struct Router {
    catalog: Arc<AgentConfig>,
    topics: config::TopicNames,
    services: DashMap<String, ServiceFactory>,
    end_sink: Arc<dyn TerminalSink>,
    incomplete_sink: Arc<dyn TerminalSink>,
}

impl Router {
    pub fn new(
        catalog: Arc<AgentConfig>,
        topics: config::TopicNames,
        end_sink: Arc<dyn TerminalSink>,
        incomplete_sink: Arc<dyn TerminalSink>,
    ) -> Self {
        Self {
            catalog,
            topics,
            services: DashMap::new(),
            end_sink,
            incomplete_sink,
        }
    }

    /// Builds a router whose commands all run the agent-session runtime and
    /// whose sinks publish audit records through the bus.
    pub fn with_defaults(catalog: Arc<AgentConfig>, deps: Arc<SessionDeps>) -> Self {
        let topics = deps.settings.messaging.topics.clone();
        let audit = topics.audit.clone();
        let router = Self::new(
            Arc::clone(&catalog),
            topics,
            Arc::new(EndNodeSink::new(Arc::clone(&deps.bus), audit.clone())),
            Arc::new(IncompleteSink::new(Arc::clone(&deps.bus), audit)),
        );
        for name in catalog.command_names() {
            let deps = Arc::clone(&deps);
            router.register_service(
                name,
                Arc::new(move || {
                    Box::new(AgentSessionService::new(Arc::clone(&deps)))
                        as Box<dyn MessageService>
                }),
            );
        }
        router
    }

    /// Registers (or replaces) the service factory for a command name.
    pub fn register_service(&self, command: impl Into<String>, factory: ServiceFactory) {
        self.services.insert(command.into(), factory);
    }

    /// Routes one delivered envelope. Unroutable envelopes go to the
    /// incomplete sink and are acked; command failures propagate so the bus
    /// redelivers.
    pub async fn route(&self, envelope: Value) -> Result<(), DeliveryError> {
        let Some(kind) = message_type(&envelope).map(str::to_string) else {
            self.incomplete_sink
                .accept(&envelope, "missing or null type field")
                .await;
            return Ok(());
        };

        if kind == END_NODE_TYPE {
            self.end_sink.accept(&envelope, "end of chain").await;
            return Ok(());
        }
        if kind == INCOMPLETE_TYPE {
            self.incomplete_sink
                .accept(&envelope, "incomplete route")
                .await;
            return Ok(());
        }

        let Some(factory) = self.services.get(&kind).map(|f| Arc::clone(f.value())) else {
            self.incomplete_sink
                .accept(&envelope, "no service registered for type")
                .await;
            return Ok(());
        };
        let Some(command) = self.catalog.get(&kind) else {
            self.incomplete_sink
                .accept(&envelope, "no agent command for type")
                .await;
            return Ok(());
        };

        let mut session = CommandSession::from_envelope(&kind, envelope);
        session.agent_command = Some(command);

        let mut service = factory();
        service.init(session);
        service
            .process()
            .await
            .map_err(|e| DeliveryError::new(e.to_string()))
    }

    /// Subscribes this router on the `event` and `response` topics: one
    /// logical router consumes both, dispatching by `type`.
    pub async fn attach(self: &Arc<Self>, bus: &dyn MessageBus) -> Result<(), BusError> {
        for topic in [self.topics.event.clone(), self.topics.response.clone()] {
            let router = Arc::clone(self);
            bus.subscribe(
                &topic,
                handler(move |envelope| {
                    let router = Arc::clone(&router);
                    async move { router.route(envelope).await }
                }),
            )
            .await?;
        }
        Ok(())
    }
}

//! # Weft
//!
//! An event-driven agent orchestration runtime. External events become typed
//! *command sessions* that flow through a pluggable message bus, drive one
//! remote AI agent per command over a resilient bidirectional session, and
//! dispatch results to per-command handlers that either terminate or chain
//! into the next command.
//!
//! ## Main modules
//!
//! - [`bus`]: [`MessageBus`] with two backends: [`LocalBus`] (bounded
//!   queues, worker pool, retry + DLQ) and [`BrokerBus`] (AMQP, ack/nack).
//! - [`router`]: [`Router`] dispatches envelopes by their `type` field to
//!   per-command [`MessageService`] factories or terminal sinks.
//! - [`session`]: [`CommandSession`] and the agent-session runtime
//!   ([`AgentSessionService`]) driving one command end to end.
//! - [`transport`]: [`SessionTransport`]: reconnecting WebSocket session
//!   with ping/pong liveness, checkpoint resume and a circuit breaker.
//! - [`toolserver`]: [`ToolServerRegistry`] spawning and pooling stdio
//!   tool servers; [`ToolServers`] is the seam the runtime calls through.
//! - [`catalog`]: [`AgentConfig`], the YAML command catalog with validated
//!   draft 2020-12 output schemas.
//! - [`template`]: placeholder substitution over event payloads.
//! - [`handler`]: the per-command [`Handler`] contract and routing-map
//!   publication.
//! - [`metrics`]: process-level counters and bounded per-tool timers.
//!
//! Control flow: ingress publishes on `event` → the bus delivers → the
//! router materializes a session → the runtime opens the transport, waits
//! for READY, streams frames and services tool calls → the handler publishes
//! the routing message on `response` → the router picks it up for the next
//! command or a terminal sink.

pub mod bus;
pub mod catalog;
pub mod handler;
pub mod metrics;
pub mod router;
pub mod session;
pub mod template;
pub mod toolserver;
pub mod transport;

pub use bus::{BrokerBus, BusError, DeliveryError, LocalBus, MessageBus};
pub use catalog::{AgentCommand, AgentConfig, CatalogError, ToolServerDescriptor};
pub use handler::{ChainHandler, EndHandler, Handler, HandlerRegistry, Route};
pub use metrics::{Metrics, MetricsSnapshot};
pub use router::{MessageService, Router, ServiceFactory, TerminalSink};
pub use session::runtime::{AgentSessionService, SessionDeps};
pub use session::{CommandError, CommandSession, SessionState};
pub use toolserver::{ToolServerError, ToolServerRegistry, ToolServers};
pub use transport::{
    CircuitBreaker, SessionTransport, TransportError, TransportEvent, TransportStatus,
};

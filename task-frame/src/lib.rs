//! Task frame protocol: response frames, route keys and bus envelopes.
//!
//! This crate defines the wire shape of one agent session: inbound
//! [`TaskResponse`] frames, outbound route-keyed frames, and the bus-level
//! message envelope with its sentinel types. It does not depend on weft;
//! weft's transport and session runtime encode/decode through these types.

pub mod envelope;
pub mod frame;

pub use envelope::{message_type, parse_envelope, RouteKey, END_NODE_TYPE, INCOMPLETE_TYPE};
pub use frame::{FrameTag, IdeRetrievalAnswer, TaskResponse, ToolAnswer, ToolData, ToolDescriptor};

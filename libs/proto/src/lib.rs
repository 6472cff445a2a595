//! # drover-proto
//!
//! Data model for the resource manager's scheduler protocol.
//!
//! The scheduler talks to the resource manager with two kinds of messages:
//!
//! - **Calls** ([`Call`]): requests sent by the framework (subscribe, accept,
//!   decline, kill, acknowledge, reconcile)
//! - **Events** ([`Event`]): the stream pushed back on the subscription
//!   connection (subscribed, offers, rescind, update, heartbeat, ...)
//!
//! Both use the JSON encoding of the v1 scheduler API, where the message kind
//! is carried in a `type` field and the payload sits under a key named after
//! the kind:
//!
//! ```json
//! {"type": "RESCIND", "rescind": {"offer_id": {"value": "O1"}}}
//! ```
//!
//! Framing of the event stream is a transport concern and lives with the
//! transport implementation, not here.

mod call;
mod error;
mod event;
mod framework;
mod resources;
mod task;

pub use call::*;
pub use error::ProtoError;
pub use event::*;
pub use framework::*;
pub use resources::*;
pub use task::*;

pub use drover_id::{AgentId, ExecutorId, FrameworkId, OfferId, TaskId};

//! # drover-id
//!
//! Typed identifiers for the drover scheduler.
//!
//! ## Design Principles
//!
//! - Identifiers assigned by the resource manager (agents, offers, frameworks)
//!   are opaque strings; we never interpret their contents
//! - Identifiers we mint ourselves (tasks) use a prefixed ULID so they sort by
//!   creation time
//! - Every identifier is its own type, so an `OfferId` can never be passed
//!   where an `AgentId` is expected
//!
//! ## Wire Format
//!
//! The resource manager's JSON protocol wraps every identifier in an object:
//!
//! ```json
//! { "value": "20170412-034853-1-0001-O42" }
//! ```
//!
//! All types in this crate serialize to and from that shape.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

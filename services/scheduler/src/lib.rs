//! drover Scheduler Library
//!
//! A framework scheduler for a Mesos-style cluster resource manager, with
//! leader election across redundant replicas.
//!
//! ## Architecture
//!
//! ```text
//! Manager
//! ├── Coordinator        (leader election, role changes)
//! ├── LeaderRouter       (where API writes go)
//! └── Scheduler          (subscription, dispatch, placement, launch)
//!     ├── Transport      (calls out, event stream in)
//!     ├── Registry       (agents and their live offers)
//!     ├── FilterChain + Strategy
//!     ├── EventBus       (wait for a matching event)
//!     └── Store          (task records, framework id, election state)
//! ```
//!
//! Only the leader holds a subscription. Leadership changes drive
//! `Scheduler::subscribe` and `Scheduler::unsubscribe`.
//!
//! ## Modules
//!
//! - `scheduler`: the engine
//! - `leader`: election over a ZooKeeper-style coordination service
//! - `transport`: HTTP/RecordIO client and an in-process mock
//! - `store`: SQLite and in-memory persistence

pub mod api;
pub mod backoff;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod leader;
pub mod manager;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod task;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, SchedulerConfig};
pub use error::SchedulerError;
pub use leader::{Coordination, Leadership, MemoryCoordination};
pub use manager::Manager;
pub use scheduler::{PlacementPolicy, Scheduler};
pub use task::{ResourceRequest, TaskSpec};
pub use transport::{HttpTransport, MockTransport, Transport};

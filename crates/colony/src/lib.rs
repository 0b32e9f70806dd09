//! # Colony - a supervised process runtime
//!
//! Colony runs stateful, addressable processes on top of tokio: each
//! process owns a mailbox drained serially, holds its state as a value that
//! its inbox handler folds over, and sits in a supervision tree rooted at
//! `/root`.
//!
//! # Overview
//!
//! - **Processes**: spawned under a hierarchical [`ProcessId`], one tokio
//!   task per process, strictly serial message dispatch
//! - **Messaging**: fire-and-forget `tell`, request/response `ask` with a
//!   timeout, delayed `tell_after` with cancellation
//! - **Supervision**: "let it crash, notify, terminate": a failing handler
//!   kills the process and its subtree and notifies watchers; there is no
//!   automatic restart
//! - **Routers**: Broadcast / RoundRobin / LeastBusy / Random forwarding
//!   over a worker pool, addressable like any other process
//! - **Cluster**: a pluggable [`Cluster`] backend adds state persistence,
//!   an at-least-once durable inbox, and cross-node pub/sub
//! - **Sessions**: TTL-bounded key/value scopes with sliding expiry,
//!   replicated through the cluster kv store
//!
//! # Quick Start
//!
//! ```ignore
//! use colony::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ProcessError> {
//!     let system = ProcessSystem::default();
//!
//!     let counter = system.spawn(
//!         "counter",
//!         ProcessFlags::NONE,
//!         0u64,
//!         |count: u64, delta: u64, turn: &mut Turn| {
//!             let next = count + delta;
//!             turn.reply(&next)?;
//!             Ok(next)
//!         },
//!     )?;
//!
//!     system.tell(&counter, &3u64)?;
//!     let total: u64 = system
//!         .ask(&counter, &4u64, Duration::from_secs(1))
//!         .await?;
//!     assert_eq!(total, 7);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod context;
mod mailbox;
mod process;
mod registry;
mod session;

pub mod cluster;
pub mod error;
pub mod flags;
pub mod pid;
pub mod router;
pub mod scheduler;
pub mod system;

pub use cluster::{Cluster, ClusterConfig, MemoryCluster, RemoteMessage};
pub use context::{current_pid, session_scope};
pub use error::{ClusterError, ProcessError};
pub use flags::ProcessFlags;
pub use pid::ProcessId;
pub use process::{HandlerError, Turn};
pub use router::{RouterOptions, RouterPolicy};
pub use scheduler::{TimerError, TimerRef};
pub use system::{ProcessInfo, ProcessSystem, SubRef, SystemConfig};

/// Convenience re-exports for typical use.
///
/// ```ignore
/// use colony::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cluster::{Cluster, ClusterConfig, MemoryCluster};
    pub use crate::error::{ClusterError, ProcessError};
    pub use crate::flags::ProcessFlags;
    pub use crate::pid::ProcessId;
    pub use crate::process::{HandlerError, Turn};
    pub use crate::router::{RouterOptions, RouterPolicy};
    pub use crate::system::{ProcessInfo, ProcessSystem, SystemConfig};
}

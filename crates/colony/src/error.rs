//! Error types for runtime operations.
//!
//! The taxonomy follows the failure-containment rules of the runtime:
//! configuration errors reject synchronously at the faulting call,
//! connectivity errors surface once at connect/spawn time, processing errors
//! are converted into Terminated events, and `ask` timeouts are a distinct
//! outcome that is never retried automatically.

use crate::pid::ProcessId;
use thiserror::Error;

/// Errors produced by process operations.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// A process name contained the path separator or was empty.
    #[error("invalid process name: {name:?}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// A sibling with the same name already exists under the same parent.
    #[error("name conflict: {0} already exists")]
    NameConflict(ProcessId),

    /// The target process is unknown or already terminated.
    #[error("process not found: {0}")]
    ProcessNotFound(ProcessId),

    /// An `ask` exceeded its deadline.
    #[error("ask timed out")]
    TimedOut,

    /// The inbox handler finished without producing a reply for an `ask`.
    #[error("process did not reply")]
    NoReply,

    /// The inbox handler returned an error or panicked; the process is
    /// terminated.
    #[error("inbox handler failed: {0}")]
    HandlerFailed(String),

    /// A message or state value failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// A cluster backend operation failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl From<serde_json::Error> for ProcessError {
    fn from(err: serde_json::Error) -> Self {
        ProcessError::Codec(err.to_string())
    }
}

/// Errors produced by the cluster capability boundary.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The backing store or broker is unreachable.
    #[error("cluster connection failed: {0}")]
    Connection(String),

    /// An operation was attempted before `connect` succeeded.
    #[error("cluster not connected")]
    NotConnected,

    /// The backend reported an operation failure.
    #[error("cluster backend error: {0}")]
    Backend(String),
}

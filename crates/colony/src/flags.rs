//! Per-process behavior flags.
//!
//! Flags are declared at spawn time and resolved once into a concrete
//! durability strategy; the dispatch loop never re-tests flag bits per
//! message. The default (no flags) means purely in-memory, non-durable,
//! local-only.

use serde::{Deserialize, Serialize};

/// Combinable per-process configuration, fixed at spawn time.
///
/// # Examples
///
/// ```
/// use colony::ProcessFlags;
///
/// let flags = ProcessFlags::PERSIST_INBOX.union(ProcessFlags::PERSISTENT_STATE);
/// assert!(flags.persist_inbox);
/// assert!(flags.persist_state);
/// assert!(!flags.remote_publish);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessFlags {
    /// Durably queue inbound messages through the cluster backend, with
    /// lease/ack writes around each dispatch (at-least-once redelivery).
    pub persist_inbox: bool,
    /// Save the process state to the cluster backend after each message and
    /// restore it on spawn.
    pub persist_state: bool,
    /// Fan `publish` calls for this process out to remote subscribers.
    pub remote_publish: bool,
    /// Deliver cluster-published messages for this process to local
    /// subscribers in addition to locally published ones.
    pub listen_remote_and_local: bool,
}

impl ProcessFlags {
    /// No flags set: in-memory, non-durable, local-only.
    pub const NONE: ProcessFlags = ProcessFlags {
        persist_inbox: false,
        persist_state: false,
        remote_publish: false,
        listen_remote_and_local: false,
    };

    /// Only `persist_inbox` set.
    pub const PERSIST_INBOX: ProcessFlags = ProcessFlags {
        persist_inbox: true,
        ..Self::NONE
    };

    /// Only `persist_state` set.
    pub const PERSISTENT_STATE: ProcessFlags = ProcessFlags {
        persist_state: true,
        ..Self::NONE
    };

    /// Only `remote_publish` set.
    pub const REMOTE_PUBLISH: ProcessFlags = ProcessFlags {
        remote_publish: true,
        ..Self::NONE
    };

    /// Only `listen_remote_and_local` set.
    pub const LISTEN_REMOTE_AND_LOCAL: ProcessFlags = ProcessFlags {
        listen_remote_and_local: true,
        ..Self::NONE
    };

    /// Combines two flag sets.
    pub const fn union(self, other: ProcessFlags) -> ProcessFlags {
        ProcessFlags {
            persist_inbox: self.persist_inbox | other.persist_inbox,
            persist_state: self.persist_state | other.persist_state,
            remote_publish: self.remote_publish | other.remote_publish,
            listen_remote_and_local: self.listen_remote_and_local | other.listen_remote_and_local,
        }
    }

    /// Returns `true` if any persistence flag is set.
    pub const fn is_persistent(&self) -> bool {
        self.persist_inbox | self.persist_state
    }

    /// Returns `true` if any cluster-dependent flag is set.
    pub const fn needs_cluster(&self) -> bool {
        self.persist_inbox | self.persist_state | self.remote_publish | self.listen_remote_and_local
    }
}

//! Cluster capability boundary.
//!
//! The runtime never implements durability or cross-node messaging inline;
//! it consumes a [`Cluster`] trait object registered on the
//! `ProcessSystem`. Backends provide three contracts, all keyed by
//! [`ProcessId`]:
//!
//! - **State persistence**: save/load an opaque serialized state blob.
//! - **Inbox persistence**: an ordered queue with lease-before-dispatch and
//!   ack-after-processing writes. A crash between lease and ack results in
//!   redelivery on the next activation (at-least-once, never exactly-once).
//! - **Remote pub/sub**: fan published payloads out to every node
//!   subscribed to a process id's channel.
//!
//! Connectivity failures degrade the affected processes to purely
//! in-memory operation and are reported once at `connect`/spawn time; they
//! never crash unrelated processes.

mod memory;

pub use memory::MemoryCluster;

use crate::error::ClusterError;
use crate::pid::ProcessId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Connection settings for a cluster backend. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's name; used as the origin tag on published messages.
    pub node_name: String,
    /// Backend-specific connection string.
    pub connection_string: String,
    /// Logical catalogue/namespace the node's data lives under.
    pub catalogue: String,
    /// Free-form backend metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ClusterConfig {
    /// Creates a config with an empty metadata map.
    pub fn new(
        node_name: impl Into<String>,
        connection_string: impl Into<String>,
        catalogue: impl Into<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            connection_string: connection_string.into(),
            catalogue: catalogue.into(),
            metadata: HashMap::new(),
        }
    }

    /// Adds one metadata entry, builder style.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A message delivered through a cluster channel.
///
/// The origin node name lets a subscriber drop its own locally published
/// messages, which it already delivered directly.
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    /// Name of the node that published the message.
    pub origin: String,
    /// The serialized payload.
    pub data: Vec<u8>,
}

/// The pluggable cluster backend interface.
///
/// Registered process-wide on a `ProcessSystem` before any
/// cluster-dependent spawn. All methods must be safe to call from multiple
/// dispatch loops concurrently.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// The configuration this backend was built with.
    fn config(&self) -> &ClusterConfig;

    /// This node's name.
    fn node_name(&self) -> &str {
        &self.config().node_name
    }

    /// Establishes the connection. Idempotent; fails with
    /// [`ClusterError::Connection`] if the backing store is unreachable.
    async fn connect(&self) -> Result<(), ClusterError>;

    /// Tears the connection down. Idempotent.
    async fn disconnect(&self) -> Result<(), ClusterError>;

    /// Saves an opaque state blob for `pid`, replacing any previous one.
    async fn save_state(&self, pid: &ProcessId, blob: Vec<u8>) -> Result<(), ClusterError>;

    /// Loads the last committed state blob for `pid`.
    async fn load_state(&self, pid: &ProcessId) -> Result<Option<Vec<u8>>, ClusterError>;

    /// Durably records an inbound message at a known sequence slot.
    async fn queue_push(
        &self,
        pid: &ProcessId,
        seq: u64,
        data: Vec<u8>,
    ) -> Result<(), ClusterError>;

    /// Durably records an inbound message for a process that is not
    /// currently activated, assigning the next sequence number.
    async fn queue_append(&self, pid: &ProcessId, data: Vec<u8>) -> Result<u64, ClusterError>;

    /// All un-acked queue entries for `pid`, in sequence order. Leased but
    /// un-acked entries are included, which is what makes redelivery
    /// at-least-once.
    async fn queue_snapshot(&self, pid: &ProcessId)
        -> Result<Vec<(u64, Vec<u8>)>, ClusterError>;

    /// Marks an entry as leased, written before its dispatch begins.
    async fn queue_lease(&self, pid: &ProcessId, seq: u64) -> Result<(), ClusterError>;

    /// Marks an entry as processed, written after its dispatch succeeds.
    async fn queue_ack(&self, pid: &ProcessId, seq: u64) -> Result<(), ClusterError>;

    /// Publishes a payload to every subscriber of `pid`'s channel.
    async fn publish(
        &self,
        pid: &ProcessId,
        origin: &str,
        data: Vec<u8>,
    ) -> Result<(), ClusterError>;

    /// Subscribes to `pid`'s channel. The receiver yields messages
    /// published on any node, including this one.
    fn subscribe(&self, pid: &ProcessId) -> broadcast::Receiver<RemoteMessage>;

    /// Writes a replicated key/value entry (session scopes live here).
    async fn kv_put(&self, key: &str, value: Vec<u8>) -> Result<(), ClusterError>;

    /// Reads a replicated key/value entry.
    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, ClusterError>;

    /// Deletes a replicated key/value entry. No-op if absent.
    async fn kv_delete(&self, key: &str) -> Result<(), ClusterError>;
}

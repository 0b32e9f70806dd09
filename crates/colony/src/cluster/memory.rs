//! In-process cluster backend.
//!
//! `MemoryCluster` implements the full [`Cluster`] contract against
//! process-local maps and broadcast channels. Shared between two
//! `ProcessSystem`s it behaves like a two-node cluster, which makes it the
//! reference backend for crash/restart and remote pub/sub tests. The
//! `set_reachable` switch simulates an unreachable store for
//! connection-failure paths.

use super::{Cluster, ClusterConfig, RemoteMessage};
use crate::error::ClusterError;
use crate::pid::ProcessId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Capacity of each per-channel broadcast buffer.
const CHANNEL_CAPACITY: usize = 256;

struct QueueEntry {
    data: Vec<u8>,
    leased: bool,
}

#[derive(Default)]
struct DurableQueue {
    entries: BTreeMap<u64, QueueEntry>,
    /// Acked sequence numbers, kept so a late `queue_push` for an already
    /// processed slot is not resurrected.
    acked: BTreeSet<u64>,
}

impl DurableQueue {
    fn next_seq(&self) -> u64 {
        let tail = self.entries.keys().next_back().copied().unwrap_or(0);
        tail.max(self.acked.iter().next_back().copied().unwrap_or(0)) + 1
    }
}

/// An in-memory [`Cluster`] backend.
pub struct MemoryCluster {
    config: ClusterConfig,
    connected: AtomicBool,
    reachable: AtomicBool,
    state: DashMap<ProcessId, Vec<u8>>,
    queues: DashMap<ProcessId, Mutex<DurableQueue>>,
    channels: DashMap<ProcessId, broadcast::Sender<RemoteMessage>>,
    kv: DashMap<String, Vec<u8>>,
}

impl MemoryCluster {
    /// Creates a disconnected backend; call `connect` before use.
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            state: DashMap::new(),
            queues: DashMap::new(),
            channels: DashMap::new(),
            kv: DashMap::new(),
        }
    }

    /// Simulates the backing store becoming (un)reachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Returns `true` while connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of live receivers on `pid`'s channel.
    pub fn subscriber_count(&self, pid: &ProcessId) -> usize {
        self.channels
            .get(pid)
            .map(|entry| entry.value().receiver_count())
            .unwrap_or(0)
    }

    fn ensure_connected(&self) -> Result<(), ClusterError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClusterError::NotConnected);
        }
        Ok(())
    }

    fn channel(&self, pid: &ProcessId) -> broadcast::Sender<RemoteMessage> {
        self.channels
            .entry(pid.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    fn config(&self) -> &ClusterConfig {
        &self.config
    }

    async fn connect(&self) -> Result<(), ClusterError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ClusterError::Connection(format!(
                "store unreachable at {}",
                self.config.connection_string
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClusterError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn save_state(&self, pid: &ProcessId, blob: Vec<u8>) -> Result<(), ClusterError> {
        self.ensure_connected()?;
        self.state.insert(pid.clone(), blob);
        Ok(())
    }

    async fn load_state(&self, pid: &ProcessId) -> Result<Option<Vec<u8>>, ClusterError> {
        self.ensure_connected()?;
        Ok(self.state.get(pid).map(|entry| entry.value().clone()))
    }

    async fn queue_push(
        &self,
        pid: &ProcessId,
        seq: u64,
        data: Vec<u8>,
    ) -> Result<(), ClusterError> {
        self.ensure_connected()?;
        let queue = self.queues.entry(pid.clone()).or_default();
        let mut queue = queue.lock();
        if queue.acked.contains(&seq) {
            // The dispatch loop already acked this slot; do not resurrect.
            return Ok(());
        }
        queue.entries.insert(
            seq,
            QueueEntry {
                data,
                leased: false,
            },
        );
        Ok(())
    }

    async fn queue_append(&self, pid: &ProcessId, data: Vec<u8>) -> Result<u64, ClusterError> {
        self.ensure_connected()?;
        let queue = self.queues.entry(pid.clone()).or_default();
        let mut queue = queue.lock();
        let seq = queue.next_seq();
        queue.entries.insert(
            seq,
            QueueEntry {
                data,
                leased: false,
            },
        );
        Ok(seq)
    }

    async fn queue_snapshot(
        &self,
        pid: &ProcessId,
    ) -> Result<Vec<(u64, Vec<u8>)>, ClusterError> {
        self.ensure_connected()?;
        let Some(queue) = self.queues.get(pid) else {
            return Ok(Vec::new());
        };
        let queue = queue.lock();
        Ok(queue
            .entries
            .iter()
            .map(|(seq, entry)| (*seq, entry.data.clone()))
            .collect())
    }

    async fn queue_lease(&self, pid: &ProcessId, seq: u64) -> Result<(), ClusterError> {
        self.ensure_connected()?;
        if let Some(queue) = self.queues.get(pid) {
            if let Some(entry) = queue.lock().entries.get_mut(&seq) {
                entry.leased = true;
            }
        }
        Ok(())
    }

    async fn queue_ack(&self, pid: &ProcessId, seq: u64) -> Result<(), ClusterError> {
        self.ensure_connected()?;
        let queue = self.queues.entry(pid.clone()).or_default();
        let mut queue = queue.lock();
        queue.entries.remove(&seq);
        queue.acked.insert(seq);
        Ok(())
    }

    async fn publish(
        &self,
        pid: &ProcessId,
        origin: &str,
        data: Vec<u8>,
    ) -> Result<(), ClusterError> {
        self.ensure_connected()?;
        // No subscribers is not an error; broadcast returns Err then.
        let _ = self.channel(pid).send(RemoteMessage {
            origin: origin.to_string(),
            data,
        });
        Ok(())
    }

    fn subscribe(&self, pid: &ProcessId) -> broadcast::Receiver<RemoteMessage> {
        self.channel(pid).subscribe()
    }

    async fn kv_put(&self, key: &str, value: Vec<u8>) -> Result<(), ClusterError> {
        self.ensure_connected()?;
        self.kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, ClusterError> {
        self.ensure_connected()?;
        Ok(self.kv.get(key).map(|entry| entry.value().clone()))
    }

    async fn kv_delete(&self, key: &str) -> Result<(), ClusterError> {
        self.ensure_connected()?;
        self.kv.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> MemoryCluster {
        MemoryCluster::new(ClusterConfig::new("node-a", "mem://test", "tests"))
    }

    fn pid(name: &str) -> ProcessId {
        ProcessId::user().child(name).unwrap()
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let c = cluster();
        c.connect().await.unwrap();
        c.connect().await.unwrap();
        assert!(c.is_connected());
        c.disconnect().await.unwrap();
        c.disconnect().await.unwrap();
        assert!(!c.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_connect() {
        let c = cluster();
        c.set_reachable(false);
        assert!(matches!(
            c.connect().await,
            Err(ClusterError::Connection(_))
        ));
        assert!(!c.is_connected());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let c = cluster();
        assert!(matches!(
            c.save_state(&pid("a"), vec![1]).await,
            Err(ClusterError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let c = cluster();
        c.connect().await.unwrap();
        let p = pid("a");

        assert_eq!(c.load_state(&p).await.unwrap(), None);
        c.save_state(&p, vec![1, 2, 3]).await.unwrap();
        assert_eq!(c.load_state(&p).await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_queue_lease_ack_cycle() {
        let c = cluster();
        c.connect().await.unwrap();
        let p = pid("q");

        c.queue_push(&p, 1, vec![1]).await.unwrap();
        c.queue_push(&p, 2, vec![2]).await.unwrap();

        // Leased entries remain in the snapshot until acked.
        c.queue_lease(&p, 1).await.unwrap();
        let snapshot = c.queue_snapshot(&p).await.unwrap();
        assert_eq!(snapshot.len(), 2);

        c.queue_ack(&p, 1).await.unwrap();
        let snapshot = c.queue_snapshot(&p).await.unwrap();
        assert_eq!(snapshot, vec![(2, vec![2])]);
    }

    #[tokio::test]
    async fn test_ack_wins_over_late_push() {
        let c = cluster();
        c.connect().await.unwrap();
        let p = pid("q");

        c.queue_ack(&p, 5).await.unwrap();
        c.queue_push(&p, 5, vec![9]).await.unwrap();
        assert!(c.queue_snapshot(&p).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_append_assigns_sequence() {
        let c = cluster();
        c.connect().await.unwrap();
        let p = pid("q");

        let s1 = c.queue_append(&p, vec![1]).await.unwrap();
        let s2 = c.queue_append(&p, vec![2]).await.unwrap();
        assert!(s2 > s1);

        c.queue_ack(&p, s1).await.unwrap();
        c.queue_ack(&p, s2).await.unwrap();
        // Sequence numbers never reuse acked slots.
        let s3 = c.queue_append(&p, vec![3]).await.unwrap();
        assert!(s3 > s2);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let c = cluster();
        c.connect().await.unwrap();
        let p = pid("chan");

        let mut rx = c.subscribe(&p);
        c.publish(&p, "node-a", vec![7]).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.origin, "node-a");
        assert_eq!(msg.data, vec![7]);
    }

    #[tokio::test]
    async fn test_kv_round_trip() {
        let c = cluster();
        c.connect().await.unwrap();

        assert_eq!(c.kv_get("k").await.unwrap(), None);
        c.kv_put("k", vec![1]).await.unwrap();
        assert_eq!(c.kv_get("k").await.unwrap(), Some(vec![1]));
        c.kv_delete("k").await.unwrap();
        assert_eq!(c.kv_get("k").await.unwrap(), None);
    }
}

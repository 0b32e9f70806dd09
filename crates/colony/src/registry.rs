//! Process registry: the shared table mapping [`ProcessId`]s to live
//! process handles.
//!
//! The supervision tree is stored as an arena of [`ProcessHandle`]s indexed
//! by id; parent/child and watcher relationships are id references, never
//! ownership pointers, so the tree cannot form reference cycles.
//!
//! All registry mutations happen inside narrow critical sections (the
//! `DashMap` shards and the small per-handle `parking_lot` locks). Mailbox
//! contents are never touched here; only the owning dispatch loop drains
//! them.

use crate::error::ProcessError;
use crate::flags::ProcessFlags;
use crate::mailbox::{Envelope, MailboxSender};
use crate::pid::ProcessId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Registry entry for one live process.
///
/// Holds everything other processes may need to interact with it: the
/// mailbox sender, the kill flag, and the id-linked tree relationships.
/// The process state itself lives inside the dispatch loop task and is
/// never reachable from here (single-writer invariant).
pub(crate) struct ProcessHandle {
    pid: ProcessId,
    parent: ProcessId,
    flags: ProcessFlags,
    sender: MailboxSender,
    killed: AtomicBool,
    next_seq: AtomicU64,
    children: Mutex<Vec<ProcessId>>,
    watchers: Mutex<HashSet<ProcessId>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProcessHandle {
    pub fn new(
        pid: ProcessId,
        parent: ProcessId,
        flags: ProcessFlags,
        sender: MailboxSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            pid,
            parent,
            flags,
            sender,
            killed: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            children: Mutex::new(Vec::new()),
            watchers: Mutex::new(HashSet::new()),
            shutdown_tx: watch::channel(false).0,
        })
    }

    pub fn pid(&self) -> &ProcessId {
        &self.pid
    }

    pub fn parent(&self) -> &ProcessId {
        &self.parent
    }

    pub fn flags(&self) -> ProcessFlags {
        self.flags
    }

    /// Lock-free snapshot of the queue depth, used by the LeastBusy router.
    pub fn inbox_len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Records the kill. Returns `true` if the process was already killed.
    pub fn mark_killed(&self) -> bool {
        self.killed.swap(true, Ordering::SeqCst)
    }

    /// Allocates the next envelope sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Advances the sequence counter past hydrated durable entries.
    pub fn bump_seq_past(&self, seq: u64) {
        self.next_seq.fetch_max(seq + 1, Ordering::Relaxed);
    }

    /// Enqueues a user envelope unless the process is killed.
    ///
    /// Returns `false` if the envelope was not accepted.
    pub fn enqueue(&self, envelope: Envelope) -> bool {
        if self.is_killed() {
            return false;
        }
        self.sender.send(envelope).is_ok()
    }

    /// Enqueues a control envelope (Stop/Terminated), ignoring the kill
    /// flag so a dying process still wakes up to finalize.
    pub fn enqueue_control(&self, envelope: Envelope) -> bool {
        self.sender.send(envelope).is_ok()
    }

    pub fn add_child(&self, child: ProcessId) {
        self.children.lock().push(child);
    }

    pub fn remove_child(&self, child: &ProcessId) {
        self.children.lock().retain(|c| c != child);
    }

    /// Children in stable insertion order.
    pub fn children(&self) -> Vec<ProcessId> {
        self.children.lock().clone()
    }

    /// Registers a watcher; idempotent. Returns `false` if already present.
    pub fn add_watcher(&self, observer: ProcessId) -> bool {
        self.watchers.lock().insert(observer)
    }

    pub fn remove_watcher(&self, observer: &ProcessId) {
        self.watchers.lock().remove(observer);
    }

    /// Takes the watcher set, leaving it empty. Each watcher is therefore
    /// notified at most once.
    pub fn drain_watchers(&self) -> Vec<ProcessId> {
        self.watchers.lock().drain().collect()
    }

    /// Receiver that resolves when the process finalizes; side tasks tied
    /// to the process lifetime select on it.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Wakes everything waiting on [`shutdown_signal`](Self::shutdown_signal).
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The shared name → handle table.
pub(crate) struct ProcessRegistry {
    entries: DashMap<ProcessId, Arc<ProcessHandle>>,
    /// Insertion-ordered children of `/root/user`, which has no handle of
    /// its own.
    top_level: Mutex<Vec<ProcessId>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            top_level: Mutex::new(Vec::new()),
        }
    }

    /// Registers a handle; fails if a sibling with the same name exists.
    pub fn register(&self, handle: Arc<ProcessHandle>) -> Result<(), ProcessError> {
        let pid = handle.pid().clone();
        match self.entries.entry(pid.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ProcessError::NameConflict(pid)),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(handle);
                Ok(())
            }
        }
    }

    /// Raw lookup, including processes that are terminating.
    pub fn get(&self, pid: &ProcessId) -> Option<Arc<ProcessHandle>> {
        self.entries.get(pid).map(|entry| entry.value().clone())
    }

    /// Lookup of live processes only; returns `None` for unknown or
    /// already-killed ids without error.
    pub fn find(&self, pid: &ProcessId) -> Option<Arc<ProcessHandle>> {
        self.get(pid).filter(|handle| !handle.is_killed())
    }

    pub fn remove(&self, pid: &ProcessId) {
        self.entries.remove(pid);
    }

    /// Records the parent/child edge after a successful registration.
    pub fn attach(&self, parent: &ProcessId, child: ProcessId) {
        if let Some(handle) = self.get(parent) {
            handle.add_child(child);
        } else if *parent == ProcessId::user() {
            self.top_level.lock().push(child);
        }
    }

    pub fn detach(&self, parent: &ProcessId, child: &ProcessId) {
        if let Some(handle) = self.get(parent) {
            handle.remove_child(child);
        } else if *parent == ProcessId::user() {
            self.top_level.lock().retain(|c| c != child);
        }
    }

    /// Children of any node in the tree, stable insertion order.
    pub fn children(&self, pid: &ProcessId) -> Vec<ProcessId> {
        if let Some(handle) = self.get(pid) {
            handle.children()
        } else if *pid == ProcessId::user() {
            self.top_level.lock().clone()
        } else {
            Vec::new()
        }
    }
}

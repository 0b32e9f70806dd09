//! The process system: spawning, messaging, supervision, pub/sub.
//!
//! `ProcessSystem` is a cheap cloneable handle over shared runtime state.
//! Every public operation goes through it; there is no global singleton, so
//! two systems in one tokio runtime stay fully isolated (tests rely on
//! this).

use crate::cluster::Cluster;
use crate::context;
use crate::error::{ClusterError, ProcessError};
use crate::flags::ProcessFlags;
use crate::mailbox::{Envelope, Mailbox};
use crate::pid::ProcessId;
use crate::process::{run_process, Durability, HandlerError, Turn};
use crate::registry::{ProcessHandle, ProcessRegistry};
use crate::scheduler::{TimerError, TimerRef, TimerTable};
use crate::session::SessionStore;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// System-wide settings.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Name of this node; used as the origin tag on published messages.
    pub node_name: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            node_name: "local".to_string(),
        }
    }
}

/// A snapshot of one process's place in the tree.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    /// The process id.
    pub pid: ProcessId,
    /// Id of the supervising parent.
    pub parent: ProcessId,
    /// Flags the process was spawned with.
    pub flags: ProcessFlags,
    /// Ids of the live children, in spawn order.
    pub children: Vec<ProcessId>,
    /// Messages currently waiting in the mailbox.
    pub inbox_len: usize,
}

/// Handle to one local subscription, used for unsubscribing.
#[derive(Debug)]
pub struct SubRef {
    channel: ProcessId,
    id: u64,
}

struct Subscriber {
    id: u64,
    handler: Arc<dyn Fn(&[u8]) + Send + Sync>,
}

/// Handle to a running process system.
#[derive(Clone)]
pub struct ProcessSystem {
    inner: Arc<SystemInner>,
}

struct SystemInner {
    config: SystemConfig,
    registry: ProcessRegistry,
    timers: TimerTable,
    subscriptions: DashMap<ProcessId, Vec<Subscriber>>,
    subscription_seq: AtomicU64,
    sessions: SessionStore,
    cluster: parking_lot::RwLock<Option<Arc<dyn Cluster>>>,
    connected: AtomicBool,
}

impl Default for ProcessSystem {
    fn default() -> Self {
        Self::new(SystemConfig::default())
    }
}

impl ProcessSystem {
    /// Creates a new, empty system.
    pub fn new(config: SystemConfig) -> Self {
        Self {
            inner: Arc::new(SystemInner {
                config,
                registry: ProcessRegistry::new(),
                timers: TimerTable::new(),
                subscriptions: DashMap::new(),
                subscription_seq: AtomicU64::new(1),
                sessions: SessionStore::new(),
                cluster: parking_lot::RwLock::new(None),
                connected: AtomicBool::new(false),
            }),
        }
    }

    /// This node's name.
    pub fn node_name(&self) -> &str {
        &self.inner.config.node_name
    }

    pub(crate) fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub(crate) fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    // ---------------------------------------------------------------------
    // Cluster lifecycle

    /// Registers the cluster backend. Replaces any previous backend;
    /// processes already running keep the backend they were spawned with.
    pub fn register_cluster(&self, cluster: Arc<dyn Cluster>) {
        *self.inner.cluster.write() = Some(cluster);
    }

    /// Connects the registered backend. Until this succeeds, every
    /// cluster-dependent capability silently degrades to in-memory.
    pub async fn connect(&self) -> Result<(), ClusterError> {
        let cluster = self
            .inner
            .cluster
            .read()
            .clone()
            .ok_or(ClusterError::NotConnected)?;
        cluster.connect().await?;
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Disconnects the registered backend.
    pub async fn disconnect(&self) -> Result<(), ClusterError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(cluster) = self.inner.cluster.read().clone() {
            cluster.disconnect().await?;
        }
        Ok(())
    }

    /// The connected cluster backend, if any.
    pub(crate) fn cluster(&self) -> Option<Arc<dyn Cluster>> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.cluster.read().clone()
    }

    // ---------------------------------------------------------------------
    // Spawning

    /// Spawns a process under the current process (or `/root/user` when
    /// called from outside any process).
    ///
    /// The inbox handler receives the state by value and returns the next
    /// state; returning an error terminates the process. Spawning is
    /// synchronous: the pid is valid immediately, and any persisted state
    /// or durable inbox is hydrated inside the new task before the first
    /// live message is dispatched.
    pub fn spawn<S, M, F>(
        &self,
        name: &str,
        flags: ProcessFlags,
        initial: S,
        inbox: F,
    ) -> Result<ProcessId, ProcessError>
    where
        S: Clone + Serialize + DeserializeOwned + Send + 'static,
        M: DeserializeOwned + Send + 'static,
        F: FnMut(S, M, &mut Turn) -> Result<S, HandlerError> + Send + 'static,
    {
        self.spawn_with_terminated(name, flags, initial, inbox, |state, _| state)
    }

    /// Like [`spawn`](Self::spawn), with a handler invoked when a watched
    /// process terminates. The handler also runs with the process's own id
    /// when the process itself fails, observing its final state.
    pub fn spawn_with_terminated<S, M, F, T>(
        &self,
        name: &str,
        flags: ProcessFlags,
        initial: S,
        inbox: F,
        on_terminated: T,
    ) -> Result<ProcessId, ProcessError>
    where
        S: Clone + Serialize + DeserializeOwned + Send + 'static,
        M: DeserializeOwned + Send + 'static,
        F: FnMut(S, M, &mut Turn) -> Result<S, HandlerError> + Send + 'static,
        T: FnMut(S, ProcessId) -> S + Send + 'static,
    {
        let (handle, mailbox, pid) = self.register_node(name, flags)?;
        let durability = self.resolve_durability(&pid, flags);

        let system = self.clone();
        tokio::spawn(context::pid_scope(
            pid.clone(),
            run_process(
                system,
                handle,
                mailbox,
                initial,
                Box::new(inbox),
                Some(Box::new(on_terminated)),
                durability,
            ),
        ));

        if flags.listen_remote_and_local {
            self.attach_remote_listener(&pid);
        }

        Ok(pid)
    }

    /// Reserves the pid and registers the mailbox; shared by processes and
    /// routers.
    pub(crate) fn register_node(
        &self,
        name: &str,
        flags: ProcessFlags,
    ) -> Result<(Arc<ProcessHandle>, Mailbox, ProcessId), ProcessError> {
        let parent = context::current_pid().unwrap_or_else(ProcessId::user);
        let pid = parent.child(name)?;
        let (mailbox, sender) = Mailbox::channel();
        let handle = ProcessHandle::new(pid.clone(), parent.clone(), flags, sender);
        self.inner.registry.register(handle.clone())?;
        self.inner.registry.attach(&parent, pid.clone());
        debug!(%pid, ?flags, "spawned process");
        Ok((handle, mailbox, pid))
    }

    fn resolve_durability(&self, pid: &ProcessId, flags: ProcessFlags) -> Durability {
        if !flags.is_persistent() {
            return Durability::none();
        }
        match self.cluster() {
            Some(cluster) => Durability {
                state: flags.persist_state.then(|| cluster.clone()),
                inbox: flags.persist_inbox.then(|| cluster.clone()),
            },
            None => {
                warn!(%pid, "persistence flags set without a connected cluster; running in-memory");
                Durability::none()
            }
        }
    }

    /// Feeds messages published on other nodes into this process's local
    /// subscribers. The task lives exactly as long as the process: it
    /// selects on the handle's shutdown signal, raised during finalize,
    /// so a quiet channel cannot keep it or its receiver alive.
    fn attach_remote_listener(&self, pid: &ProcessId) {
        let Some(cluster) = self.cluster() else {
            warn!(%pid, "remote listen flag set without a connected cluster");
            return;
        };
        let Some(handle) = self.registry().get(pid) else {
            return;
        };
        let mut shutdown = handle.shutdown_signal();
        let mut rx = cluster.subscribe(pid);
        let system = self.clone();
        let node = self.node_name().to_string();
        let pid = pid.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    msg = rx.recv() => match msg {
                        Ok(msg) => {
                            // Locally published messages were already delivered.
                            if msg.origin == node {
                                continue;
                            }
                            system.dispatch_local_subscribers(&pid, &msg.data);
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(%pid, missed, "remote subscription lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    // ---------------------------------------------------------------------
    // Messaging

    /// Sends a fire-and-forget message. Delivery to unknown processes is
    /// dropped unless a connected cluster can queue it for a future
    /// activation.
    pub fn tell<M: Serialize>(&self, pid: &ProcessId, msg: &M) -> Result<(), ProcessError> {
        let data = serde_json::to_vec(msg)?;
        self.tell_raw(pid, data);
        Ok(())
    }

    pub(crate) fn tell_raw(&self, pid: &ProcessId, data: Vec<u8>) {
        let sender = context::current_pid().unwrap_or_else(ProcessId::none);
        match self.inner.registry.find(pid) {
            Some(handle) => {
                let seq = handle.next_seq();
                if handle.flags().persist_inbox {
                    if let Some(cluster) = self.cluster() {
                        let target = pid.clone();
                        let blob = data.clone();
                        tokio::spawn(async move {
                            if let Err(err) = cluster.queue_push(&target, seq, blob).await {
                                warn!(%target, seq, %err, "durable inbox write failed");
                            }
                        });
                    }
                }
                if !handle.enqueue(Envelope::user(seq, sender, data, None)) {
                    debug!(%pid, "message dropped; process terminating");
                }
            }
            None => {
                if let Some(cluster) = self.cluster() {
                    let target = pid.clone();
                    tokio::spawn(async move {
                        match cluster.queue_append(&target, data).await {
                            Ok(seq) => {
                                debug!(%target, seq, "queued message for inactive process")
                            }
                            Err(err) => {
                                warn!(%target, %err, "failed to queue message for inactive process")
                            }
                        }
                    });
                } else {
                    debug!(%pid, "dropped message to unknown process");
                }
            }
        }
    }

    /// Sends `msg` to `pid` after `delay`. The returned [`TimerRef`] can
    /// cancel the delivery while it is still pending. The target is
    /// resolved at fire time, not at schedule time.
    pub fn tell_after<M: Serialize>(
        &self,
        pid: &ProcessId,
        msg: &M,
        delay: Duration,
    ) -> Result<TimerRef, ProcessError> {
        let data = serde_json::to_vec(msg)?;
        let system = self.clone();
        let target = pid.clone();
        Ok(self
            .inner
            .timers
            .schedule(delay, move || system.tell_raw(&target, data)))
    }

    /// Cancels a pending delayed delivery, returning the remaining time.
    pub fn cancel_timer(&self, timer: TimerRef) -> Result<Duration, TimerError> {
        self.inner.timers.cancel(timer)
    }

    /// Remaining time on a pending delayed delivery.
    pub fn timer_remaining(&self, timer: TimerRef) -> Option<Duration> {
        self.inner.timers.read(timer)
    }

    /// Sends a message and awaits the reply.
    ///
    /// Fails with [`ProcessError::TimedOut`] when no reply arrives in time,
    /// [`ProcessError::NoReply`] when the handler finished without calling
    /// [`Turn::reply`], and [`ProcessError::HandlerFailed`] when the
    /// handler crashed on this message.
    pub async fn ask<M, R>(
        &self,
        pid: &ProcessId,
        msg: &M,
        timeout: Duration,
    ) -> Result<R, ProcessError>
    where
        M: Serialize,
        R: DeserializeOwned,
    {
        let handle = self
            .inner
            .registry
            .find(pid)
            .ok_or_else(|| ProcessError::ProcessNotFound(pid.clone()))?;
        let data = serde_json::to_vec(msg)?;
        let sender = context::current_pid().unwrap_or_else(ProcessId::none);
        let (tx, rx) = oneshot::channel();

        let seq = handle.next_seq();
        if !handle.enqueue(Envelope::user(seq, sender, data, Some(tx))) {
            return Err(ProcessError::ProcessNotFound(pid.clone()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ProcessError::TimedOut),
            // The dispatch loop dropped the envelope without resolving it.
            Ok(Err(_)) => Err(ProcessError::NoReply),
            Ok(Ok(Ok(bytes))) => Ok(serde_json::from_slice(&bytes)?),
            Ok(Ok(Err(err))) => Err(err),
        }
    }

    // ---------------------------------------------------------------------
    // Supervision

    /// Registers `observer` to receive a terminated notification when
    /// `observed` terminates. Watching an already-dead (or never-spawned)
    /// process delivers the notification immediately. Idempotent.
    pub fn watch(&self, observer: &ProcessId, observed: &ProcessId) {
        match self.inner.registry.find(observed) {
            Some(handle) => {
                handle.add_watcher(observer.clone());
            }
            None => {
                if let Some(obs) = self.inner.registry.find(observer) {
                    obs.enqueue_control(Envelope::terminated(observed.clone()));
                }
            }
        }
    }

    /// Removes a watch registration. No-op when not registered.
    pub fn unwatch(&self, observer: &ProcessId, observed: &ProcessId) {
        if let Some(handle) = self.inner.registry.get(observed) {
            handle.remove_watcher(observer);
        }
    }

    /// Terminates a process and its whole subtree.
    ///
    /// Kill is asynchronous: the pid disappears from lookups immediately,
    /// but the dispatch loop finishes its current message before running
    /// teardown. Killing an unknown pid is a no-op.
    pub fn kill(&self, pid: &ProcessId) {
        let Some(handle) = self.inner.registry.get(pid) else {
            return;
        };
        if handle.mark_killed() {
            return;
        }
        debug!(%pid, "kill requested");
        for child in handle.children() {
            self.kill(&child);
        }
        handle.enqueue_control(Envelope::stop());
    }

    // ---------------------------------------------------------------------
    // Introspection

    /// Looks a live process up by id.
    pub fn find(&self, pid: &ProcessId) -> Option<ProcessInfo> {
        let handle = self.inner.registry.find(pid)?;
        Some(ProcessInfo {
            pid: handle.pid().clone(),
            parent: handle.parent().clone(),
            flags: handle.flags(),
            children: handle.children(),
            inbox_len: handle.inbox_len(),
        })
    }

    /// Live children of `pid`, in spawn order. `ProcessId::user()` lists
    /// the top-level processes.
    pub fn children(&self, pid: &ProcessId) -> Vec<ProcessId> {
        self.inner.registry.children(pid)
    }

    /// Current mailbox depth of a live process.
    pub fn inbox_len(&self, pid: &ProcessId) -> Option<usize> {
        self.inner.registry.find(pid).map(|handle| handle.inbox_len())
    }

    // ---------------------------------------------------------------------
    // Pub/sub

    /// Publishes a message on `pid`'s channel to every local subscriber,
    /// and, when the process carries the remote-publish flag and a cluster
    /// is connected, to subscribers on other nodes.
    pub fn publish<M: Serialize>(&self, pid: &ProcessId, msg: &M) -> Result<(), ProcessError> {
        let data = serde_json::to_vec(msg)?;
        self.dispatch_local_subscribers(pid, &data);

        if let Some(handle) = self.inner.registry.find(pid) {
            if handle.flags().remote_publish {
                if let Some(cluster) = self.cluster() {
                    let target = pid.clone();
                    let node = self.node_name().to_string();
                    tokio::spawn(async move {
                        if let Err(err) = cluster.publish(&target, &node, data).await {
                            warn!(%target, %err, "remote publish failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn dispatch_local_subscribers(&self, pid: &ProcessId, data: &[u8]) {
        // Snapshot the handlers so a subscriber can unsubscribe from
        // inside its own callback.
        let handlers: Vec<Arc<dyn Fn(&[u8]) + Send + Sync>> = self
            .inner
            .subscriptions
            .get(pid)
            .map(|subs| subs.iter().map(|sub| sub.handler.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(data);
        }
    }

    /// Subscribes a callback to `pid`'s channel. Messages that do not
    /// decode as `T` are skipped for this subscriber only.
    pub fn subscribe<T, F>(&self, pid: &ProcessId, handler: F) -> SubRef
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = self.inner.subscription_seq.fetch_add(1, Ordering::Relaxed);
        let channel = pid.clone();
        let wrapped: Arc<dyn Fn(&[u8]) + Send + Sync> = Arc::new(move |data: &[u8]| {
            match serde_json::from_slice::<T>(data) {
                Ok(msg) => handler(msg),
                Err(err) => debug!(channel = %channel, %err, "subscriber skipped undecodable message"),
            }
        });
        self.inner
            .subscriptions
            .entry(pid.clone())
            .or_default()
            .push(Subscriber {
                id,
                handler: wrapped,
            });
        SubRef {
            channel: pid.clone(),
            id,
        }
    }

    /// Removes one subscription. No-op when already removed.
    pub fn unsubscribe(&self, sub: SubRef) {
        if let Some(mut subs) = self.inner.subscriptions.get_mut(&sub.channel) {
            subs.retain(|entry| entry.id != sub.id);
        }
    }
}

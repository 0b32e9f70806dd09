//! The per-process dispatch loop.
//!
//! Each process runs as one tokio task that drains its mailbox serially:
//! no two messages to the same process are ever processed concurrently, and
//! submission order is preserved. The loop owns the process state outright;
//! nothing outside the task can reach it.
//!
//! Failure handling is "let it crash, notify, terminate": an error or panic
//! in the user inbox handler terminates the process, notifies its watchers,
//! and never propagates to the sender of a `tell`. Callers of `ask` see the
//! failure as an `Err` on their reply channel.

use crate::cluster::Cluster;
use crate::error::ProcessError;
use crate::mailbox::{Envelope, Mailbox, Payload, ReplySender};
use crate::pid::ProcessId;
use crate::registry::ProcessHandle;
use crate::system::ProcessSystem;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Error type user inbox handlers may return; any error converts the
/// current message into a process failure.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed user inbox function: `(state, message, turn) -> new state`.
pub(crate) type InboxFn<S, M> =
    Box<dyn FnMut(S, M, &mut Turn) -> Result<S, HandlerError> + Send>;

/// Boxed terminated handler: `(state, dead pid) -> new state`.
///
/// Invoked when a watched process terminates, and with the process's own
/// id when the process itself fails.
pub(crate) type TerminatedFn<S> = Box<dyn FnMut(S, ProcessId) -> S + Send>;

/// Per-message context handed to the inbox handler.
///
/// Carries the identity of the process, the sender of the current message,
/// and the reply channel when the message arrived via `ask`.
pub struct Turn {
    own: ProcessId,
    sender: ProcessId,
    reply: Option<ReplySender>,
}

impl Turn {
    pub(crate) fn new(own: ProcessId, sender: ProcessId, reply: Option<ReplySender>) -> Self {
        Self { own, sender, reply }
    }

    /// The id of the process handling the message.
    pub fn pid(&self) -> &ProcessId {
        &self.own
    }

    /// The sender of the current message; [`ProcessId::none()`] for
    /// anonymous senders.
    pub fn sender(&self) -> &ProcessId {
        &self.sender
    }

    /// Returns `true` if the current message arrived via `ask` and has not
    /// been replied to yet.
    pub fn is_ask(&self) -> bool {
        self.reply.is_some()
    }

    /// Sends the reply for an `ask`.
    ///
    /// No-op when the current message was a `tell` or was already replied
    /// to, so handlers can reply unconditionally.
    pub fn reply<R: Serialize>(&mut self, value: &R) -> Result<(), ProcessError> {
        let Some(tx) = self.reply.take() else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(value)?;
        let _ = tx.send(Ok(bytes));
        Ok(())
    }

    /// Resolves a still-pending ask after the handler ran: `Ok` turns into
    /// `NoReply`, a failure is forwarded as-is.
    fn resolve(self, outcome: Result<(), ProcessError>) {
        if let Some(tx) = self.reply {
            let _ = tx.send(Err(match outcome {
                Ok(()) => ProcessError::NoReply,
                Err(err) => err,
            }));
        }
    }
}

/// Cluster capabilities resolved from the process flags at spawn time.
///
/// The dispatch loop checks these `Option`s, never the raw flag bits.
pub(crate) struct Durability {
    pub state: Option<Arc<dyn Cluster>>,
    pub inbox: Option<Arc<dyn Cluster>>,
}

impl Durability {
    pub fn none() -> Self {
        Self {
            state: None,
            inbox: None,
        }
    }
}

/// Runs one process to completion: hydrate, drain, finalize.
pub(crate) async fn run_process<S, M>(
    system: ProcessSystem,
    handle: Arc<ProcessHandle>,
    mut mailbox: Mailbox,
    initial: S,
    mut inbox: InboxFn<S, M>,
    mut on_terminated: Option<TerminatedFn<S>>,
    durability: Durability,
) where
    S: Clone + Serialize + DeserializeOwned + Send + 'static,
    M: DeserializeOwned + Send + 'static,
{
    let pid = handle.pid().clone();
    let mut state = initial;
    let mut failed = false;

    // Restore persisted state before any message is observed.
    if let Some(cluster) = &durability.state {
        match cluster.load_state(&pid).await {
            Ok(Some(blob)) => match serde_json::from_slice(&blob) {
                Ok(saved) => {
                    debug!(%pid, "restored persisted state");
                    state = saved;
                }
                Err(err) => {
                    warn!(%pid, %err, "persisted state did not decode; keeping initial state")
                }
            },
            Ok(None) => {}
            Err(err) => warn!(%pid, %err, "state hydration failed; keeping initial state"),
        }
    }

    // Replay durably queued messages ahead of the live mailbox. Messages
    // told to the process while this runs simply queue up behind them.
    if let Some(cluster) = durability.inbox.clone() {
        match cluster.queue_snapshot(&pid).await {
            Ok(entries) => {
                for (seq, data) in entries {
                    handle.bump_seq_past(seq);
                    if dispatch_user(
                        &pid,
                        &mut state,
                        &mut inbox,
                        &durability,
                        seq,
                        ProcessId::none(),
                        data,
                        None,
                    )
                    .await
                    {
                        failed = true;
                        break;
                    }
                }
            }
            Err(err) => warn!(%pid, %err, "inbox hydration failed"),
        }
    }

    info!(%pid, "process running");

    while !failed {
        let Some(envelope) = mailbox.recv().await else {
            break;
        };
        // Once the kill is recorded, the backlog is not processed. Durably
        // queued entries stay un-acked and replay on the next activation.
        if handle.is_killed() {
            break;
        }
        match envelope.payload {
            Payload::Stop => break,
            Payload::Terminated(dead) => {
                debug!(%pid, %dead, "watched process terminated");
                if let Some(handler) = on_terminated.as_mut() {
                    let snapshot = state.clone();
                    let dead_pid = dead.clone();
                    match catch_unwind(AssertUnwindSafe(move || handler(snapshot, dead_pid))) {
                        Ok(next) => state = next,
                        Err(panic) => {
                            warn!(
                                %pid,
                                error = %panic_message(panic),
                                "terminated handler panicked; terminating process"
                            );
                            failed = true;
                        }
                    }
                }
            }
            Payload::User(data) => {
                failed = dispatch_user(
                    &pid,
                    &mut state,
                    &mut inbox,
                    &durability,
                    envelope.seq,
                    envelope.sender,
                    data,
                    envelope.reply,
                )
                .await;
            }
        }
    }

    if failed {
        // The process's own terminated handler observes its final state.
        if let Some(handler) = on_terminated.as_mut() {
            let snapshot = state.clone();
            let own = pid.clone();
            let _ = catch_unwind(AssertUnwindSafe(move || handler(snapshot, own)));
        }
    }

    finalize(&system, &handle);
}

/// Processes one user message. Returns `true` if the handler failed and
/// the process must terminate.
#[allow(clippy::too_many_arguments)]
async fn dispatch_user<S, M>(
    pid: &ProcessId,
    state: &mut S,
    inbox: &mut InboxFn<S, M>,
    durability: &Durability,
    seq: u64,
    sender: ProcessId,
    data: Vec<u8>,
    reply: Option<ReplySender>,
) -> bool
where
    S: Clone + Serialize + Send + 'static,
    M: DeserializeOwned + Send + 'static,
{
    // Durable lease precedes the dispatch so a crash before the ack leads
    // to redelivery on the next activation.
    if let Some(cluster) = &durability.inbox {
        if let Err(err) = cluster.queue_lease(pid, seq).await {
            warn!(%pid, seq, %err, "durable lease write failed");
        }
    }

    let mut turn = Turn::new(pid.clone(), sender, reply);

    let msg: M = match serde_json::from_slice(&data) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(%pid, %err, "dropping undecodable message");
            turn.resolve(Err(ProcessError::Codec(err.to_string())));
            ack(durability, pid, seq).await;
            return false;
        }
    };

    let snapshot = state.clone();
    let outcome = catch_unwind(AssertUnwindSafe(|| inbox(snapshot, msg, &mut turn)));

    match outcome {
        Ok(Ok(next)) => {
            *state = next;
            // Commit the state before resolving the ask, so a caller that
            // saw the reply can rely on the new state surviving a restart.
            if let Some(cluster) = &durability.state {
                match serde_json::to_vec(state) {
                    Ok(blob) => {
                        if let Err(err) = cluster.save_state(pid, blob).await {
                            warn!(%pid, %err, "state save failed");
                        }
                    }
                    Err(err) => warn!(%pid, %err, "state did not serialize"),
                }
            }
            ack(durability, pid, seq).await;
            turn.resolve(Ok(()));
            false
        }
        Ok(Err(err)) => {
            warn!(%pid, %err, "inbox handler failed; terminating process");
            turn.resolve(Err(ProcessError::HandlerFailed(err.to_string())));
            true
        }
        Err(panic) => {
            let message = panic_message(panic);
            warn!(%pid, error = %message, "inbox handler panicked; terminating process");
            turn.resolve(Err(ProcessError::HandlerFailed(message)));
            true
        }
    }
}

async fn ack(durability: &Durability, pid: &ProcessId, seq: u64) {
    if let Some(cluster) = &durability.inbox {
        if let Err(err) = cluster.queue_ack(pid, seq).await {
            warn!(%pid, seq, %err, "durable ack write failed");
        }
    }
}

/// Tears a process down: children first, then watcher notification, then
/// registry removal. Runs exactly once, in the dying process's own task.
pub(crate) fn finalize(system: &ProcessSystem, handle: &ProcessHandle) {
    let pid = handle.pid().clone();
    handle.mark_killed();
    handle.signal_shutdown();

    // Post-order: the subtree dies before this process disappears.
    for child in handle.children() {
        system.kill(&child);
    }

    for watcher in handle.drain_watchers() {
        if let Some(observer) = system.registry().get(&watcher) {
            observer.enqueue_control(Envelope::terminated(pid.clone()));
        }
    }

    system.registry().detach(handle.parent(), &pid);
    system.registry().remove(&pid);
    info!(%pid, "process terminated");
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

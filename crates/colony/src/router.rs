//! Routers: processes that forward their mailbox to a worker pool.
//!
//! A router is a real process with a pid, a mailbox, and a place in the
//! supervision tree; senders cannot tell one apart from a plain process.
//! Instead of a user inbox handler it runs a forwarding loop that applies a
//! routing policy per message. Forwarding moves the whole envelope, so an
//! `ask` through a selective router is answered by the chosen worker.

use crate::context;
use crate::error::ProcessError;
use crate::flags::ProcessFlags;
use crate::mailbox::{Envelope, Mailbox, Payload, ReplySender};
use crate::pid::ProcessId;
use crate::process::finalize;
use crate::registry::ProcessHandle;
use crate::system::ProcessSystem;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

/// How a router picks workers for each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterPolicy {
    /// Every worker receives a copy of every message.
    Broadcast,
    /// Workers take strict turns in list order.
    RoundRobin,
    /// The worker with the shallowest mailbox at send time wins; ties go
    /// to the earliest worker in the list.
    LeastBusy,
    /// A uniformly random worker per message.
    Random,
}

/// Pool maintenance behavior.
#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    /// Drop workers from the pool when they terminate.
    pub remove_worker_when_terminated: bool,
    /// Kill the remaining workers when the router itself terminates.
    pub kill_workers_on_terminate: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            remove_worker_when_terminated: true,
            kill_workers_on_terminate: false,
        }
    }
}

impl ProcessSystem {
    /// Spawns a router over `workers` under the current process.
    ///
    /// The workers must already exist; the router does not spawn them and,
    /// unless [`RouterOptions::kill_workers_on_terminate`] is set, does not
    /// own their lifetime.
    pub fn router(
        &self,
        name: &str,
        policy: RouterPolicy,
        workers: Vec<ProcessId>,
        options: RouterOptions,
    ) -> Result<ProcessId, ProcessError> {
        let (handle, mailbox, pid) = self.register_node(name, ProcessFlags::NONE)?;

        if options.remove_worker_when_terminated {
            for worker in &workers {
                self.watch(&pid, worker);
            }
        }

        let system = self.clone();
        tokio::spawn(context::pid_scope(
            pid.clone(),
            run_router(system, handle, mailbox, policy, workers, options),
        ));
        Ok(pid)
    }
}

async fn run_router(
    system: ProcessSystem,
    handle: Arc<ProcessHandle>,
    mut mailbox: Mailbox,
    policy: RouterPolicy,
    mut workers: Vec<ProcessId>,
    options: RouterOptions,
) {
    let pid = handle.pid().clone();
    let mut cursor = 0usize;
    info!(%pid, ?policy, workers = workers.len(), "router running");

    while let Some(envelope) = mailbox.recv().await {
        if handle.is_killed() {
            break;
        }
        match envelope.payload {
            Payload::Stop => break,
            Payload::Terminated(dead) => {
                workers.retain(|worker| *worker != dead);
                debug!(%pid, %dead, remaining = workers.len(), "removed terminated worker");
            }
            Payload::User(data) => {
                if workers.is_empty() {
                    debug!(%pid, "router has no workers; dropping message");
                    if let Some(tx) = envelope.reply {
                        let _ = tx.send(Err(ProcessError::NoReply));
                    }
                    continue;
                }
                match policy {
                    RouterPolicy::Broadcast => {
                        // A reply channel cannot be duplicated per worker.
                        if let Some(tx) = envelope.reply {
                            let _ = tx.send(Err(ProcessError::NoReply));
                        }
                        for worker in &workers {
                            forward(&system, worker, envelope.sender.clone(), data.clone(), None);
                        }
                    }
                    RouterPolicy::RoundRobin => {
                        let worker = workers[cursor % workers.len()].clone();
                        cursor = cursor.wrapping_add(1);
                        forward(&system, &worker, envelope.sender, data, envelope.reply);
                    }
                    RouterPolicy::LeastBusy => {
                        let worker = workers
                            .iter()
                            .min_by_key(|worker| {
                                system.inbox_len(worker).unwrap_or(usize::MAX)
                            })
                            .cloned();
                        if let Some(worker) = worker {
                            forward(&system, &worker, envelope.sender, data, envelope.reply);
                        }
                    }
                    RouterPolicy::Random => {
                        let index = rand::thread_rng().gen_range(0..workers.len());
                        let worker = workers[index].clone();
                        forward(&system, &worker, envelope.sender, data, envelope.reply);
                    }
                }
            }
        }
    }

    if options.kill_workers_on_terminate {
        for worker in &workers {
            system.kill(worker);
        }
    }
    finalize(&system, &handle);
}

/// Re-enqueues a forwarded envelope at the worker, preserving the original
/// sender and any pending reply channel.
fn forward(
    system: &ProcessSystem,
    worker: &ProcessId,
    sender: ProcessId,
    data: Vec<u8>,
    reply: Option<ReplySender>,
) {
    match system.registry().find(worker) {
        Some(handle) => {
            let seq = handle.next_seq();
            if !handle.enqueue(Envelope::user(seq, sender, data, reply)) {
                debug!(%worker, "worker rejected forwarded message");
            }
        }
        None => {
            if let Some(tx) = reply {
                let _ = tx.send(Err(ProcessError::ProcessNotFound(worker.clone())));
            }
        }
    }
}

//! Process mailbox and message envelopes.
//!
//! Each process owns exactly one [`Mailbox`], drained serially by its
//! dispatch loop. Senders hold cloneable [`MailboxSender`]s backed by an
//! unbounded MPSC channel, so `tell` never blocks the caller.
//!
//! The queue depth is mirrored in a shared atomic counter so the LeastBusy
//! router can snapshot inbox lengths without touching the queue itself.

use crate::error::ProcessError;
use crate::pid::ProcessId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Reply channel carried by `ask` envelopes.
pub(crate) type ReplySender = oneshot::Sender<Result<Vec<u8>, ProcessError>>;

/// What an envelope carries.
pub(crate) enum Payload {
    /// A user message, serialized by the sending side.
    User(Vec<u8>),
    /// A watched process terminated.
    Terminated(ProcessId),
    /// Stop the dispatch loop; enqueued by `kill`.
    Stop,
}

/// A single queued message.
///
/// Created by the sender, consumed exactly once by the receiving dispatch
/// loop. The `seq` number keys durable lease/ack writes for processes with
/// a persistent inbox.
pub(crate) struct Envelope {
    pub seq: u64,
    pub sender: ProcessId,
    pub payload: Payload,
    pub reply: Option<ReplySender>,
}

impl Envelope {
    pub fn user(seq: u64, sender: ProcessId, data: Vec<u8>, reply: Option<ReplySender>) -> Self {
        Self {
            seq,
            sender,
            payload: Payload::User(data),
            reply,
        }
    }

    pub fn terminated(dead: ProcessId) -> Self {
        Self {
            seq: 0,
            sender: ProcessId::none(),
            payload: Payload::Terminated(dead),
            reply: None,
        }
    }

    pub fn stop() -> Self {
        Self {
            seq: 0,
            sender: ProcessId::none(),
            payload: Payload::Stop,
            reply: None,
        }
    }
}

/// The receiving end of a process mailbox.
pub(crate) struct Mailbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    depth: Arc<AtomicUsize>,
}

impl Mailbox {
    /// Creates a mailbox and its sending half.
    pub fn channel() -> (Mailbox, MailboxSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Mailbox {
                rx,
                depth: depth.clone(),
            },
            MailboxSender { tx, depth },
        )
    }

    /// Receives the next envelope, decrementing the shared depth counter.
    ///
    /// Returns `None` once all senders are dropped and the queue is empty.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let envelope = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(envelope)
    }
}

/// The cloneable sending end of a process mailbox.
#[derive(Clone)]
pub(crate) struct MailboxSender {
    tx: mpsc::UnboundedSender<Envelope>,
    depth: Arc<AtomicUsize>,
}

impl MailboxSender {
    /// Enqueues an envelope. Returns it back if the mailbox is closed.
    pub fn send(&self, envelope: Envelope) -> Result<(), Envelope> {
        // Increment first so a concurrent depth read never undercounts a
        // message that is about to land.
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.send(envelope).map_err(|err| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            err.0
        })
    }

    /// Snapshot of the current queue depth.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_recv_preserves_order() {
        let (mut mailbox, sender) = Mailbox::channel();

        for i in 0..5u64 {
            sender
                .send(Envelope::user(i, ProcessId::none(), vec![i as u8], None))
                .ok()
                .unwrap();
        }

        for i in 0..5u8 {
            let env = mailbox.recv().await.unwrap();
            match env.payload {
                Payload::User(data) => assert_eq!(data, vec![i]),
                _ => panic!("expected user payload"),
            }
        }
    }

    #[tokio::test]
    async fn test_depth_tracks_queue() {
        let (mut mailbox, sender) = Mailbox::channel();
        assert_eq!(sender.len(), 0);

        sender
            .send(Envelope::user(0, ProcessId::none(), vec![1], None))
            .ok()
            .unwrap();
        sender
            .send(Envelope::user(1, ProcessId::none(), vec![2], None))
            .ok()
            .unwrap();
        assert_eq!(sender.len(), 2);

        mailbox.recv().await.unwrap();
        assert_eq!(sender.len(), 1);
        mailbox.recv().await.unwrap();
        assert_eq!(sender.len(), 0);
    }

    #[tokio::test]
    async fn test_dropped_mailbox_rejects_sends() {
        let (mailbox, sender) = Mailbox::channel();
        drop(mailbox);

        // Sends bounce and the depth counter stays balanced.
        assert!(sender
            .send(Envelope::user(0, ProcessId::none(), vec![1], None))
            .is_err());
        assert_eq!(sender.len(), 0);
    }
}

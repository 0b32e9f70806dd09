//! Shared scheduler for delayed message delivery.
//!
//! A delayed `tell` is held here until its delay elapses, then performs a
//! normal enqueue. One timer table serves the whole system; no worker
//! thread ever blocks on a pending delay. Timers can be cancelled while
//! still pending, returning the remaining time.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

/// Handle to a pending delayed delivery, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerRef(u64);

/// Errors for timer control operations.
#[derive(Debug, Error)]
pub enum TimerError {
    /// The timer already fired or was already cancelled.
    #[error("timer not found or already fired")]
    NotFound,
}

struct TimerEntry {
    cancel_tx: mpsc::Sender<()>,
    started_at: Instant,
    delay: Duration,
}

/// The system-wide timer table.
#[derive(Clone)]
pub(crate) struct TimerTable {
    inner: Arc<TimerShared>,
}

struct TimerShared {
    entries: DashMap<u64, TimerEntry>,
    seq: AtomicU64,
}

impl TimerTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerShared {
                entries: DashMap::new(),
                seq: AtomicU64::new(1),
            }),
        }
    }

    /// Schedules `fire` to run after `delay` unless cancelled first.
    pub fn schedule<F>(&self, delay: Duration, fire: F) -> TimerRef
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);

        self.inner.entries.insert(
            id,
            TimerEntry {
                cancel_tx,
                started_at: Instant::now(),
                delay,
            },
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel_rx.recv() => {}
                _ = tokio::time::sleep(delay) => {
                    fire();
                }
            }
            inner.entries.remove(&id);
        });

        TimerRef(id)
    }

    /// Cancels a pending timer, returning the remaining time.
    pub fn cancel(&self, timer: TimerRef) -> Result<Duration, TimerError> {
        let Some((_, entry)) = self.inner.entries.remove(&timer.0) else {
            return Err(TimerError::NotFound);
        };
        let remaining = entry.delay.saturating_sub(entry.started_at.elapsed());
        // The task may have already exited; ignore.
        let _ = entry.cancel_tx.try_send(());
        Ok(remaining)
    }

    /// Remaining time on a pending timer without cancelling it.
    pub fn read(&self, timer: TimerRef) -> Option<Duration> {
        self.inner
            .entries
            .get(&timer.0)
            .map(|entry| entry.delay.saturating_sub(entry.started_at.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_timer_fires() {
        let table = TimerTable::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let timer = table.schedule(Duration::from_millis(30), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(table.read(timer).is_none());
    }

    #[tokio::test]
    async fn test_cancel_prevents_fire() {
        let table = TimerTable::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let timer = table.schedule(Duration::from_millis(100), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        let remaining = table.cancel(timer).unwrap();
        assert!(remaining <= Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_after_fire_reports_not_found() {
        let table = TimerTable::new();
        let timer = table.schedule(Duration::from_millis(10), || {});

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(table.cancel(timer), Err(TimerError::NotFound)));
    }

    #[tokio::test]
    async fn test_read_counts_down() {
        let table = TimerTable::new();
        let timer = table.schedule(Duration::from_millis(100), || {});

        let first = table.read(timer).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = table.read(timer).unwrap();
        assert!(second < first);

        table.cancel(timer).unwrap();
        assert!(table.read(timer).is_none());
    }
}

//! Asynchronous audit logger
//!
//! `AuditLogger` is the cheap clonable handle handlers use; the drainer
//! task owns the storage writer and flushes in batches. Backpressure
//! policy: once the queue has been full for longer than the grace period,
//! the oldest entry is dropped to admit the new one, and drops are counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::entry::AuditEntry;
use crate::error::Result;

const BATCH_SIZE: usize = 64;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Storage side of the audit pipeline
#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn append_batch(&self, entries: &[AuditEntry]) -> Result<()>;
}

struct Queue {
    entries: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    grace: Duration,
    dropped: AtomicU64,
}

struct QueueState {
    deque: VecDeque<AuditEntry>,
    /// When the queue first hit capacity; cleared when it drains below
    full_since: Option<Instant>,
}

impl Queue {
    /// Enqueue, applying the drop-oldest policy past the grace period.
    /// Returns false when the entry could not be queued yet (still within
    /// the grace period).
    fn push(&self, entry: AuditEntry) -> bool {
        let mut state = self.entries.lock().expect("audit queue poisoned");

        if state.deque.len() < self.capacity {
            state.full_since = None;
            state.deque.push_back(entry);
            drop(state);
            self.notify.notify_one();
            return true;
        }

        match state.full_since {
            Some(since) if since.elapsed() >= self.grace => {
                state.deque.pop_front();
                state.deque.push_back(entry);
                drop(state);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
                tracing::warn!("audit queue saturated past grace, oldest entry dropped");
                true
            }
            Some(_) => false,
            None => {
                state.full_since = Some(Instant::now());
                false
            }
        }
    }

    fn drain_batch(&self) -> Vec<AuditEntry> {
        let mut state = self.entries.lock().expect("audit queue poisoned");
        let take = state.deque.len().min(BATCH_SIZE);
        let batch: Vec<AuditEntry> = state.deque.drain(..take).collect();
        if state.deque.len() < self.capacity {
            state.full_since = None;
        }
        batch
    }
}

/// Handle for emitting audit entries
#[derive(Clone)]
pub struct AuditLogger {
    queue: Arc<Queue>,
    enabled: bool,
}

impl AuditLogger {
    /// Spawn the drainer and return the emitting handle
    pub fn spawn(writer: Arc<dyn AuditWriter>, capacity: usize, grace: Duration) -> Self {
        let queue = Arc::new(Queue {
            entries: Mutex::new(QueueState {
                deque: VecDeque::with_capacity(capacity),
                full_since: None,
            }),
            notify: Notify::new(),
            capacity,
            grace,
            dropped: AtomicU64::new(0),
        });

        tokio::spawn(drain(queue.clone(), writer));

        Self {
            queue,
            enabled: true,
        }
    }

    /// A logger that discards everything (tests, audit disabled)
    pub fn disabled() -> Self {
        Self {
            queue: Arc::new(Queue {
                entries: Mutex::new(QueueState {
                    deque: VecDeque::new(),
                    full_since: None,
                }),
                notify: Notify::new(),
                capacity: 0,
                grace: Duration::ZERO,
                dropped: AtomicU64::new(0),
            }),
            enabled: false,
        }
    }

    /// Emit an entry without blocking the caller.
    ///
    /// During the grace period a saturated queue retries once in the
    /// background; past it, the oldest queued entry makes room.
    pub fn record(&self, entry: AuditEntry) {
        if !self.enabled {
            return;
        }
        if !self.queue.push(entry.clone()) {
            let queue = self.queue.clone();
            let grace = queue.grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                queue.push(entry);
            });
        }
    }

    /// Entries dropped so far (surfaced in metrics)
    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

async fn drain(queue: Arc<Queue>, writer: Arc<dyn AuditWriter>) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = queue.notify.notified() => {}
            _ = ticker.tick() => {}
        }

        loop {
            let batch = queue.drain_batch();
            if batch.is_empty() {
                break;
            }
            if let Err(e) = writer.append_batch(&batch).await {
                tracing::error!(count = batch.len(), error = %e, "failed to persist audit batch");
            }
        }
    }
}

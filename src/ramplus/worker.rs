//! Per-worker queue and wake-up state.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::ramplus::request::RequestBatch;

/// The four background workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Restores written-back slots co-located with a cold read.
    Prefetch,
    /// Evicts cold resident slots while usage is above the LRU limit.
    LruWriteback,
    /// Writes back slots queued by the manual trigger.
    Writeback,
    /// Keeps backing chunks reserved ahead of demand.
    Pool,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 4] = [
        WorkerKind::Prefetch,
        WorkerKind::LruWriteback,
        WorkerKind::Writeback,
        WorkerKind::Pool,
    ];
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Prefetch => write!(f, "prefetch"),
            WorkerKind::LruWriteback => write!(f, "lru-writeback"),
            WorkerKind::Writeback => write!(f, "writeback"),
            WorkerKind::Pool => write!(f, "pool"),
        }
    }
}

/// Pending batches and the wake condition of one worker.
pub struct WorkerState {
    kind: WorkerKind,
    queue: Mutex<VecDeque<RequestBatch>>,
    /// Slot indices across all queued batches.
    pending: AtomicUsize,
    notify: Notify,
    running: AtomicBool,
}

impl WorkerState {
    pub fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            queue: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            notify: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Queue a batch and wake the worker.
    pub fn push(&self, batch: RequestBatch) {
        if batch.is_empty() {
            return;
        }
        self.pending.fetch_add(batch.len(), Ordering::Relaxed);
        self.queue.lock().push_back(batch);
        self.notify.notify_one();
    }

    /// Wake the worker without queueing anything.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Pop up to `limit` batches.
    pub fn pop_frame(&self, limit: usize) -> Vec<RequestBatch> {
        let mut queue = self.queue.lock();
        let n = limit.min(queue.len());
        let frame: Vec<_> = queue.drain(..n).collect();
        let indices: usize = frame.iter().map(RequestBatch::len).sum();
        self.pending.fetch_sub(indices, Ordering::Relaxed);
        frame
    }

    /// Slot indices waiting in the queue.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        let dropped: Vec<_> = self.queue.lock().drain(..).collect();
        if !dropped.is_empty() {
            debug!(worker = %self.kind, batches = dropped.len(), "Dropped queued batches");
        }
        self.pending.store(0, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Worker states of one device, shared by the device and the tasks.
pub struct RamplusQueues {
    prefetch: WorkerState,
    lru: WorkerState,
    writeback: WorkerState,
    pool: WorkerState,
}

impl Default for RamplusQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl RamplusQueues {
    pub fn new() -> Self {
        Self {
            prefetch: WorkerState::new(WorkerKind::Prefetch),
            lru: WorkerState::new(WorkerKind::LruWriteback),
            writeback: WorkerState::new(WorkerKind::Writeback),
            pool: WorkerState::new(WorkerKind::Pool),
        }
    }

    pub fn get(&self, kind: WorkerKind) -> &WorkerState {
        match kind {
            WorkerKind::Prefetch => &self.prefetch,
            WorkerKind::LruWriteback => &self.lru,
            WorkerKind::Writeback => &self.writeback,
            WorkerKind::Pool => &self.pool,
        }
    }

    /// Queue a batch for a worker; a no-op if the worker is not running.
    pub fn push(&self, kind: WorkerKind, batch: RequestBatch) {
        let state = self.get(kind);
        if state.is_running() {
            state.push(batch);
        }
    }

    pub fn wake(&self, kind: WorkerKind) {
        self.get(kind).wake();
    }
}

//! Ramplus: the background workers that move pages between memory and the
//! backing store.
//!
//! - [`request`]: bounded batches of slot indices and their origin
//! - [`worker`]: per-worker queues, wake-ups and running flags
//!
//! Each worker is a tokio task that sleeps until woken or until its interval
//! elapses, pops up to `frame_limit` queued batches and hands them to a
//! [`RamplusHandler`]. Shutdown clears the running flag, wakes the task and
//! awaits it, so a batch in flight always completes.

pub mod request;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RamplusConfig;
use request::RequestBatch;
use worker::{RamplusQueues, WorkerKind};

/// What the workers do with a popped frame. Called with an empty frame on
/// a periodic wake-up.
#[async_trait]
pub trait RamplusHandler: Send + Sync + 'static {
    async fn handle(&self, kind: WorkerKind, batches: Vec<RequestBatch>);
}

/// Running worker tasks of one device.
pub struct Ramplus {
    queues: Arc<RamplusQueues>,
    handles: Vec<(WorkerKind, JoinHandle<()>)>,
}

impl Ramplus {
    /// Spawn all four workers.
    pub fn start(
        queues: Arc<RamplusQueues>,
        config: &RamplusConfig,
        handler: Arc<dyn RamplusHandler>,
    ) -> Self {
        let handles = WorkerKind::ALL
            .into_iter()
            .map(|kind| {
                let interval = match kind {
                    WorkerKind::Prefetch => config.prefetch_interval(),
                    WorkerKind::LruWriteback => config.lru_interval(),
                    WorkerKind::Writeback => config.writeback_interval(),
                    WorkerKind::Pool => config.pool_interval(),
                };
                queues.get(kind).set_running(true);
                let handle = tokio::spawn(worker_loop(
                    queues.clone(),
                    kind,
                    interval,
                    config.frame_limit,
                    handler.clone(),
                ));
                (kind, handle)
            })
            .collect();

        info!(frame_limit = config.frame_limit, "Ramplus workers started");
        Self { queues, handles }
    }

    /// Stop every worker and wait for it to finish its current batch.
    pub async fn shutdown(self) {
        for (kind, _) in &self.handles {
            let state = self.queues.get(*kind);
            state.set_running(false);
            state.wake();
        }
        for (kind, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(worker = %kind, error = %e, "Worker task ended abnormally");
            }
            self.queues.get(kind).clear();
        }
        info!("Ramplus workers stopped");
    }
}

async fn worker_loop(
    queues: Arc<RamplusQueues>,
    kind: WorkerKind,
    interval: Duration,
    frame_limit: usize,
    handler: Arc<dyn RamplusHandler>,
) {
    let state = queues.get(kind);
    debug!(worker = %kind, interval_ms = interval.as_millis() as u64, "Worker running");

    while state.is_running() {
        tokio::select! {
            _ = state.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        if !state.is_running() {
            break;
        }

        let batches = state.pop_frame(frame_limit);
        let nr_batches = batches.len();
        let nr_indices: usize = batches.iter().map(RequestBatch::len).sum();
        handler.handle(kind, batches).await;

        if nr_batches > 0 {
            debug!(
                worker = %kind,
                batches = nr_batches,
                indices = nr_indices,
                pending = state.pending(),
                "Worker frame done"
            );
        }
        // Leftover work is picked up without waiting for the next interval.
        if state.pending() > 0 {
            state.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use request::{RequestOrigin, WritebackMode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        indices: AtomicUsize,
    }

    #[async_trait]
    impl RamplusHandler for Counting {
        async fn handle(&self, kind: WorkerKind, batches: Vec<RequestBatch>) {
            if kind == WorkerKind::Writeback {
                let n: usize = batches.iter().map(RequestBatch::len).sum();
                self.indices.fetch_add(n, Ordering::SeqCst);
            }
        }
    }

    fn fast_config() -> RamplusConfig {
        RamplusConfig {
            prefetch_interval_ms: 20,
            lru_interval_ms: 20,
            writeback_interval_ms: 20,
            pool_interval_ms: 20,
            frame_limit: 1,
            ..RamplusConfig::default()
        }
    }

    #[tokio::test]
    async fn test_workers_drain_queued_batches() {
        let queues = Arc::new(RamplusQueues::new());
        let handler = Arc::new(Counting::default());
        let ramplus = Ramplus::start(queues.clone(), &fast_config(), handler.clone());

        for batch in RequestBatch::split(RequestOrigin::Manual(WritebackMode::All), 0..5000) {
            queues.push(WorkerKind::Writeback, batch);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handler.indices.load(Ordering::SeqCst) < 5000 {
            assert!(tokio::time::Instant::now() < deadline, "workers stalled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        ramplus.shutdown().await;
        assert!(!queues.get(WorkerKind::Writeback).is_running());
        assert_eq!(handler.indices.load(Ordering::SeqCst), 5000);
    }

    #[tokio::test]
    async fn test_shutdown_is_prompt() {
        let queues = Arc::new(RamplusQueues::new());
        let config = RamplusConfig {
            prefetch_interval_ms: 60_000,
            lru_interval_ms: 60_000,
            writeback_interval_ms: 60_000,
            pool_interval_ms: 60_000,
            ..RamplusConfig::default()
        };
        let ramplus = Ramplus::start(queues.clone(), &config, Arc::new(Counting::default()));
        tokio::time::timeout(Duration::from_secs(2), ramplus.shutdown())
            .await
            .unwrap();
        // Pushing after shutdown is dropped.
        queues.push(WorkerKind::Prefetch, RequestBatch::split(RequestOrigin::ColdRead, [1]).remove(0));
        assert_eq!(queues.get(WorkerKind::Prefetch).pending(), 0);
    }
}

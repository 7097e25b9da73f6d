//! The compressed block device.
//!
//! - [`engine`]: slot table plus the read, write and free paths
//! - [`writeback`]: moving resident slots to the backing store
//! - [`prefetch`]: restoring written-back slots
//! - [`limits`]: memory and writeback limits
//!
//! [`Zram`] guards the per-device [`engine::Core`] with an init lock: request
//! servicing shares it, structural changes (disk size, compressor, backing
//! store, reset) take it exclusively.

mod engine;
mod error;
mod limits;
mod prefetch;
mod writeback;

pub use engine::{SlotReport, SlotSnapshot};
pub use error::{Result, ZramError};
pub use limits::{Limits, LimitsSnapshot};
pub use writeback::WritebackSummary;
pub use crate::ramplus::request::WritebackMode;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use engine::Core;
use crate::backing::store::{BackingStore, FileBackingStore};
use crate::backing::Backing;
use crate::config::Config;
use crate::ramplus::request::{RequestBatch, RequestOrigin};
use crate::ramplus::worker::{RamplusQueues, WorkerKind};
use crate::ramplus::{Ramplus, RamplusHandler};
use crate::stats::{StatsSnapshot, ZramStats};
use crate::table::compressor::{compressor_by_name, BACKENDS};
use crate::PAGE_SIZE;

/// State guarded by the init lock.
struct DeviceState {
    compressor: String,
    backing: Option<Arc<Backing>>,
    core: Option<Arc<Core>>,
    ramplus: Option<Ramplus>,
}

/// Summary of the device configuration.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub initialized: bool,
    pub disksize: u64,
    pub nr_pages: u32,
    pub compressor: String,
    pub logical_block_size: usize,
    pub backing: Option<String>,
    pub backing_blocks: u32,
    pub openers: usize,
}

/// A compressed RAM block device with backing-store writeback.
pub struct Zram {
    config: Config,
    state: RwLock<DeviceState>,
    stats: Arc<ZramStats>,
    limits: Arc<Limits>,
    queues: Arc<RamplusQueues>,
    openers: AtomicUsize,
}

impl Zram {
    /// An uninitialised device. Disk size and backing store from `config`
    /// are not applied; see [`Zram::from_config`].
    pub fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ZramError::InvalidConfig(e.to_string()))?;
        if !BACKENDS.contains(&config.device.compressor.as_str()) {
            return Err(ZramError::InvalidConfig(format!(
                "unknown compressor {}",
                config.device.compressor
            )));
        }

        Ok(Self {
            state: RwLock::new(DeviceState {
                compressor: config.device.compressor.clone(),
                backing: None,
                core: None,
                ramplus: None,
            }),
            stats: Arc::new(ZramStats::default()),
            limits: Arc::new(Limits::from_config(&config)),
            queues: Arc::new(RamplusQueues::new()),
            openers: AtomicUsize::new(0),
            config,
        })
    }

    /// A device set up as `config` describes: backing file attached and
    /// disk size applied when configured.
    pub async fn from_config(config: Config) -> Result<Self> {
        let zram = Self::new(config)?;
        if let Some(path) = zram.config.writeback.backing_path.clone() {
            zram.attach_backing_file(&path, zram.config.writeback.backing_blocks)
                .await?;
        }
        if zram.config.device.disksize > 0 {
            zram.set_disksize(zram.config.device.disksize).await?;
        }
        Ok(zram)
    }

    // ─── Configuration ────────────────────────────────────────────────────

    /// Size the device and start its workers. Rounded up to whole pages.
    pub async fn set_disksize(&self, bytes: u64) -> Result<u64> {
        let mut state = self.state.write().await;
        if state.core.is_some() {
            return Err(ZramError::ConfigurationConflict("device already initialised"));
        }
        let nr_pages = bytes.div_ceil(PAGE_SIZE as u64);
        if nr_pages == 0 || nr_pages > u32::MAX as u64 {
            return Err(ZramError::InvalidConfig(format!("disksize {bytes} out of range")));
        }

        let comp = compressor_by_name(&state.compressor, &self.config.compression)?;
        let core = Arc::new(Core::new(
            nr_pages as u32,
            &self.config,
            comp,
            state.backing.clone(),
            self.stats.clone(),
            self.limits.clone(),
            self.queues.clone(),
        ));

        if state.backing.is_some() {
            let handler: Arc<dyn RamplusHandler> = core.clone();
            state.ramplus = Some(Ramplus::start(
                self.queues.clone(),
                &self.config.ramplus,
                handler,
            ));
            self.queues.wake(WorkerKind::Pool);
        }
        state.core = Some(core);

        let disksize = nr_pages * PAGE_SIZE as u64;
        info!(
            disksize,
            nr_pages,
            compressor = %state.compressor,
            backing = state.backing.is_some(),
            "Device initialised"
        );
        Ok(disksize)
    }

    /// Choose the compression backend. Only before initialisation.
    pub async fn set_compressor(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.core.is_some() {
            return Err(ZramError::ConfigurationConflict("device already initialised"));
        }
        if !BACKENDS.contains(&name) {
            return Err(ZramError::InvalidConfig(format!("unknown compressor {name}")));
        }
        state.compressor = name.to_string();
        info!(compressor = name, "Compressor selected");
        Ok(())
    }

    /// Attach a backing store. Only before initialisation.
    pub async fn attach_backing(&self, store: Arc<dyn BackingStore>) -> Result<()> {
        let mut state = self.state.write().await;
        if state.core.is_some() {
            return Err(ZramError::ConfigurationConflict("device already initialised"));
        }
        if self.is_claimed() {
            return Err(ZramError::ConfigurationConflict("device is claimed"));
        }
        info!(store = %store.describe(), blocks = store.nr_blocks(), "Backing store attached");
        state.backing = Some(Arc::new(Backing::new(store)));
        Ok(())
    }

    /// Open (creating if needed) a backing file of `nr_blocks` blocks and
    /// attach it.
    pub async fn attach_backing_file(&self, path: &Path, nr_blocks: u32) -> Result<()> {
        let store = FileBackingStore::open(path, nr_blocks).await?;
        self.attach_backing(Arc::new(store)).await
    }

    pub async fn detach_backing(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.core.is_some() {
            return Err(ZramError::ConfigurationConflict("device already initialised"));
        }
        if self.is_claimed() {
            return Err(ZramError::ConfigurationConflict("device is claimed"));
        }
        if state.backing.take().is_none() {
            return Err(ZramError::NoBackingStore);
        }
        info!("Backing store detached");
        Ok(())
    }

    pub fn set_mem_limit(&self, bytes: u64) {
        self.limits.set_mem_limit(bytes);
        self.queues.wake(WorkerKind::LruWriteback);
        info!(bytes, "Memory limit set");
    }

    pub fn set_lru_limit(&self, bytes: u64) {
        self.limits.set_lru_limit(bytes);
        self.queues.wake(WorkerKind::LruWriteback);
        info!(bytes, "LRU limit set");
    }

    /// Bytes writeback may still write; `None` lifts the limit.
    pub fn set_wb_limit(&self, bytes: Option<u64>) {
        self.limits.set_wb_limit(bytes);
        info!(?bytes, "Writeback limit set");
    }

    // ─── Maintenance ──────────────────────────────────────────────────────

    /// Mark stored slots idle, optionally only those untouched for `cutoff`.
    pub async fn mark_idle(&self, cutoff: Option<Duration>) -> Result<usize> {
        let state = self.state.read().await;
        let marked = Self::core(&state)?.mark_idle(cutoff);
        info!(marked, cutoff_secs = cutoff.map(|c| c.as_secs()), "Marked slots idle");
        Ok(marked)
    }

    /// Write back every slot `mode` picks and wait for completion.
    pub async fn writeback(&self, mode: WritebackMode) -> Result<WritebackSummary> {
        let state = self.state.read().await;
        Self::core(&state)?.writeback(mode).await
    }

    /// Queue the slots `mode` picks to the writeback worker. Returns how
    /// many slots were queued.
    pub async fn trigger_writeback(&self, mode: WritebackMode) -> Result<usize> {
        let state = self.state.read().await;
        let core = Self::core(&state)?;
        if state.ramplus.is_none() {
            return Err(ZramError::NoBackingStore);
        }
        let candidates = core.writeback_candidates(mode)?;
        let queued = candidates.len();
        for batch in RequestBatch::split(RequestOrigin::Manual(mode), candidates) {
            self.queues.push(WorkerKind::Writeback, batch);
        }
        debug!(mode = %mode, queued, "Writeback queued");
        Ok(queued)
    }

    /// Drop every slot and stop the workers. The compressor choice, limits
    /// and backing store stay; the backing allocator starts empty.
    pub async fn reset(&self) -> Result<()> {
        if self.is_claimed() {
            return Err(ZramError::ConfigurationConflict("device is claimed"));
        }
        let mut state = self.state.write().await;
        if let Some(ramplus) = state.ramplus.take() {
            ramplus.shutdown().await;
        }
        state.core = None;
        if let Some(backing) = state.backing.take() {
            state.backing = Some(Arc::new(Backing::new(backing.store_handle())));
        }
        self.stats.reset();
        info!("Device reset");
        Ok(())
    }

    /// Claim the device. Structural changes are refused while claimed.
    pub fn open(&self) -> usize {
        self.openers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn release(&self) -> usize {
        let prev = self
            .openers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    fn is_claimed(&self) -> bool {
        self.openers.load(Ordering::SeqCst) > 0
    }

    // ─── Block I/O ────────────────────────────────────────────────────────

    fn core(state: &DeviceState) -> Result<&Arc<Core>> {
        state
            .core
            .as_ref()
            .ok_or(ZramError::ConfigurationConflict("device not initialised"))
    }

    /// Read `buf.len()` bytes at `offset` within page `index`.
    pub async fn read(&self, index: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let state = self.state.read().await;
        Self::core(&state)?.read(index, offset, buf).await
    }

    /// Write `data` at `offset` within page `index`.
    pub async fn write(&self, index: u32, offset: usize, data: &[u8]) -> Result<()> {
        let state = self.state.read().await;
        Self::core(&state)?.write(index, offset, data).await
    }

    /// Free the whole pages inside a byte range. Returns the pages covered.
    pub async fn discard(&self, pos: u64, len: u64) -> Result<u64> {
        let state = self.state.read().await;
        Self::core(&state)?.discard(pos, len)
    }

    /// Free hint for one page. Returns false on a miss.
    pub async fn notify_free(&self, index: u32) -> Result<bool> {
        let state = self.state.read().await;
        Self::core(&state)?.notify_free(index)
    }

    // ─── Introspection ────────────────────────────────────────────────────

    pub async fn slot(&self, index: u32) -> Result<SlotSnapshot> {
        let state = self.state.read().await;
        Self::core(&state)?.snapshot_slot(index)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn limits(&self) -> LimitsSnapshot {
        self.limits.snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.core.is_some()
    }

    pub async fn info(&self) -> DeviceInfo {
        let state = self.state.read().await;
        let core = state.core.as_ref();
        DeviceInfo {
            initialized: core.is_some(),
            disksize: core.map_or(0, |c| c.disksize()),
            nr_pages: core.map_or(0, |c| c.nr_pages()),
            compressor: state.compressor.clone(),
            logical_block_size: self.config.device.logical_block_size,
            backing: state.backing.as_ref().map(|b| b.describe()),
            backing_blocks: state.backing.as_ref().map_or(0, |b| b.nr_blocks()),
            openers: self.openers.load(Ordering::SeqCst),
        }
    }
}

impl Drop for Zram {
    fn drop(&mut self) {
        // Let detached worker tasks run out instead of outliving the device.
        for kind in WorkerKind::ALL {
            let worker = self.queues.get(kind);
            worker.set_running(false);
            worker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::store::MemBackingStore;

    fn text_page(seed: u8) -> Vec<u8> {
        (0..PAGE_SIZE).map(|i| b'a' + ((i / 128) as u8 ^ seed) % 26).collect()
    }

    #[tokio::test]
    async fn test_uninitialised_device_refuses_io() {
        let zram = Zram::new(Config::default()).unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            zram.read(0, 0, &mut buf).await,
            Err(ZramError::ConfigurationConflict(_))
        ));
        assert!(!zram.is_initialized().await);
    }

    #[tokio::test]
    async fn test_structural_changes_after_init_conflict() {
        let zram = Zram::new(Config::default()).unwrap();
        assert_eq!(zram.set_disksize(10_000).await.unwrap(), 3 * PAGE_SIZE as u64);
        assert!(matches!(
            zram.set_disksize(PAGE_SIZE as u64).await,
            Err(ZramError::ConfigurationConflict(_))
        ));
        assert!(matches!(
            zram.set_compressor("raw").await,
            Err(ZramError::ConfigurationConflict(_))
        ));
        assert!(matches!(
            zram.attach_backing(Arc::new(MemBackingStore::new(64))).await,
            Err(ZramError::ConfigurationConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_refused_while_claimed() {
        let zram = Zram::new(Config::default()).unwrap();
        zram.set_disksize(4 * PAGE_SIZE as u64).await.unwrap();
        zram.write(0, 0, &text_page(1)).await.unwrap();

        assert_eq!(zram.open(), 1);
        assert!(matches!(zram.reset().await, Err(ZramError::ConfigurationConflict(_))));
        assert_eq!(zram.release(), 0);

        zram.reset().await.unwrap();
        assert!(!zram.is_initialized().await);
        assert_eq!(zram.stats().pages_stored, 0);

        // Compressor choice survives; the device can be sized again.
        zram.set_disksize(PAGE_SIZE as u64).await.unwrap();
        assert_eq!(zram.info().await.compressor, "zstd");
    }

    #[tokio::test]
    async fn test_trigger_writeback_needs_backing() {
        let zram = Zram::new(Config::default()).unwrap();
        zram.set_disksize(4 * PAGE_SIZE as u64).await.unwrap();
        assert!(matches!(
            zram.trigger_writeback(WritebackMode::All).await,
            Err(ZramError::NoBackingStore)
        ));
        assert!(matches!(
            zram.writeback(WritebackMode::All).await,
            Err(ZramError::NoBackingStore)
        ));
    }

    #[tokio::test]
    async fn test_unknown_compressor_rejected() {
        let zram = Zram::new(Config::default()).unwrap();
        assert!(matches!(
            zram.set_compressor("lz4").await,
            Err(ZramError::InvalidConfig(_))
        ));
        zram.set_compressor("raw").await.unwrap();
        assert_eq!(zram.info().await.compressor, "raw");
    }
}

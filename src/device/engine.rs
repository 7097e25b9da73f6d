//! Device core: the slot table and the paths that move a page between its
//! representations.
//!
//! A slot lock is always taken before the LRU, pool or bitmap locks, and no
//! lock is held across an await. Counters change under the slot lock so a
//! slot's decrement can never overtake its increment.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::trace;

use crate::backing::Backing;
use crate::config::Config;
use crate::device::error::{Result, ZramError};
use crate::device::limits::Limits;
use crate::device::prefetch::{BlockFetch, Location};
use crate::ramplus::worker::{RamplusQueues, WorkerKind};
use crate::stats::ZramStats;
use crate::table::compressor::{fill_element, same_element, PageCompressor};
use crate::table::lru::LruList;
use crate::table::slot::{SlotFlags, SlotGuard, SlotState, SlotTable};
use crate::table::zpool::{HeapPool, ObjectStore};
use crate::PAGE_SIZE;

/// Copy of one slot's state, without the lock bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub state: SlotState,
    pub flags: SlotFlags,
}

impl SlotSnapshot {
    pub fn has(&self, flag: SlotFlags) -> bool {
        self.flags.contains(flag)
    }
}

/// JSON-friendly description of a slot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct SlotReport {
    pub index: u32,
    pub state: &'static str,
    pub size: u32,
    pub flags: String,
}

impl SlotReport {
    pub fn new(index: u32, slot: SlotSnapshot) -> Self {
        let (state, size) = match slot.state {
            SlotState::Empty => ("empty", 0),
            SlotState::Same { .. } => ("same", 0),
            SlotState::Resident { size, .. } => ("resident", size),
            SlotState::WrittenBack { size, .. } => ("written_back", size as u32),
        };
        Self {
            index,
            state,
            size,
            flags: format!("{:?}", slot.flags),
        }
    }
}

enum ReadStep<'a> {
    Zero,
    Fill(u64),
    Decode(Vec<u8>),
    Wait,
    Fetch(BlockFetch<'a>),
}

/// Per-device state that exists between `set_disksize` and `reset`.
pub(crate) struct Core {
    pub(crate) table: SlotTable,
    pub(crate) lru: Mutex<LruList>,
    pub(crate) pool: Arc<dyn ObjectStore>,
    pub(crate) comp: Arc<dyn PageCompressor>,
    pub(crate) backing: Option<Arc<Backing>>,
    pub(crate) stats: Arc<ZramStats>,
    pub(crate) limits: Arc<Limits>,
    pub(crate) queues: Arc<RamplusQueues>,
    /// Signalled whenever a backing block read completes.
    pub(crate) read_done: Notify,
    pub(crate) huge_threshold: usize,
    pub(crate) logical_block_size: usize,
    pub(crate) lru_batch_pages: usize,
    pub(crate) pool_min_chunks: usize,
    pub(crate) pool_max_chunks: usize,
}

impl Core {
    pub(crate) fn new(
        nr_pages: u32,
        config: &Config,
        comp: Arc<dyn PageCompressor>,
        backing: Option<Arc<Backing>>,
        stats: Arc<ZramStats>,
        limits: Arc<Limits>,
        queues: Arc<RamplusQueues>,
    ) -> Self {
        Self {
            table: SlotTable::new(nr_pages),
            lru: Mutex::new(LruList::new(nr_pages)),
            pool: Arc::new(HeapPool::new(config.device.pool_capacity)),
            comp,
            backing,
            stats,
            limits,
            queues,
            read_done: Notify::new(),
            huge_threshold: config.device.huge_threshold,
            logical_block_size: config.device.logical_block_size,
            lru_batch_pages: config.writeback.lru_batch_pages.max(1),
            pool_min_chunks: config.ramplus.pool_min_chunks,
            pool_max_chunks: config.ramplus.pool_max_chunks,
        }
    }

    pub(crate) fn nr_pages(&self) -> u32 {
        self.table.len()
    }

    pub(crate) fn disksize(&self) -> u64 {
        self.nr_pages() as u64 * PAGE_SIZE as u64
    }

    pub(crate) fn backing(&self) -> Result<&Arc<Backing>> {
        self.backing.as_ref().ok_or(ZramError::NoBackingStore)
    }

    fn invalid_io(&self, reason: String) -> ZramError {
        ZramStats::inc(&self.stats.invalid_io);
        ZramError::InvalidIo(reason)
    }

    pub(crate) fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.nr_pages() {
            return Err(self.invalid_io(format!(
                "page {index} beyond device of {} pages",
                self.nr_pages()
            )));
        }
        Ok(())
    }

    /// Requests address one page: `offset` and `len` are multiples of the
    /// logical block size and stay inside the page.
    pub(crate) fn check_io(&self, index: u32, offset: usize, len: usize) -> Result<()> {
        self.check_index(index)?;
        let lbs = self.logical_block_size;
        let inside = offset.checked_add(len).is_some_and(|end| end <= PAGE_SIZE);
        if len == 0 || offset % lbs != 0 || len % lbs != 0 || !inside {
            return Err(self.invalid_io(format!(
                "offset {offset} length {len} not aligned to {lbs} within a page"
            )));
        }
        Ok(())
    }

    // ─── LRU bookkeeping ──────────────────────────────────────────────────

    pub(crate) fn lru_touch(&self, index: u32) {
        let mut lru = self.lru.lock();
        lru.touch(index);
        self.stats.lru_pages.store(lru.len() as u64, Ordering::Relaxed);
    }

    pub(crate) fn lru_push_cold(&self, index: u32) {
        let mut lru = self.lru.lock();
        lru.push_cold(index);
        self.stats.lru_pages.store(lru.len() as u64, Ordering::Relaxed);
    }

    pub(crate) fn lru_remove(&self, index: u32) {
        let mut lru = self.lru.lock();
        lru.remove(index);
        self.stats.lru_pages.store(lru.len() as u64, Ordering::Relaxed);
    }

    /// Whether resident usage is above the LRU limit.
    pub(crate) fn over_lru_target(&self) -> bool {
        let target = self.limits.lru_target();
        target != 0 && self.pool.total_bytes() > target
    }

    // ─── Slot release ─────────────────────────────────────────────────────

    /// Release whatever the slot holds and leave it empty.
    pub(crate) fn free_locked(&self, slot: &mut SlotGuard<'_>) {
        let flags = slot.flags();
        let state = slot.state;
        match state {
            SlotState::Empty => {}
            SlotState::Same { .. } => {
                ZramStats::sub(&self.stats.same_pages, 1);
                ZramStats::sub(&self.stats.pages_stored, 1);
            }
            SlotState::Resident { handle, size } => {
                self.pool.free(handle);
                ZramStats::sub(&self.stats.compr_data_size, size as u64);
                ZramStats::sub(&self.stats.pages_stored, 1);
                if flags.contains(SlotFlags::HUGE) {
                    ZramStats::sub(&self.stats.huge_pages, 1);
                }
                if flags.contains(SlotFlags::LRU_TRACKED) {
                    self.lru_remove(slot.index());
                }
            }
            SlotState::WrittenBack { block, size, .. } => {
                ZramStats::sub(&self.stats.bd_objcnt, 1);
                ZramStats::sub(&self.stats.bd_size, size as u64);
                if let Some(backing) = &self.backing {
                    if backing.bitmap().put_object(block) {
                        ZramStats::sub(&self.stats.bd_count, 1);
                    }
                }
            }
        }
        slot.state = SlotState::Empty;
        slot.last_access = None;
        slot.clear_all();
    }

    /// Free a slot unconditionally. Returns false if it was already empty.
    pub(crate) fn free_slot(&self, index: u32) -> bool {
        let mut slot = self.table.lock(index);
        let was_empty = slot.state.is_empty();
        self.free_locked(&mut slot);
        !was_empty
    }

    /// Free hint from the host. A busy or empty slot is a counted miss.
    pub(crate) fn notify_free(&self, index: u32) -> Result<bool> {
        self.check_index(index)?;
        ZramStats::inc(&self.stats.notify_free);
        let Some(mut slot) = self.table.try_lock(index) else {
            ZramStats::inc(&self.stats.miss_free);
            return Ok(false);
        };
        if slot.state.is_empty() {
            ZramStats::inc(&self.stats.miss_free);
            return Ok(false);
        }
        self.free_locked(&mut slot);
        Ok(true)
    }

    /// Free every whole page inside a byte range. Returns the pages covered.
    pub(crate) fn discard(&self, pos: u64, len: u64) -> Result<u64> {
        let lbs = self.logical_block_size as u64;
        let end = pos.checked_add(len).filter(|&end| end <= self.disksize());
        let Some(end) = end.filter(|_| len != 0 && pos % lbs == 0 && len % lbs == 0) else {
            return Err(self.invalid_io(format!("discard of {len} bytes at {pos}")));
        };

        let page = PAGE_SIZE as u64;
        let first = pos.div_ceil(page);
        let last = end / page;
        for index in first..last {
            ZramStats::inc(&self.stats.notify_free);
            self.free_slot(index as u32);
        }
        Ok(last.saturating_sub(first))
    }

    // ─── Write path ───────────────────────────────────────────────────────

    /// Store a whole page, replacing whatever the slot held.
    pub(crate) fn store_page(&self, index: u32, page: &[u8], partial: bool) -> Result<()> {
        let (state, huge) = match same_element(page) {
            Some(element) => (SlotState::Same { element }, false),
            None => {
                let compressed = self.comp.compress(page)?;
                let huge = compressed.len() >= self.huge_threshold;
                let payload: &[u8] = if huge { page } else { &compressed };

                let used = self.pool.total_bytes();
                let requested = payload.len() as u64;
                if self.limits.exceeds_mem(used, requested) {
                    ZramStats::inc(&self.stats.writestall);
                    self.queues.wake(WorkerKind::LruWriteback);
                    return Err(ZramError::OverLimit {
                        used,
                        requested,
                        limit: self.limits.mem_limit(),
                    });
                }

                let handle = self.pool.allocate(payload.len())?;
                if let Err(e) = self.pool.write(handle, payload) {
                    self.pool.free(handle);
                    return Err(e.into());
                }
                let size = payload.len() as u32;
                (SlotState::Resident { handle, size }, huge)
            }
        };

        {
            let mut slot = self.table.lock(index);
            self.free_locked(&mut slot);
            slot.state = state;
            slot.touch();
            if partial {
                slot.set(SlotFlags::PARTIAL_REPLACE);
            }
            ZramStats::inc(&self.stats.pages_stored);
            match state {
                SlotState::Same { .. } => ZramStats::inc(&self.stats.same_pages),
                SlotState::Resident { size, .. } => {
                    ZramStats::add(&self.stats.compr_data_size, size as u64);
                    if huge {
                        slot.set(SlotFlags::HUGE);
                        ZramStats::inc(&self.stats.huge_pages);
                        ZramStats::inc(&self.stats.huge_pages_since);
                    }
                    slot.set(SlotFlags::LRU_TRACKED);
                    self.lru_touch(index);
                }
                SlotState::Empty | SlotState::WrittenBack { .. } => {}
            }
        }

        self.stats.observe_used(self.pool.total_bytes());
        trace!(index, ?state, huge, partial, "Stored page");

        if state.is_resident() && self.over_lru_target() {
            self.queues.wake(WorkerKind::LruWriteback);
        }
        Ok(())
    }

    pub(crate) async fn write(&self, index: u32, offset: usize, data: &[u8]) -> Result<()> {
        self.check_io(index, offset, data.len())?;
        ZramStats::inc(&self.stats.num_writes);

        let result = if data.len() == PAGE_SIZE {
            self.store_page(index, data, false)
        } else {
            let mut page = vec![0u8; PAGE_SIZE];
            match self.read_page(index, &mut page).await {
                Ok(()) => {
                    page[offset..offset + data.len()].copy_from_slice(data);
                    self.store_page(index, &page, true)
                }
                Err(e) => Err(e),
            }
        };

        if result.is_err() {
            ZramStats::inc(&self.stats.failed_writes);
        }
        result
    }

    // ─── Read path ────────────────────────────────────────────────────────

    pub(crate) async fn read(&self, index: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_io(index, offset, buf.len())?;
        ZramStats::inc(&self.stats.num_reads);

        let result = if buf.len() == PAGE_SIZE {
            self.read_page(index, buf).await
        } else {
            let mut page = vec![0u8; PAGE_SIZE];
            let len = buf.len();
            self.read_page(index, &mut page)
                .await
                .map(|()| buf.copy_from_slice(&page[offset..offset + len]))
        };

        if result.is_err() {
            ZramStats::inc(&self.stats.failed_reads);
        }
        result
    }

    /// Expand a stored payload into a page.
    pub(crate) fn decode(&self, payload: &[u8], page: &mut [u8]) -> Result<()> {
        if payload.len() == PAGE_SIZE {
            page.copy_from_slice(payload);
        } else {
            self.comp.decompress(payload, page)?;
        }
        Ok(())
    }

    /// Read one whole page, restoring it from the backing store if needed.
    pub(crate) async fn read_page(&self, index: u32, page: &mut [u8]) -> Result<()> {
        loop {
            // Registered before the slot is inspected so a completion between
            // the check and the wait is not missed.
            let notified = self.read_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut slot = self.table.lock(index);
                let state = slot.state;
                match state {
                    SlotState::Empty => ReadStep::Zero,
                    SlotState::Same { element } => {
                        slot.touch();
                        ReadStep::Fill(element)
                    }
                    SlotState::Resident { handle, .. } => {
                        let payload = self.pool.read(handle)?;
                        slot.touch();
                        if slot.has(SlotFlags::LRU_TRACKED) {
                            self.lru_touch(index);
                        }
                        ReadStep::Decode(payload)
                    }
                    SlotState::WrittenBack {
                        block,
                        offset,
                        size,
                    } => {
                        let backing = self.backing()?;
                        if slot.has(SlotFlags::PREFETCHING) || !backing.bitmap().try_mark_read(block)
                        {
                            ReadStep::Wait
                        } else {
                            slot.set(SlotFlags::PREFETCHING);
                            let mut fetch = BlockFetch::new(self, backing, block);
                            fetch.push(
                                index,
                                Location {
                                    block,
                                    offset,
                                    size,
                                },
                            );
                            ReadStep::Fetch(fetch)
                        }
                    }
                }
            };

            match step {
                ReadStep::Zero => {
                    page.fill(0);
                    return Ok(());
                }
                ReadStep::Fill(element) => {
                    fill_element(page, element);
                    return Ok(());
                }
                ReadStep::Decode(payload) => return self.decode(&payload, page),
                ReadStep::Wait => notified.await,
                ReadStep::Fetch(fetch) => {
                    if self.restore_on_read(fetch, page).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    // ─── Idle tracking ────────────────────────────────────────────────────

    /// Mark in-memory slots idle. With a cutoff, only slots not accessed for
    /// at least that long are marked.
    pub(crate) fn mark_idle(&self, cutoff: Option<Duration>) -> usize {
        let now = Instant::now();
        let mut marked = 0;
        for index in 0..self.nr_pages() {
            let mut slot = self.table.lock(index);
            if slot.state.is_empty() || slot.state.is_written_back() {
                continue;
            }
            let old_enough = match (cutoff, slot.last_access) {
                (Some(cutoff), Some(at)) => now.duration_since(at) >= cutoff,
                _ => true,
            };
            if old_enough {
                slot.set(SlotFlags::IDLE);
                marked += 1;
            }
        }
        marked
    }

    pub(crate) fn snapshot_slot(&self, index: u32) -> Result<SlotSnapshot> {
        self.check_index(index)?;
        let slot = self.table.lock(index);
        Ok(SlotSnapshot {
            state: slot.state,
            flags: SlotFlags::from_bits(slot.flags().bits() & !SlotFlags::LOCKED.bits()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::compressor::ZstdCompressor;

    fn core(nr_pages: u32) -> Core {
        Core::new(
            nr_pages,
            &Config::default(),
            Arc::new(ZstdCompressor::new(1)),
            None,
            Arc::new(ZramStats::default()),
            Arc::new(Limits::default()),
            Arc::new(RamplusQueues::new()),
        )
    }

    fn pattern_page(seed: u8) -> Vec<u8> {
        (0..PAGE_SIZE).map(|i| (i % 37) as u8 ^ seed).collect()
    }

    #[tokio::test]
    async fn test_store_and_read_back() {
        let core = core(4);
        let page = pattern_page(3);
        core.write(1, 0, &page).await.unwrap();

        let slot = core.snapshot_slot(1).unwrap();
        assert!(slot.state.is_resident());
        assert!(slot.has(SlotFlags::LRU_TRACKED));
        assert!(!slot.has(SlotFlags::HUGE));

        let mut out = vec![0u8; PAGE_SIZE];
        core.read(1, 0, &mut out).await.unwrap();
        assert_eq!(out, page);

        // Untouched slots read as zeroes.
        core.read(2, 0, &mut out).await.unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_overwrite_releases_previous_state() {
        let core = core(2);
        core.write(0, 0, &pattern_page(1)).await.unwrap();
        core.write(0, 0, &[0u8; PAGE_SIZE]).await.unwrap();

        let stats = core.stats.snapshot();
        assert_eq!(stats.pages_stored, 1);
        assert_eq!(stats.same_pages, 1);
        assert_eq!(stats.compr_data_size, 0);
        assert_eq!(stats.lru_pages, 0);
        assert_eq!(core.pool.object_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_io_leaves_slots_alone() {
        let core = core(2);
        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(matches!(core.read(2, 0, &mut buf).await, Err(ZramError::InvalidIo(_))));
        assert!(matches!(core.write(0, 512, &buf[..512]).await, Err(ZramError::InvalidIo(_))));
        assert!(matches!(core.discard(1, 4096), Err(ZramError::InvalidIo(_))));
        assert_eq!(core.stats.snapshot().invalid_io, 3);
        assert_eq!(core.stats.snapshot().num_writes, 0);
        assert!(core.snapshot_slot(0).unwrap().state.is_empty());
    }

    #[tokio::test]
    async fn test_offset_near_usize_max_is_invalid() {
        let core = core(2);
        let mut buf = vec![0u8; PAGE_SIZE];
        let offset = usize::MAX - (PAGE_SIZE - 1);
        assert!(matches!(core.read(0, offset, &mut buf).await, Err(ZramError::InvalidIo(_))));
        assert!(matches!(core.write(0, offset, &buf).await, Err(ZramError::InvalidIo(_))));
        assert_eq!(core.stats.snapshot().invalid_io, 2);
        assert!(core.snapshot_slot(0).unwrap().state.is_empty());
    }

    #[tokio::test]
    async fn test_mark_idle_with_cutoff() {
        let core = core(3);
        core.write(0, 0, &pattern_page(1)).await.unwrap();
        core.write(1, 0, &[7u8; PAGE_SIZE]).await.unwrap();

        assert_eq!(core.mark_idle(Some(Duration::from_secs(3600))), 0);
        assert_eq!(core.mark_idle(None), 2);
        assert!(core.snapshot_slot(0).unwrap().has(SlotFlags::IDLE));

        // Access clears the mark.
        let mut out = vec![0u8; PAGE_SIZE];
        core.read(0, 0, &mut out).await.unwrap();
        assert!(!core.snapshot_slot(0).unwrap().has(SlotFlags::IDLE));
    }

    #[test]
    fn test_notify_free_counts_misses() {
        let core = core(2);
        assert!(!core.notify_free(0).unwrap());
        core.store_page(0, &pattern_page(9), false).unwrap();
        {
            let _busy = core.table.lock(0);
            assert!(!core.notify_free(0).unwrap());
        }
        assert!(core.notify_free(0).unwrap());

        let stats = core.stats.snapshot();
        assert_eq!(stats.notify_free, 3);
        assert_eq!(stats.miss_free, 2);
        assert_eq!(stats.pages_stored, 0);
    }
}

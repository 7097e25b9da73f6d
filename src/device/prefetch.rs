//! Restoring written-back slots.
//!
//! A foreground read of a written-back slot fetches its block, returns the
//! page and queues the block's other slots to the prefetch worker. The
//! worker groups queued slots by block and reads the blocks concurrently.
//!
//! While a block read is in flight the block is marked in the read-request
//! bitmap and every slot being restored from it carries `PREFETCHING`.
//! Both marks are cleared, and waiters woken, when the read is done with.

use std::collections::BTreeMap;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::backing::batcher::{header_at, parse_block};
use crate::backing::Backing;
use crate::device::engine::Core;
use crate::device::error::{Result, ZramError};
use crate::ramplus::request::{RequestBatch, RequestOrigin};
use crate::ramplus::worker::WorkerKind;
use crate::stats::ZramStats;
use crate::table::slot::{SlotFlags, SlotState};
use crate::table::zpool::Handle;
use crate::PAGE_SIZE;

/// Where a written-back payload lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Location {
    pub block: u32,
    pub offset: u16,
    pub size: u16,
}

impl Location {
    fn state(self) -> SlotState {
        SlotState::WrittenBack {
            block: self.block,
            offset: self.offset,
            size: self.size,
        }
    }
}

/// A block read in flight: the block's read-request bit and `PREFETCHING`
/// on each listed slot. Dropping it clears both and wakes waiters, so a
/// read abandoned mid-I/O cannot leave its slots marked.
pub(crate) struct BlockFetch<'a> {
    core: &'a Core,
    backing: &'a Backing,
    block: u32,
    entries: Vec<(u32, Location)>,
}

impl<'a> BlockFetch<'a> {
    /// Take over a block whose read-request bit the caller just set.
    pub(crate) fn new(core: &'a Core, backing: &'a Backing, block: u32) -> Self {
        Self {
            core,
            backing,
            block,
            entries: Vec::new(),
        }
    }

    /// Track a slot the caller just flagged `PREFETCHING`.
    pub(crate) fn push(&mut self, index: u32, loc: Location) {
        self.entries.push((index, loc));
    }
}

impl Drop for BlockFetch<'_> {
    fn drop(&mut self) {
        for &(index, loc) in &self.entries {
            let mut slot = self.core.table.lock(index);
            if slot.state == loc.state() {
                slot.clear(SlotFlags::PREFETCHING);
            }
        }
        self.backing.bitmap().clear_read(self.block);
        self.core.read_done.notify_waiters();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Restore {
    /// The slot is resident again.
    Committed,
    /// No room to re-admit the payload; the slot stays written back.
    Kept,
    /// The slot changed while its block was read.
    Raced,
}

impl Core {
    /// Read one backing block.
    async fn fetch_block(&self, backing: &Backing, block: u32) -> Result<Vec<u8>> {
        let mut data = vec![0u8; PAGE_SIZE];
        match backing.store().read_block(block, &mut data).await {
            Ok(()) => {
                ZramStats::inc(&self.stats.bd_reads);
                Ok(data)
            }
            Err(e) => {
                ZramStats::inc(&self.stats.prefetch_failures);
                warn!(block, error = %e, "Backing block read failed");
                Err(ZramError::PrefetchIoFailure {
                    index: u32::MAX,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Locate and verify one slot's payload inside a fetched block.
    fn extract<'a>(&self, data: &'a [u8], index: u32, loc: Location) -> Result<&'a [u8]> {
        let (offset, size) = (loc.offset as usize, loc.size as usize);
        let corrupt = |reason: &str| {
            ZramStats::inc(&self.stats.prefetch_failures);
            ZramError::PrefetchIoFailure {
                index,
                reason: format!("block {}: {reason}", loc.block),
            }
        };
        if size == 0 || offset + size > data.len() {
            return Err(corrupt("payload outside the block"));
        }
        if size < PAGE_SIZE {
            match header_at(data, offset) {
                Some(header) if header.index == index && header.size as usize == size => {}
                _ => return Err(corrupt("payload header mismatch")),
            }
        }
        Ok(&data[offset..offset + size])
    }

    /// Copy a payload into a fresh object, unless the memory limit forbids it.
    fn readmit(&self, payload: &[u8]) -> Option<Handle> {
        if self
            .limits
            .exceeds_mem(self.pool.total_bytes(), payload.len() as u64)
        {
            return None;
        }
        let handle = self.pool.allocate(payload.len()).ok()?;
        if self.pool.write(handle, payload).is_err() {
            self.pool.free(handle);
            return None;
        }
        Some(handle)
    }

    /// Turn a written-back slot resident again if it still points at `loc`.
    fn commit_restore(&self, backing: &Backing, index: u32, loc: Location, payload: &[u8]) -> Restore {
        let handle = self.readmit(payload);
        let outcome = {
            let mut slot = self.table.lock(index);
            if slot.state != loc.state() || !slot.has(SlotFlags::PREFETCHING) {
                Restore::Raced
            } else if let Some(handle) = handle {
                let size = payload.len() as u32;
                slot.state = SlotState::Resident { handle, size };
                slot.clear(SlotFlags::PREFETCHING | SlotFlags::EXPIRE);
                slot.touch();
                slot.set(SlotFlags::LRU_TRACKED);
                self.lru_touch(index);

                ZramStats::sub(&self.stats.bd_objcnt, 1);
                ZramStats::sub(&self.stats.bd_size, loc.size as u64);
                ZramStats::inc(&self.stats.bd_objreads);
                ZramStats::add(&self.stats.compr_data_size, size as u64);
                ZramStats::inc(&self.stats.pages_stored);
                if payload.len() == PAGE_SIZE {
                    slot.set(SlotFlags::HUGE);
                    ZramStats::inc(&self.stats.huge_pages);
                }
                if backing.bitmap().put_object(loc.block) {
                    ZramStats::sub(&self.stats.bd_count, 1);
                }
                Restore::Committed
            } else {
                slot.clear(SlotFlags::PREFETCHING);
                Restore::Kept
            }
        };

        match outcome {
            Restore::Committed => self.stats.observe_used(self.pool.total_bytes()),
            Restore::Kept | Restore::Raced => {
                if let Some(handle) = handle {
                    self.pool.free(handle);
                }
            }
        }
        outcome
    }

    /// Foreground restore of the single slot tracked by `fetch`. Returns
    /// false if the slot changed meanwhile and must be looked at again.
    pub(crate) async fn restore_on_read(&self, fetch: BlockFetch<'_>, page: &mut [u8]) -> Result<bool> {
        let Some(&(index, loc)) = fetch.entries.first() else {
            return Ok(false);
        };

        let data = match self.fetch_block(fetch.backing, loc.block).await {
            Ok(data) => data,
            Err(ZramError::PrefetchIoFailure { reason, .. }) => {
                return Err(ZramError::PrefetchIoFailure { index, reason })
            }
            Err(e) => return Err(e),
        };

        let outcome = self.extract(&data, index, loc).and_then(|payload| {
            self.decode(payload, page)?;
            Ok(self.commit_restore(fetch.backing, index, loc, payload))
        });
        drop(fetch);

        match outcome? {
            Restore::Raced => Ok(false),
            Restore::Committed | Restore::Kept => {
                if loc.size as usize != PAGE_SIZE {
                    self.queue_neighbours(index, &data);
                }
                debug!(index, block = loc.block, "Restored slot on read");
                Ok(true)
            }
        }
    }

    /// Queue the other slots packed into a fetched block for prefetch.
    fn queue_neighbours(&self, index: u32, data: &[u8]) {
        let neighbours = parse_block(data)
            .into_iter()
            .map(|(i, _)| i)
            .filter(|&i| i != index && i < self.nr_pages());
        for batch in RequestBatch::split(RequestOrigin::ColdRead, neighbours) {
            self.queues.push(WorkerKind::Prefetch, batch);
        }
    }

    /// Prefetch worker body: restore the written-back slots named in
    /// `batches`, reading each distinct block once.
    pub(crate) async fn prefetch(&self, batches: Vec<RequestBatch>) {
        let Some(backing) = self.backing.clone() else {
            return;
        };

        let mut by_block: BTreeMap<u32, BlockFetch<'_>> = BTreeMap::new();
        for index in batches.into_iter().flatten() {
            if index >= self.nr_pages() {
                continue;
            }
            let Some(mut slot) = self.table.try_lock(index) else {
                continue;
            };
            let SlotState::WrittenBack {
                block,
                offset,
                size,
            } = slot.state
            else {
                continue;
            };
            if slot.has(SlotFlags::PREFETCHING) {
                continue;
            }
            if !by_block.contains_key(&block) {
                if !backing.bitmap().try_mark_read(block) {
                    continue;
                }
                by_block.insert(block, BlockFetch::new(self, &backing, block));
            }
            slot.set(SlotFlags::PREFETCHING);
            drop(slot);
            if let Some(fetch) = by_block.get_mut(&block) {
                fetch.push(
                    index,
                    Location {
                        block,
                        offset,
                        size,
                    },
                );
            }
        }

        if by_block.is_empty() {
            return;
        }
        let nr_blocks = by_block.len();
        let restored: usize = join_all(by_block.into_values().map(|fetch| self.restore_block(fetch)))
            .await
            .into_iter()
            .sum();
        debug!(blocks = nr_blocks, restored, "Prefetched co-located slots");
    }

    async fn restore_block(&self, fetch: BlockFetch<'_>) -> usize {
        let Ok(data) = self.fetch_block(fetch.backing, fetch.block).await else {
            return 0;
        };

        let mut restored = 0;
        for &(index, loc) in &fetch.entries {
            match self.extract(&data, index, loc) {
                Ok(payload) => {
                    if self.commit_restore(fetch.backing, index, loc, payload) == Restore::Committed {
                        restored += 1;
                    }
                }
                Err(e) => warn!(index, error = %e, "Skipping corrupt payload"),
            }
        }
        restored
    }
}

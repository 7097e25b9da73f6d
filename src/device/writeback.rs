//! Writing resident slots back to the backing store.
//!
//! Selection copies a slot's payload into the batcher and flags the slot
//! `UNDER_WRITEBACK`; the slot lock is held only for that copy. A work item
//! is written with one I/O. On success each entry whose slot still holds
//! the copied object becomes written back; an entry whose slot was
//! overwritten or freed meanwhile is stale and its block reference is
//! dropped. On failure every entry reverts to resident at the cold end of
//! the LRU list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backing::batcher::{WritebackBatcher, WritebackWorkItem};
use crate::backing::Backing;
use crate::device::engine::Core;
use crate::device::error::{Result, ZramError};
use crate::ramplus::request::{RequestBatch, RequestOrigin, WritebackMode};
use crate::ramplus::RamplusHandler;
use crate::ramplus::worker::WorkerKind;
use crate::stats::ZramStats;
use crate::table::slot::{SlotFlags, SlotState};
use crate::table::zpool::Handle;
use crate::PAGE_SIZE;

/// Outcome of one writeback pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritebackSummary {
    /// Slots copied into writeback buffers.
    pub selected: usize,
    /// Slots now written back.
    pub written: usize,
    /// Backing blocks written.
    pub blocks: usize,
    /// Work items that failed and were reverted.
    pub failed_batches: usize,
}

/// Slots selected by a writeback pass and not yet handed to an I/O.
/// Dropping it puts every one of them back on the LRU list.
struct Selection<'a> {
    core: &'a Core,
    batcher: WritebackBatcher,
}

impl Drop for Selection<'_> {
    fn drop(&mut self) {
        for entry in self.batcher.pending_entries() {
            self.core.revert_selection(entry.index, entry.handle);
        }
    }
}

/// A work item with its block run claimed and its write outstanding.
/// Dropped before being committed, it reverts its entries and releases
/// the run.
struct PendingItem<'a> {
    core: &'a Core,
    backing: &'a Backing,
    item: WritebackWorkItem,
    start: u32,
    committed: bool,
}

impl Drop for PendingItem<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.core.revert_item(&self.item);
            self.backing.release_run(self.start, self.item.nr_pages() as u32);
        }
    }
}

impl Core {
    /// Slots a manual writeback in `mode` considers.
    pub(crate) fn writeback_candidates(&self, mode: WritebackMode) -> Result<Vec<u32>> {
        if let WritebackMode::Index(index) = mode {
            self.check_index(index)?;
            return Ok(vec![index]);
        }
        let required = mode.required_flags();
        Ok((0..self.nr_pages())
            .filter(|&index| self.table.peek_flags(index).contains(required))
            .collect())
    }

    /// Copy a resident slot's payload out and flag it under writeback.
    fn select_for_writeback(&self, index: u32, required: SlotFlags) -> Option<(Handle, Vec<u8>)> {
        let mut slot = self.table.try_lock(index)?;
        let SlotState::Resident { handle, .. } = slot.state else {
            return None;
        };
        let flags = slot.flags();
        if flags.intersects(SlotFlags::transitional()) || !flags.contains(required) {
            return None;
        }
        let payload = self.pool.read(handle).ok()?;
        slot.set(SlotFlags::UNDER_WRITEBACK);
        if slot.has(SlotFlags::LRU_TRACKED) {
            slot.clear(SlotFlags::LRU_TRACKED);
            self.lru_remove(index);
        }
        Some((handle, payload))
    }

    /// Undo a selection: the slot is resident again, coldest on the LRU.
    fn revert_selection(&self, index: u32, handle: Handle) {
        let mut slot = self.table.lock(index);
        let still_ours = matches!(slot.state, SlotState::Resident { handle: h, .. } if h == handle);
        if still_ours && slot.has(SlotFlags::UNDER_WRITEBACK) {
            slot.clear(SlotFlags::UNDER_WRITEBACK);
            slot.set(SlotFlags::LRU_TRACKED);
            self.lru_push_cold(index);
        }
    }

    fn revert_item(&self, item: &WritebackWorkItem) {
        for (_, entry) in item.entries() {
            self.revert_selection(entry.index, entry.handle);
        }
    }

    /// Write back the given slots, in order, until `max_pages` slots are
    /// selected or the selected bytes reach `byte_goal`.
    pub(crate) async fn writeback_indices(
        &self,
        candidates: Vec<u32>,
        origin: RequestOrigin,
        max_pages: usize,
        byte_goal: Option<u64>,
    ) -> Result<WritebackSummary> {
        let backing = self.backing()?.clone();
        let required = origin.required_flags();
        let mut selection = Selection {
            core: self,
            batcher: WritebackBatcher::new(),
        };
        let mut summary = WritebackSummary::default();
        let mut selected_bytes = 0u64;
        let mut first_error = None;

        for index in candidates {
            if summary.selected >= max_pages || byte_goal.is_some_and(|goal| selected_bytes >= goal) {
                break;
            }
            if index >= self.nr_pages() {
                continue;
            }
            let Some((handle, payload)) = self.select_for_writeback(index, required) else {
                continue;
            };
            let pages = selection.batcher.pages_with(payload.len());
            if !self.limits.wb_allows((pages * PAGE_SIZE) as u64) {
                self.revert_selection(index, handle);
                debug!(index, "Writeback limit reached");
                break;
            }

            summary.selected += 1;
            selected_bytes += payload.len() as u64;
            if let Some(item) = selection.batcher.push(index, handle, &payload) {
                if let Err(e) = self.submit(&backing, item, origin, &mut summary).await {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(item) = selection.batcher.flush() {
            if let Err(e) = self.submit(&backing, item, origin, &mut summary).await {
                first_error.get_or_insert(e);
            }
        }

        if summary.selected > 0 {
            info!(
                origin = %origin,
                selected = summary.selected,
                written = summary.written,
                blocks = summary.blocks,
                failed = summary.failed_batches,
                "Writeback pass done"
            );
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Allocate a run for a work item, write it and complete its entries.
    async fn submit(
        &self,
        backing: &Backing,
        item: WritebackWorkItem,
        origin: RequestOrigin,
        summary: &mut WritebackSummary,
    ) -> Result<()> {
        let nr_pages = item.nr_pages() as u32;
        let start = match backing.allocate_run(nr_pages) {
            Ok(start) => start,
            Err(e) => {
                warn!(blocks = nr_pages, error = %e, "No backing space for writeback");
                self.revert_item(&item);
                summary.failed_batches += 1;
                ZramStats::inc(&self.stats.writeback_failures);
                return Err(e.into());
            }
        };
        if backing.reserved_chunks() < self.pool_min_chunks {
            self.queues.wake(WorkerKind::Pool);
        }

        let data = item.to_bytes();
        let mut pending = PendingItem {
            core: self,
            backing,
            item,
            start,
            committed: false,
        };
        if let Err(e) = backing.store().write_blocks(start, &data).await {
            warn!(start, blocks = nr_pages, error = %e, "Writeback failed, reverting batch");
            summary.failed_batches += 1;
            ZramStats::inc(&self.stats.writeback_failures);
            return Err(ZramError::WritebackIoFailure(e.to_string()));
        }

        pending.committed = true;
        ZramStats::add(&self.stats.bd_writes, nr_pages as u64);
        self.limits.charge_wb(nr_pages as u64 * PAGE_SIZE as u64);
        let written = self.commit_item(backing, start, &pending.item, origin);
        summary.written += written;
        summary.blocks += nr_pages as usize;
        debug!(start, blocks = nr_pages, written, "Work item written");
        Ok(())
    }

    /// Move every entry that is still current to its backing location.
    fn commit_item(&self, backing: &Backing, start: u32, item: &WritebackWorkItem, origin: RequestOrigin) -> usize {
        // Count every entry up front so a concurrent free of an already
        // committed slot cannot release its block early.
        {
            let mut bitmap = backing.bitmap();
            for (page, entries) in item.entries_per_page().enumerate() {
                bitmap.commit_objects(start + page as u32, entries as u16);
            }
        }
        ZramStats::add(&self.stats.bd_count, item.nr_pages() as u64);

        let expire = origin.expires();
        let mut written = 0;
        let mut stale = Vec::new();
        for (page, entry) in item.entries() {
            let block = start + page;
            let mut slot = self.table.lock(entry.index);
            let current = slot.state
                == SlotState::Resident {
                    handle: entry.handle,
                    size: entry.size as u32,
                };
            if !current || !slot.has(SlotFlags::UNDER_WRITEBACK) {
                stale.push(block);
                continue;
            }

            self.pool.free(entry.handle);
            slot.state = SlotState::WrittenBack {
                block,
                offset: entry.offset,
                size: entry.size,
            };
            slot.clear(SlotFlags::UNDER_WRITEBACK);
            if slot.has(SlotFlags::HUGE) {
                ZramStats::sub(&self.stats.huge_pages, 1);
            }
            if expire {
                slot.set(SlotFlags::EXPIRE);
                ZramStats::inc(&self.stats.bd_expire);
            }
            ZramStats::sub(&self.stats.compr_data_size, entry.size as u64);
            ZramStats::sub(&self.stats.pages_stored, 1);
            ZramStats::inc(&self.stats.bd_objcnt);
            ZramStats::add(&self.stats.bd_size, entry.size as u64);
            ZramStats::inc(&self.stats.bd_objwrites);
            written += 1;
        }

        if !stale.is_empty() {
            let mut bitmap = backing.bitmap();
            for block in stale {
                if bitmap.put_object(block) {
                    ZramStats::sub(&self.stats.bd_count, 1);
                }
            }
        }
        self.stats.observe_backing();
        written
    }

    /// One LRU eviction cycle: write back the coldest slots until resident
    /// usage is at or below the LRU limit or the page quota is used up.
    pub(crate) async fn lru_writeback_cycle(&self) -> Result<WritebackSummary> {
        let target = self.limits.lru_target();
        let used = self.pool.total_bytes();
        if target == 0 || used <= target || self.backing.is_none() {
            return Ok(WritebackSummary::default());
        }

        let candidates = self.lru.lock().coldest(self.lru_batch_pages);
        debug!(used, target, candidates = candidates.len(), "LRU writeback cycle");
        self.writeback_indices(
            candidates,
            RequestOrigin::Lru,
            self.lru_batch_pages,
            Some(used - target),
        )
        .await
    }

    /// Manual writeback of every slot `mode` picks.
    pub(crate) async fn writeback(&self, mode: WritebackMode) -> Result<WritebackSummary> {
        let candidates = self.writeback_candidates(mode)?;
        self.writeback_indices(candidates, RequestOrigin::Manual(mode), usize::MAX, None)
            .await
    }
}

#[async_trait]
impl RamplusHandler for Core {
    async fn handle(&self, kind: WorkerKind, batches: Vec<RequestBatch>) {
        match kind {
            WorkerKind::Prefetch => {
                if !batches.is_empty() {
                    self.prefetch(batches).await;
                }
            }
            WorkerKind::LruWriteback => match self.lru_writeback_cycle().await {
                Ok(summary) => {
                    if summary.written > 0 && self.over_lru_target() {
                        self.queues.wake(WorkerKind::LruWriteback);
                    }
                }
                Err(e) => warn!(error = %e, "LRU writeback cycle failed"),
            },
            WorkerKind::Writeback => {
                for batch in batches {
                    let origin = batch.origin();
                    let indices: Vec<u32> = batch.into_iter().collect();
                    if let Err(e) = self.writeback_indices(indices, origin, usize::MAX, None).await {
                        warn!(origin = %origin, error = %e, "Queued writeback failed");
                    }
                }
            }
            WorkerKind::Pool => {
                if let Some(backing) = &self.backing {
                    backing.refill_pool(self.pool_min_chunks, self.pool_max_chunks);
                }
            }
        }
    }
}

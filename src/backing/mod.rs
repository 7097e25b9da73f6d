//! Secondary storage for cold pages.
//!
//! - [`store`]: the block store trait with file and in-memory backends
//! - [`bitmap`]: block, chunk and read-request bitmaps
//! - [`batcher`]: packs payloads into page buffers and work items
//!
//! [`Backing`] ties a store to its allocator and the chunks the pool worker
//! has reserved ahead of demand.

pub mod batcher;
pub mod bitmap;
pub mod store;

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use bitmap::{BitmapAllocator, BitmapError, CHUNK_BLOCKS};
use store::BackingStore;

/// An attached backing store and its block allocator.
pub struct Backing {
    store: Arc<dyn BackingStore>,
    bitmap: Mutex<BitmapAllocator>,
    /// First blocks of chunks reserved by the pool worker.
    reserved: Mutex<Vec<u32>>,
}

impl Backing {
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        let nr_blocks = store.nr_blocks();
        Self {
            store,
            bitmap: Mutex::new(BitmapAllocator::new(nr_blocks)),
            reserved: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &dyn BackingStore {
        self.store.as_ref()
    }

    /// Shared handle to the store, for re-attaching it after a reset.
    pub fn store_handle(&self) -> Arc<dyn BackingStore> {
        self.store.clone()
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    pub fn nr_blocks(&self) -> u32 {
        self.store.nr_blocks()
    }

    /// Lock the allocator. Never held across an await.
    pub fn bitmap(&self) -> MutexGuard<'_, BitmapAllocator> {
        self.bitmap.lock()
    }

    /// Claim `len` consecutive blocks, from a reserved chunk if one is
    /// available.
    pub fn allocate_run(&self, len: u32) -> Result<u32, BitmapError> {
        let chunk = self.reserved.lock().pop();
        let mut bitmap = self.bitmap.lock();
        match chunk {
            Some(start) => bitmap.claim_from_chunk(start, len),
            None => bitmap.alloc_run(len),
        }
    }

    /// Give back a run that was never written.
    pub fn release_run(&self, start: u32, len: u32) {
        self.bitmap.lock().release_unused(start, len);
    }

    pub fn reserved_chunks(&self) -> usize {
        self.reserved.lock().len()
    }

    /// Top the reserved pool up to `max` chunks once it has dropped below
    /// `min`. At most half of the free chunks are taken. Returns how many
    /// chunks were reserved.
    pub fn refill_pool(&self, min: usize, max: usize) -> usize {
        let mut reserved = self.reserved.lock();
        if reserved.len() >= min {
            return 0;
        }
        let mut bitmap = self.bitmap.lock();
        let budget = (bitmap.free_chunks() / 2) as usize;
        let want = max.saturating_sub(reserved.len()).min(budget);
        let mut added = 0;
        for _ in 0..want {
            match bitmap.reserve_chunk() {
                Ok(start) => {
                    reserved.push(start);
                    added += 1;
                }
                Err(_) => break,
            }
        }
        if added > 0 {
            debug!(added, reserved = reserved.len(), "Reserved backing chunks");
        }
        added
    }

    /// Blocks per reserved chunk.
    pub const fn chunk_blocks() -> u32 {
        CHUNK_BLOCKS
    }
}

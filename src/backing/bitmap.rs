//! Bitmap allocator for backing-store blocks.
//!
//! Three bitmaps cover the backing store:
//! - the block bitmap marks blocks that hold written-back payloads or are
//!   reserved for a pending batch;
//! - the chunk bitmap marks 64-block aligned chunks with any block in use,
//!   so whole free chunks can be reserved ahead of demand;
//! - the read-request bitmap marks blocks with a read in flight. Such a
//!   block is never handed out again until the read completes.
//!
//! A block may hold several packed payloads; `live` counts them so the
//! block is released when the last one is restored or freed.

use thiserror::Error;

/// Blocks per chunk; one writeback work item fills at most one chunk.
pub const CHUNK_BLOCKS: u32 = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitmapError {
    #[error("No free run of {requested} blocks on the backing store")]
    NoSpace { requested: u32 },

    #[error("Invalid block run {start}+{len}")]
    InvalidRun { start: u32, len: u32 },
}

#[derive(Debug, Clone)]
struct Bitmap {
    words: Vec<u64>,
}

impl Bitmap {
    fn new(bits: u32) -> Self {
        Self {
            words: vec![0; (bits as usize).div_ceil(64)],
        }
    }

    fn test(&self, bit: u32) -> bool {
        self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: u32) {
        self.words[(bit / 64) as usize] |= 1 << (bit % 64);
    }

    fn clear(&mut self, bit: u32) {
        self.words[(bit / 64) as usize] &= !(1 << (bit % 64));
    }

    fn word(&self, index: usize) -> u64 {
        self.words[index]
    }

    fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

/// Backing block allocator.
#[derive(Debug)]
pub struct BitmapAllocator {
    nr_blocks: u32,
    blocks: Bitmap,
    chunks: Bitmap,
    read_req: Bitmap,
    live: Vec<u16>,
}

impl BitmapAllocator {
    pub fn new(nr_blocks: u32) -> Self {
        Self {
            nr_blocks,
            blocks: Bitmap::new(nr_blocks),
            chunks: Bitmap::new(nr_blocks.div_ceil(CHUNK_BLOCKS)),
            read_req: Bitmap::new(nr_blocks),
            live: vec![0; nr_blocks as usize],
        }
    }

    pub fn nr_blocks(&self) -> u32 {
        self.nr_blocks
    }

    /// Blocks currently marked in the block bitmap (including reservations).
    pub fn used_blocks(&self) -> u32 {
        self.blocks.count_ones()
    }

    fn full_chunks(&self) -> u32 {
        self.nr_blocks / CHUNK_BLOCKS
    }

    /// Whole chunks with no block in use.
    pub fn free_chunks(&self) -> u32 {
        (0..self.full_chunks())
            .filter(|&c| !self.chunks.test(c) && self.chunk_is_clear(c))
            .count() as u32
    }

    fn chunk_is_clear(&self, chunk: u32) -> bool {
        self.blocks.word(chunk as usize) == 0 && self.read_req.word(chunk as usize) == 0
    }

    fn block_is_free(&self, block: u32) -> bool {
        !self.blocks.test(block) && !self.read_req.test(block)
    }

    /// Reserve a whole free chunk. Returns its first block.
    pub fn reserve_chunk(&mut self) -> Result<u32, BitmapError> {
        let chunk = (0..self.full_chunks())
            .find(|&c| !self.chunks.test(c) && self.chunk_is_clear(c))
            .ok_or(BitmapError::NoSpace {
                requested: CHUNK_BLOCKS,
            })?;
        self.chunks.set(chunk);
        let start = chunk * CHUNK_BLOCKS;
        for block in start..start + CHUNK_BLOCKS {
            self.blocks.set(block);
        }
        Ok(start)
    }

    /// Keep the first `len` blocks of a reserved chunk and return the rest.
    pub fn claim_from_chunk(&mut self, start: u32, len: u32) -> Result<u32, BitmapError> {
        if start % CHUNK_BLOCKS != 0 || len > CHUNK_BLOCKS || start + CHUNK_BLOCKS > self.nr_blocks {
            return Err(BitmapError::InvalidRun { start, len });
        }
        for block in start + len..start + CHUNK_BLOCKS {
            self.release(block);
        }
        Ok(start)
    }

    /// Claim `len` contiguous free blocks aligned to `len.next_power_of_two()`.
    pub fn alloc_run(&mut self, len: u32) -> Result<u32, BitmapError> {
        if len == 0 || len > CHUNK_BLOCKS {
            return Err(BitmapError::InvalidRun { start: 0, len });
        }
        let align = len.next_power_of_two();
        let mut start = 0u32;
        while start + len <= self.nr_blocks {
            if (start..start + len).all(|b| self.block_is_free(b)) {
                for block in start..start + len {
                    self.blocks.set(block);
                    self.chunks.set(block / CHUNK_BLOCKS);
                }
                return Ok(start);
            }
            start += align;
        }
        Err(BitmapError::NoSpace { requested: len })
    }

    /// Record `count` payloads packed into `block`.
    pub fn commit_objects(&mut self, block: u32, count: u16) {
        self.live[block as usize] += count;
    }

    /// Drop one payload reference. Returns true if the block was released.
    pub fn put_object(&mut self, block: u32) -> bool {
        let live = &mut self.live[block as usize];
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.release(block);
            true
        } else {
            false
        }
    }

    /// Release every block of a run that ended up holding no payload.
    /// Returns how many blocks of the run stay allocated.
    pub fn release_unused(&mut self, start: u32, len: u32) -> u32 {
        let mut kept = 0;
        for block in start..start + len {
            if self.live[block as usize] == 0 {
                self.release(block);
            } else {
                kept += 1;
            }
        }
        kept
    }

    fn release(&mut self, block: u32) {
        self.blocks.clear(block);
        self.live[block as usize] = 0;
        let chunk = block / CHUNK_BLOCKS;
        if self.blocks.word(chunk as usize) == 0 {
            self.chunks.clear(chunk);
        }
    }

    pub fn is_allocated(&self, block: u32) -> bool {
        self.blocks.test(block)
    }

    /// Mark a block as being read. Returns false if a read is already in flight.
    pub fn try_mark_read(&mut self, block: u32) -> bool {
        if self.read_req.test(block) {
            return false;
        }
        self.read_req.set(block);
        true
    }

    pub fn clear_read(&mut self, block: u32) {
        self.read_req.clear(block);
    }
}

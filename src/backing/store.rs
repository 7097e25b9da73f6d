//! Backing stores for written-back pages.
//!
//! A backing store is addressed in page-sized blocks. Writes cover a run of
//! consecutive blocks so one writeback work item is one I/O.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::PAGE_SIZE;

#[derive(Error, Debug)]
pub enum BackingError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Block run {start}+{len} is outside the backing store ({nr_blocks} blocks)")]
    OutOfRange { start: u32, len: u32, nr_blocks: u32 },

    #[error("Buffer of {0} bytes is not a whole number of blocks")]
    Unaligned(usize),

    #[error("Injected {0} failure")]
    Injected(&'static str),
}

/// Asynchronous block storage for cold pages.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Number of page-sized blocks.
    fn nr_blocks(&self) -> u32;

    /// Human-readable location, for logs and the admin surface.
    fn describe(&self) -> String;

    /// Read one block into a page-sized buffer.
    async fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<(), BackingError>;

    /// Write `data` (a whole number of blocks) starting at block `start`.
    async fn write_blocks(&self, start: u32, data: &[u8]) -> Result<(), BackingError>;
}

fn check_run(start: u32, bytes: usize, nr_blocks: u32) -> Result<u32, BackingError> {
    if bytes == 0 || bytes % PAGE_SIZE != 0 {
        return Err(BackingError::Unaligned(bytes));
    }
    let len = (bytes / PAGE_SIZE) as u32;
    if start.checked_add(len).map_or(true, |end| end > nr_blocks) {
        return Err(BackingError::OutOfRange {
            start,
            len,
            nr_blocks,
        });
    }
    Ok(len)
}

/// File-backed store; the file is sized to the block count on open.
pub struct FileBackingStore {
    path: PathBuf,
    file: Mutex<File>,
    nr_blocks: u32,
}

impl FileBackingStore {
    /// Open (or create) a backing file with room for `nr_blocks` blocks.
    pub async fn open(path: &Path, nr_blocks: u32) -> Result<Self, BackingError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        file.set_len(nr_blocks as u64 * PAGE_SIZE as u64).await?;

        debug!(path = %path.display(), nr_blocks, "Opened backing file");

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            nr_blocks,
        })
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    fn nr_blocks(&self) -> u32 {
        self.nr_blocks
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<(), BackingError> {
        check_run(block, buf.len(), self.nr_blocks)?;
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(block as u64 * PAGE_SIZE as u64))
            .await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_blocks(&self, start: u32, data: &[u8]) -> Result<(), BackingError> {
        let len = check_run(start, data.len(), self.nr_blocks)?;
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(start as u64 * PAGE_SIZE as u64))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        debug!(start, len, path = %self.path.display(), "Wrote block run");
        Ok(())
    }
}

/// In-memory store with switchable failures, for tests and benchmarks.
pub struct MemBackingStore {
    data: parking_lot::Mutex<Vec<u8>>,
    nr_blocks: u32,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemBackingStore {
    pub fn new(nr_blocks: u32) -> Self {
        Self {
            data: parking_lot::Mutex::new(vec![0u8; nr_blocks as usize * PAGE_SIZE]),
            nr_blocks,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent reads fail (or succeed again).
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl BackingStore for MemBackingStore {
    fn nr_blocks(&self) -> u32 {
        self.nr_blocks
    }

    fn describe(&self) -> String {
        format!("memory ({} blocks)", self.nr_blocks)
    }

    async fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<(), BackingError> {
        check_run(block, buf.len(), self.nr_blocks)?;
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(BackingError::Injected("read"));
        }
        let start = block as usize * PAGE_SIZE;
        buf.copy_from_slice(&self.data.lock()[start..start + buf.len()]);
        Ok(())
    }

    async fn write_blocks(&self, start: u32, data: &[u8]) -> Result<(), BackingError> {
        check_run(start, data.len(), self.nr_blocks)?;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(BackingError::Injected("write"));
        }
        let offset = start as usize * PAGE_SIZE;
        self.data.lock()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

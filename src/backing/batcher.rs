//! Writeback batcher: packs compressed payloads into page-sized buffers.
//!
//! Each packed payload is preceded by a [`WbHeader`] so a block read back
//! from the store names every slot it holds. A payload that is a whole page
//! (stored raw because it did not compress) gets a buffer of its own with no
//! header. Up to [`NR_ZWBS`] buffers form one work item, written to
//! consecutive blocks with a single I/O.

use bytemuck::{Pod, Zeroable};

use crate::table::zpool::Handle;
use crate::PAGE_SIZE;

/// Entries packed into one page buffer at most.
pub const WB_THRESHOLD: usize = 32;

/// Page buffers per work item at most.
pub const NR_ZWBS: usize = 64;

/// On-disk header preceding each packed payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct WbHeader {
    pub index: u32,
    pub size: u32,
}

pub const WB_HEADER_SIZE: usize = std::mem::size_of::<WbHeader>();

/// One slot's payload inside a page buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritebackEntry {
    /// Slot index.
    pub index: u32,
    /// Byte offset of the payload inside the page.
    pub offset: u16,
    /// Payload size in bytes.
    pub size: u16,
    /// Object the payload was copied from, to detect overwrites at completion.
    pub handle: Handle,
}

/// A page being filled with packed payloads.
#[derive(Debug)]
pub struct WritebackPageBuffer {
    entries: Vec<WritebackEntry>,
    page: Box<[u8]>,
    cursor: usize,
}

impl Default for WritebackPageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl WritebackPageBuffer {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(WB_THRESHOLD),
            page: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            cursor: 0,
        }
    }

    /// Whether a payload of `len` bytes still fits.
    pub fn fits(&self, len: usize) -> bool {
        if len >= PAGE_SIZE {
            return self.entries.is_empty();
        }
        self.entries.len() < WB_THRESHOLD && self.cursor + WB_HEADER_SIZE + len <= PAGE_SIZE
    }

    /// Append a payload. The caller checks [`fits`](Self::fits) first.
    fn push(&mut self, index: u32, handle: Handle, payload: &[u8]) {
        let offset = if payload.len() == PAGE_SIZE {
            self.page.copy_from_slice(payload);
            self.cursor = PAGE_SIZE;
            0
        } else {
            let header = WbHeader {
                index,
                size: payload.len() as u32,
            };
            let at = self.cursor;
            self.page[at..at + WB_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
            let offset = at + WB_HEADER_SIZE;
            self.page[offset..offset + payload.len()].copy_from_slice(payload);
            self.cursor = offset + payload.len();
            offset
        };
        self.entries.push(WritebackEntry {
            index,
            offset: offset as u16,
            size: payload.len() as u16,
            handle,
        });
    }

    pub fn entries(&self) -> &[WritebackEntry] {
        &self.entries
    }

    pub fn page(&self) -> &[u8] {
        &self.page
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A batch of page buffers written with one I/O.
#[derive(Debug, Default)]
pub struct WritebackWorkItem {
    buffers: Vec<WritebackPageBuffer>,
}

impl WritebackWorkItem {
    /// Number of blocks this item occupies.
    pub fn nr_pages(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn nr_entries(&self) -> usize {
        self.buffers.iter().map(|b| b.entries.len()).sum()
    }

    /// Entries with the position of their buffer within the item.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &WritebackEntry)> {
        self.buffers
            .iter()
            .enumerate()
            .flat_map(|(i, buf)| buf.entries.iter().map(move |e| (i as u32, e)))
    }

    /// Entries in each buffer, by buffer position.
    pub fn entries_per_page(&self) -> impl Iterator<Item = usize> + '_ {
        self.buffers.iter().map(|b| b.entries.len())
    }

    /// Concatenate the buffers for a single contiguous write.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buffers.len() * PAGE_SIZE);
        for buf in &self.buffers {
            out.extend_from_slice(&buf.page);
        }
        out
    }
}

/// Accumulates payloads into work items.
#[derive(Debug, Default)]
pub struct WritebackBatcher {
    current: Option<WritebackPageBuffer>,
    item: WritebackWorkItem,
}

impl WritebackBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a payload. Returns a full work item when this push completed one;
    /// the new payload then starts the next item.
    pub fn push(&mut self, index: u32, handle: Handle, payload: &[u8]) -> Option<WritebackWorkItem> {
        let mut ready = None;
        let full = self
            .current
            .as_ref()
            .is_some_and(|buf| !buf.fits(payload.len()));
        if full {
            if let Some(buf) = self.current.take() {
                self.item.buffers.push(buf);
            }
            if self.item.buffers.len() == NR_ZWBS {
                ready = Some(std::mem::take(&mut self.item));
            }
        }
        self.current
            .get_or_insert_with(WritebackPageBuffer::new)
            .push(index, handle, payload);
        ready
    }

    /// Hand back whatever is pending as a (possibly short) work item.
    pub fn flush(&mut self) -> Option<WritebackWorkItem> {
        if let Some(buf) = self.current.take() {
            self.item.buffers.push(buf);
        }
        if self.item.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.item))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.item.is_empty()
    }

    /// Entries pushed but not yet handed out in a work item.
    pub fn pending_entries(&self) -> impl Iterator<Item = &WritebackEntry> {
        self.item
            .buffers
            .iter()
            .chain(self.current.iter())
            .flat_map(|buf| buf.entries.iter())
    }

    /// Pages the pending item would span after adding a payload of `len`
    /// bytes.
    pub fn pages_with(&self, len: usize) -> usize {
        let held = self.item.nr_pages();
        match &self.current {
            Some(buf) if buf.fits(len) => held + 1,
            Some(_) => (held + 1) % NR_ZWBS + 1,
            None => held + 1,
        }
    }
}

/// Header stored just before a packed payload, if the payload has one.
pub fn header_at(page: &[u8], offset: usize) -> Option<WbHeader> {
    if offset < WB_HEADER_SIZE || offset > page.len() {
        return None;
    }
    Some(bytemuck::pod_read_unaligned(
        &page[offset - WB_HEADER_SIZE..offset],
    ))
}

/// Walk the headers of a packed block. Only valid for blocks that are not a
/// single raw page.
pub fn parse_block(page: &[u8]) -> Vec<(u32, WritebackEntry)> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor + WB_HEADER_SIZE <= page.len() && out.len() < WB_THRESHOLD {
        let header: WbHeader = bytemuck::pod_read_unaligned(&page[cursor..cursor + WB_HEADER_SIZE]);
        let size = header.size as usize;
        let offset = cursor + WB_HEADER_SIZE;
        if size == 0 || offset + size > page.len() {
            break;
        }
        out.push((
            header.index,
            WritebackEntry {
                index: header.index,
                offset: offset as u16,
                size: size as u16,
                handle: Handle::MAX,
            },
        ));
        cursor = offset + size;
    }
    out
}

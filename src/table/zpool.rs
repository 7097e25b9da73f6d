//! Object pool for compressed payloads.
//!
//! The device only needs `allocate`, `write`, `read` and `free` from its
//! object store. [`HeapPool`] backs each object with a heap buffer and
//! recycles entries through a free list. A handle carries the entry's
//! generation in its high half, so a handle to a freed object never
//! matches the object that reuses its entry.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Opaque object handle.
pub type Handle = u64;

fn split(handle: Handle) -> (usize, u32) {
    ((handle & u32::MAX as u64) as usize, (handle >> 32) as u32)
}

fn join(index: usize, generation: u32) -> Handle {
    ((generation as u64) << 32) | index as u64
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Object pool exhausted: {requested} bytes requested, {used}/{capacity} in use")]
    OutOfMemory {
        requested: usize,
        used: u64,
        capacity: u64,
    },

    #[error("Stale object handle {0}")]
    BadHandle(Handle),
}

/// Sub-page object store the device keeps compressed pages in.
pub trait ObjectStore: Send + Sync {
    /// Reserve an object of `size` bytes.
    fn allocate(&self, size: usize) -> Result<Handle, PoolError>;

    /// Fill an object; `data` must match the allocated size.
    fn write(&self, handle: Handle, data: &[u8]) -> Result<(), PoolError>;

    /// Copy an object's bytes out.
    fn read(&self, handle: Handle) -> Result<Vec<u8>, PoolError>;

    /// Release an object.
    fn free(&self, handle: Handle);

    /// Bytes held by live objects.
    fn total_bytes(&self) -> u64;

    /// Number of live objects.
    fn object_count(&self) -> usize;
}

#[derive(Debug, Default)]
struct PoolEntry {
    generation: u32,
    data: Option<Box<[u8]>>,
}

#[derive(Debug, Default)]
struct PoolInner {
    objects: Vec<PoolEntry>,
    free: Vec<usize>,
    live: usize,
}

impl PoolInner {
    fn get_mut(&mut self, handle: Handle) -> Option<&mut Box<[u8]>> {
        let (index, generation) = split(handle);
        self.objects
            .get_mut(index)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.data.as_mut())
    }
}

/// Heap-backed object pool with an optional byte capacity.
#[derive(Debug)]
pub struct HeapPool {
    inner: Mutex<PoolInner>,
    used: AtomicU64,
    capacity: u64,
}

impl HeapPool {
    /// `capacity` of zero means unlimited.
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            used: AtomicU64::new(0),
            capacity,
        }
    }
}

impl ObjectStore for HeapPool {
    fn allocate(&self, size: usize) -> Result<Handle, PoolError> {
        let used = self.used.load(Ordering::Relaxed);
        if self.capacity != 0 && used + size as u64 > self.capacity {
            return Err(PoolError::OutOfMemory {
                requested: size,
                used,
                capacity: self.capacity,
            });
        }

        let mut inner = self.inner.lock();
        let buf = vec![0u8; size].into_boxed_slice();
        let handle = match inner.free.pop() {
            Some(index) => {
                let entry = &mut inner.objects[index];
                entry.data = Some(buf);
                join(index, entry.generation)
            }
            None => {
                inner.objects.push(PoolEntry {
                    generation: 0,
                    data: Some(buf),
                });
                join(inner.objects.len() - 1, 0)
            }
        };
        inner.live += 1;
        self.used.fetch_add(size as u64, Ordering::Relaxed);
        Ok(handle)
    }

    fn write(&self, handle: Handle, data: &[u8]) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        match inner.get_mut(handle) {
            Some(obj) if obj.len() == data.len() => {
                obj.copy_from_slice(data);
                Ok(())
            }
            _ => Err(PoolError::BadHandle(handle)),
        }
    }

    fn read(&self, handle: Handle) -> Result<Vec<u8>, PoolError> {
        let mut inner = self.inner.lock();
        inner
            .get_mut(handle)
            .map(|obj| obj.to_vec())
            .ok_or(PoolError::BadHandle(handle))
    }

    fn free(&self, handle: Handle) {
        let mut inner = self.inner.lock();
        let (index, generation) = split(handle);
        let Some(entry) = inner
            .objects
            .get_mut(index)
            .filter(|e| e.generation == generation && e.data.is_some())
        else {
            debug!(handle, "Free of stale object handle");
            return;
        };
        if let Some(obj) = entry.data.take() {
            entry.generation = entry.generation.wrapping_add(1);
            self.used.fetch_sub(obj.len() as u64, Ordering::Relaxed);
            inner.free.push(index);
            inner.live -= 1;
        }
    }

    fn total_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    fn object_count(&self) -> usize {
        self.inner.lock().live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_read_free() {
        let pool = HeapPool::new(0);
        let h = pool.allocate(5).unwrap();
        pool.write(h, b"hello").unwrap();
        assert_eq!(pool.read(h).unwrap(), b"hello");
        assert_eq!(pool.total_bytes(), 5);

        pool.free(h);
        assert_eq!(pool.total_bytes(), 0);
        assert_eq!(pool.object_count(), 0);
        assert!(pool.read(h).is_err());
    }

    #[test]
    fn test_recycled_entry_gets_new_handle() {
        let pool = HeapPool::new(0);
        let a = pool.allocate(8).unwrap();
        pool.free(a);
        let b = pool.allocate(16).unwrap();
        assert_ne!(a, b);
        assert_eq!(a & 0xffff_ffff, b & 0xffff_ffff);

        // The stale handle reaches nothing, not even the reused entry.
        assert!(pool.read(a).is_err());
        pool.free(a);
        assert_eq!(pool.object_count(), 1);
        assert!(pool.write(b, &[0u8; 8]).is_err());
        pool.write(b, &[1u8; 16]).unwrap();
    }

    #[test]
    fn test_capacity_is_enforced() {
        let pool = HeapPool::new(100);
        let _a = pool.allocate(60).unwrap();
        assert!(matches!(
            pool.allocate(60),
            Err(PoolError::OutOfMemory { .. })
        ));
        assert!(pool.allocate(40).is_ok());
    }
}

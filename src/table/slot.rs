//! Slot table: one record per logical page.
//!
//! Each slot carries a flag word and a state. The flag word doubles as a
//! bit lock: the thread that sets `LOCKED` owns the slot's state and flags
//! until it clears the bit again. The lock is a spin/yield loop rather than a
//! mutex object so a slot costs a few words of memory.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use crate::table::zpool::Handle;

/// Spins before a waiting locker starts yielding its thread.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Per-slot flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SlotFlags(u32);

impl SlotFlags {
    /// Slot is owned by one thread.
    pub const LOCKED: SlotFlags = SlotFlags(1 << 0);
    /// Payload did not compress below the huge threshold and is stored raw.
    pub const HUGE: SlotFlags = SlotFlags(1 << 1);
    /// Not accessed since the last idle marking.
    pub const IDLE: SlotFlags = SlotFlags(1 << 2);
    /// Payload copied into a writeback buffer, write in flight.
    pub const UNDER_WRITEBACK: SlotFlags = SlotFlags(1 << 3);
    /// Backing block read in flight to restore this slot.
    pub const PREFETCHING: SlotFlags = SlotFlags(1 << 4);
    /// Written back by the idle policy.
    pub const EXPIRE: SlotFlags = SlotFlags(1 << 5);
    /// Last written by a sub-page read-modify-write.
    pub const PARTIAL_REPLACE: SlotFlags = SlotFlags(1 << 6);
    /// Linked into the LRU list.
    pub const LRU_TRACKED: SlotFlags = SlotFlags(1 << 7);

    pub const fn empty() -> Self {
        SlotFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        SlotFlags(bits)
    }

    pub const fn contains(self, other: SlotFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: SlotFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Flags that mark an operation in flight on the slot.
    pub const fn transitional() -> Self {
        SlotFlags(Self::UNDER_WRITEBACK.0 | Self::PREFETCHING.0)
    }
}

impl std::ops::BitOr for SlotFlags {
    type Output = SlotFlags;

    fn bitor(self, rhs: SlotFlags) -> SlotFlags {
        SlotFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for SlotFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(SlotFlags, &str); 8] = [
            (SlotFlags::LOCKED, "LOCKED"),
            (SlotFlags::HUGE, "HUGE"),
            (SlotFlags::IDLE, "IDLE"),
            (SlotFlags::UNDER_WRITEBACK, "UNDER_WRITEBACK"),
            (SlotFlags::PREFETCHING, "PREFETCHING"),
            (SlotFlags::EXPIRE, "EXPIRE"),
            (SlotFlags::PARTIAL_REPLACE, "PARTIAL_REPLACE"),
            (SlotFlags::LRU_TRACKED, "LRU_TRACKED"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// Where a slot's page currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Nothing stored; reads return zeroes.
    #[default]
    Empty,
    /// Compressed (or raw, if huge) payload in the object pool.
    Resident { handle: Handle, size: u32 },
    /// Page is one machine word repeated; no object allocated.
    Same { element: u64 },
    /// Payload lives at `offset` inside backing block `block`.
    WrittenBack { block: u32, offset: u16, size: u16 },
}

impl SlotState {
    pub fn is_empty(&self) -> bool {
        matches!(self, SlotState::Empty)
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, SlotState::Resident { .. })
    }

    pub fn is_written_back(&self) -> bool {
        matches!(self, SlotState::WrittenBack { .. })
    }
}

/// The lock-protected part of a slot.
#[derive(Debug, Default)]
pub struct SlotEntry {
    pub state: SlotState,
    pub last_access: Option<Instant>,
}

struct SlotCell {
    flags: AtomicU32,
    entry: UnsafeCell<SlotEntry>,
}

// SAFETY: `entry` is only reached through a `SlotGuard`, and a guard exists
// only while its owner holds the `LOCKED` bit, which is acquired with
// Acquire ordering and released with Release ordering.
unsafe impl Sync for SlotCell {}

/// Fixed-size table of slots addressed by page index.
pub struct SlotTable {
    slots: Box<[SlotCell]>,
}

impl SlotTable {
    pub fn new(nr_slots: u32) -> Self {
        let slots = (0..nr_slots)
            .map(|_| SlotCell {
                flags: AtomicU32::new(0),
                entry: UnsafeCell::new(SlotEntry::default()),
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn cell(&self, index: u32) -> &SlotCell {
        &self.slots[index as usize]
    }

    /// Lock a slot, spinning and then yielding until it is free.
    pub fn lock(&self, index: u32) -> SlotGuard<'_> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock(index) {
                return guard;
            }
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Lock a slot if nobody else holds it.
    pub fn try_lock(&self, index: u32) -> Option<SlotGuard<'_>> {
        let cell = self.cell(index);
        let current = cell.flags.load(Ordering::Relaxed);
        if current & SlotFlags::LOCKED.bits() != 0 {
            return None;
        }
        cell.flags
            .compare_exchange(
                current,
                current | SlotFlags::LOCKED.bits(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| SlotGuard {
                cell,
                index,
                _not_send: PhantomData,
            })
    }

    /// Unlocked snapshot of a slot's flags.
    pub fn peek_flags(&self, index: u32) -> SlotFlags {
        SlotFlags::from_bits(self.cell(index).flags.load(Ordering::Relaxed))
    }
}

/// Exclusive access to one slot; dropping it clears `LOCKED`.
///
/// The guard is `!Send`, so a future holding one across an `.await` cannot
/// be spawned onto the runtime.
pub struct SlotGuard<'a> {
    cell: &'a SlotCell,
    index: u32,
    _not_send: PhantomData<*const ()>,
}

impl SlotGuard<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn flags(&self) -> SlotFlags {
        SlotFlags::from_bits(self.cell.flags.load(Ordering::Relaxed))
    }

    pub fn has(&self, flag: SlotFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set(&mut self, flag: SlotFlags) {
        self.cell.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    pub fn clear(&mut self, flag: SlotFlags) {
        let keep = !(flag.bits() & !SlotFlags::LOCKED.bits());
        self.cell.flags.fetch_and(keep, Ordering::Relaxed);
    }

    /// Drop every flag except the lock bit.
    pub fn clear_all(&mut self) {
        self.cell
            .flags
            .store(SlotFlags::LOCKED.bits(), Ordering::Relaxed);
    }

    /// Stamp the access time and drop the idle mark.
    pub fn touch(&mut self) {
        self.last_access = Some(Instant::now());
        self.clear(SlotFlags::IDLE);
    }

    /// Check the one-representation invariant against the flag word.
    pub fn is_consistent(&self) -> bool {
        let flags = self.flags();
        match self.state {
            SlotState::Empty => !flags.intersects(
                SlotFlags::HUGE | SlotFlags::transitional() | SlotFlags::LRU_TRACKED,
            ),
            SlotState::Same { .. } => !flags.intersects(
                SlotFlags::HUGE | SlotFlags::transitional() | SlotFlags::LRU_TRACKED,
            ),
            SlotState::Resident { .. } => !flags.contains(SlotFlags::PREFETCHING),
            SlotState::WrittenBack { .. } => {
                !flags.intersects(SlotFlags::UNDER_WRITEBACK | SlotFlags::LRU_TRACKED)
            }
        }
    }
}

impl Deref for SlotGuard<'_> {
    type Target = SlotEntry;

    fn deref(&self) -> &SlotEntry {
        // SAFETY: the guard holds LOCKED, so no other reference to the entry exists.
        unsafe { &*self.cell.entry.get() }
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut SlotEntry {
        // SAFETY: as in `deref`; `&mut self` makes this the only borrow.
        unsafe { &mut *self.cell.entry.get() }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        debug_assert!(
            std::thread::panicking() || self.is_consistent(),
            "slot {} unlocked as {:?} with {:?}",
            self.index,
            self.state,
            self.flags()
        );
        self.cell
            .flags
            .fetch_and(!SlotFlags::LOCKED.bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_try_lock_is_exclusive() {
        let table = SlotTable::new(4);
        let guard = table.lock(1);
        assert!(table.try_lock(1).is_none());
        assert!(table.try_lock(2).is_some());
        drop(guard);
        assert!(table.try_lock(1).is_some());
    }

    #[test]
    fn test_flags_survive_unlock() {
        let table = SlotTable::new(2);
        {
            let mut guard = table.lock(0);
            guard.set(SlotFlags::EXPIRE | SlotFlags::IDLE);
            guard.clear(SlotFlags::IDLE);
        }
        let flags = table.peek_flags(0);
        assert!(flags.contains(SlotFlags::EXPIRE));
        assert!(!flags.contains(SlotFlags::IDLE));
        assert!(!flags.contains(SlotFlags::LOCKED));
    }

    #[test]
    fn test_clear_never_drops_lock_bit() {
        let table = SlotTable::new(1);
        let mut guard = table.lock(0);
        guard.clear(SlotFlags::LOCKED);
        guard.clear_all();
        assert!(guard.has(SlotFlags::LOCKED));
        assert!(table.try_lock(0).is_none());
    }

    #[test]
    fn test_lock_counts_under_contention() {
        let table = Arc::new(SlotTable::new(1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = table.lock(0);
                        // Non-atomic read-modify-write through the guard.
                        let next = match guard.state {
                            SlotState::Same { element } => element + 1,
                            _ => 1,
                        };
                        guard.state = SlotState::Same { element: next };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let guard = table.lock(0);
        assert_eq!(guard.state, SlotState::Same { element: 8000 });
    }

    #[test]
    fn test_consistency_check() {
        let table = SlotTable::new(1);
        let mut guard = table.lock(0);
        guard.state = SlotState::WrittenBack {
            block: 3,
            offset: 8,
            size: 100,
        };
        assert!(guard.is_consistent());
        guard.set(SlotFlags::UNDER_WRITEBACK);
        assert!(!guard.is_consistent());
        guard.clear(SlotFlags::UNDER_WRITEBACK);
    }
}

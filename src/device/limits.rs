//! Runtime-adjustable memory and writeback limits.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Limits shared by the device and its workers. They survive a reset.
#[derive(Debug, Default)]
pub struct Limits {
    /// Resident compressed bytes allowed (0 = unlimited).
    mem_limit: AtomicU64,
    /// Explicit LRU limit (0 = two thirds of the memory limit).
    lru_limit: AtomicU64,
    /// Bytes writeback may still write (None = unlimited).
    wb_limit: Mutex<Option<u64>>,
}

/// Serialisable view of [`Limits`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsSnapshot {
    pub mem_limit: u64,
    pub lru_limit: u64,
    /// The LRU limit actually enforced.
    pub lru_target: u64,
    pub wb_limit: Option<u64>,
}

impl Limits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mem_limit: AtomicU64::new(config.device.mem_limit),
            lru_limit: AtomicU64::new(config.writeback.lru_limit),
            wb_limit: Mutex::new(config.writeback.wb_limit),
        }
    }

    pub fn mem_limit(&self) -> u64 {
        self.mem_limit.load(Ordering::Relaxed)
    }

    pub fn set_mem_limit(&self, bytes: u64) {
        self.mem_limit.store(bytes, Ordering::Relaxed);
    }

    pub fn set_lru_limit(&self, bytes: u64) {
        self.lru_limit.store(bytes, Ordering::Relaxed);
    }

    /// Resident bytes the LRU writeback worker drains down to; 0 disables it.
    pub fn lru_target(&self) -> u64 {
        match self.lru_limit.load(Ordering::Relaxed) {
            0 => self.mem_limit() / 3 * 2,
            explicit => explicit,
        }
    }

    /// Whether storing `requested` more bytes on top of `used` breaks the
    /// memory limit.
    pub fn exceeds_mem(&self, used: u64, requested: u64) -> bool {
        let limit = self.mem_limit();
        limit != 0 && used + requested > limit
    }

    pub fn wb_limit(&self) -> Option<u64> {
        *self.wb_limit.lock()
    }

    pub fn set_wb_limit(&self, bytes: Option<u64>) {
        *self.wb_limit.lock() = bytes;
    }

    /// Whether writeback may write `bytes` more.
    pub fn wb_allows(&self, bytes: u64) -> bool {
        self.wb_limit().map_or(true, |remaining| remaining >= bytes)
    }

    /// Charge written bytes against the writeback limit.
    pub fn charge_wb(&self, bytes: u64) {
        if let Some(remaining) = self.wb_limit.lock().as_mut() {
            *remaining = remaining.saturating_sub(bytes);
        }
    }

    pub fn snapshot(&self) -> LimitsSnapshot {
        LimitsSnapshot {
            mem_limit: self.mem_limit(),
            lru_limit: self.lru_limit.load(Ordering::Relaxed),
            lru_target: self.lru_target(),
            wb_limit: self.wb_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_target_derives_from_mem_limit() {
        let limits = Limits::default();
        assert_eq!(limits.lru_target(), 0);
        limits.set_mem_limit(3000);
        assert_eq!(limits.lru_target(), 2000);
        limits.set_lru_limit(500);
        assert_eq!(limits.lru_target(), 500);
    }

    #[test]
    fn test_mem_limit_check() {
        let limits = Limits::default();
        assert!(!limits.exceeds_mem(u64::MAX / 2, 1));
        limits.set_mem_limit(100);
        assert!(!limits.exceeds_mem(60, 40));
        assert!(limits.exceeds_mem(60, 41));
    }

    #[test]
    fn test_wb_limit_is_consumed() {
        let limits = Limits::default();
        assert!(limits.wb_allows(u64::MAX));
        limits.set_wb_limit(Some(8192));
        assert!(limits.wb_allows(4096));
        limits.charge_wb(4096);
        limits.charge_wb(4096);
        assert!(!limits.wb_allows(1));
        assert_eq!(limits.wb_limit(), Some(0));
    }
}

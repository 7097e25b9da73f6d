//! Device counters.
//!
//! Counters are plain atomics bumped from the I/O and worker paths. A
//! [`StatsSnapshot`] is what leaves the device: it serialises to JSON for the
//! admin API and renders as Prometheus text for `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

macro_rules! device_stats {
    ($($(#[doc = $doc:literal])+ $name:ident,)+) => {
        /// Live counters shared by the device and its workers.
        #[derive(Debug, Default)]
        pub struct ZramStats {
            $($(#[doc = $doc])+ pub $name: AtomicU64,)+
        }

        /// Point-in-time copy of [`ZramStats`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct StatsSnapshot {
            $($(#[doc = $doc])+ pub $name: u64,)+
        }

        impl ZramStats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)+
                }
            }

            /// Zero every counter.
            pub fn reset(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)+
            }
        }

        impl StatsSnapshot {
            /// `(name, help, value)` for every counter.
            pub fn entries(&self) -> Vec<(&'static str, &'static str, u64)> {
                vec![$((stringify!($name), concat!($($doc),+).trim(), self.$name),)+]
            }
        }
    };
}

device_stats! {
    /// Bytes of compressed payload resident in the object pool.
    compr_data_size,
    /// Read requests served.
    num_reads,
    /// Write requests served.
    num_writes,
    /// Read requests that failed.
    failed_reads,
    /// Write requests that failed.
    failed_writes,
    /// Misaligned or out-of-range requests.
    invalid_io,
    /// Free notifications received.
    notify_free,
    /// Slots holding a repeated machine word.
    same_pages,
    /// Resident slots stored raw.
    huge_pages,
    /// Huge pages stored since the device was initialised.
    huge_pages_since,
    /// Slots held in memory (resident or same-element).
    pages_stored,
    /// High-water mark of object pool usage in bytes.
    max_used_bytes,
    /// Writes rejected by the memory limit.
    writestall,
    /// Free notifications that found the slot busy or empty.
    miss_free,
    /// Backing blocks holding live payloads.
    bd_count,
    /// Backing block reads.
    bd_reads,
    /// Backing block writes.
    bd_writes,
    /// Slots currently written back.
    bd_objcnt,
    /// Bytes of payload currently written back.
    bd_size,
    /// High-water mark of `bd_count`.
    bd_max_count,
    /// High-water mark of `bd_size`.
    bd_max_size,
    /// Slots written back by the idle policy.
    bd_expire,
    /// Slots restored from the backing store.
    bd_objreads,
    /// Slots written to the backing store.
    bd_objwrites,
    /// Slots tracked on the LRU list.
    lru_pages,
    /// Writeback batches that failed and were reverted.
    writeback_failures,
    /// Backing reads that failed.
    prefetch_failures,
}

impl ZramStats {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Saturating decrement; gauges never wrap below zero.
    pub fn sub(counter: &AtomicU64, n: u64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(n))
        });
    }

    /// Raise `max_used_bytes` to `used` if it is a new high.
    pub fn observe_used(&self, used: u64) {
        self.max_used_bytes.fetch_max(used, Ordering::Relaxed);
    }

    /// Carry the backing block and byte counts into their high-water marks.
    pub fn observe_backing(&self) {
        let count = self.bd_count.load(Ordering::Relaxed);
        let size = self.bd_size.load(Ordering::Relaxed);
        self.bd_max_count.fetch_max(count, Ordering::Relaxed);
        self.bd_max_size.fetch_max(size, Ordering::Relaxed);
    }
}

impl StatsSnapshot {
    /// Render in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> Result<String, prometheus::Error> {
        let registry = Registry::new_custom(Some("zram".to_string()), None)?;
        for (name, help, value) in self.entries() {
            let gauge = IntGauge::new(name, help)?;
            gauge.set(value.min(i64::MAX as u64) as i64);
            registry.register(Box::new(gauge))?;
        }

        let mut buf = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

//! zram-plus: compressed RAM block device with cold-page writeback.
//!
//! Logical pages are compressed into an in-memory object pool. Pages that
//! go cold are packed into page-sized buffers and written back to a
//! secondary backing store, then fetched back on demand:
//!   resident (compressed) → under writeback → written back → prefetching → resident
//!
//! Background "ramplus" workers keep resident usage under the configured
//! limit, restore co-located cold pages, and reserve backing space ahead of
//! demand. An axum admin surface exposes statistics and configuration.

pub mod backing;
pub mod config;
pub mod device;
pub mod ramplus;
pub mod server;
pub mod stats;
pub mod table;

pub use device::{WritebackMode, Zram, ZramError};

/// Size of one logical page and one backing block.
pub const PAGE_SIZE: usize = 4096;

/// Smallest logical block size a device may be configured with.
pub const SECTOR_SIZE: usize = 512;

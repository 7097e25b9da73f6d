//! Per-page bookkeeping for the device.
//!
//! - [`slot`]: the slot table, per-slot state and the `LOCKED` bit lock
//! - [`lru`]: recency list of resident slots used to pick writeback victims
//! - [`compressor`]: page compression backends selected by name
//! - [`zpool`]: the object pool holding compressed payloads

pub mod compressor;
pub mod lru;
pub mod slot;
pub mod zpool;

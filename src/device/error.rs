use thiserror::Error;

use crate::backing::bitmap::BitmapError;
use crate::backing::store::BackingError;
use crate::table::compressor::CompressionError;
use crate::table::zpool::PoolError;

/// Errors returned by device operations. Every one is scoped to a single
/// request or batch.
#[derive(Error, Debug)]
pub enum ZramError {
    #[error("Allocation failed: {0}")]
    AllocationFailure(String),

    #[error("Invalid I/O: {0}")]
    InvalidIo(String),

    #[error("Writeback I/O failed: {0}")]
    WritebackIoFailure(String),

    #[error("Prefetch of slot {index} failed: {reason}")]
    PrefetchIoFailure { index: u32, reason: String },

    #[error("Configuration conflict: {0}")]
    ConfigurationConflict(&'static str),

    #[error("Memory limit exceeded: {used} bytes used, {requested} requested, limit {limit}")]
    OverLimit { used: u64, requested: u64, limit: u64 },

    #[error("No backing store attached")]
    NoBackingStore,

    #[error("Compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Backing store error: {0}")]
    Backing(#[from] BackingError),
}

impl From<PoolError> for ZramError {
    fn from(e: PoolError) -> Self {
        ZramError::AllocationFailure(e.to_string())
    }
}

impl From<BitmapError> for ZramError {
    fn from(e: BitmapError) -> Self {
        ZramError::AllocationFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ZramError>;

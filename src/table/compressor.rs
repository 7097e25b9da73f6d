//! Page compression backends.
//!
//! Backends are selected by name when the device is configured. A page
//! whose compressed form reaches the huge threshold is stored raw, so
//! `decompress` is only ever handed payloads smaller than a page.

use std::sync::Arc;

use thiserror::Error;

use crate::config::CompressionConfig;
use crate::PAGE_SIZE;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd codec failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Unknown compression backend: {0}")]
    UnknownBackend(String),

    #[error("Decompressed {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Names accepted by [`compressor_by_name`].
pub const BACKENDS: &[&str] = &["zstd", "raw"];

/// A page compressor.
pub trait PageCompressor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compress one page.
    fn compress(&self, page: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Decompress a payload into a page-sized buffer.
    fn decompress(&self, payload: &[u8], page: &mut [u8]) -> Result<(), CompressionError>;
}

/// zstd block compression.
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl PageCompressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, page: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(zstd::bulk::compress(page, self.level)?)
    }

    fn decompress(&self, payload: &[u8], page: &mut [u8]) -> Result<(), CompressionError> {
        let out = zstd::bulk::decompress(payload, PAGE_SIZE)?;
        if out.len() != page.len() {
            return Err(CompressionError::SizeMismatch {
                expected: page.len(),
                actual: out.len(),
            });
        }
        page.copy_from_slice(&out);
        Ok(())
    }
}

/// Identity backend; every page ends up stored raw.
pub struct RawCompressor;

impl PageCompressor for RawCompressor {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn compress(&self, page: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(page.to_vec())
    }

    fn decompress(&self, payload: &[u8], page: &mut [u8]) -> Result<(), CompressionError> {
        if payload.len() != page.len() {
            return Err(CompressionError::SizeMismatch {
                expected: page.len(),
                actual: payload.len(),
            });
        }
        page.copy_from_slice(payload);
        Ok(())
    }
}

/// Build a backend from its configured name.
pub fn compressor_by_name(
    name: &str,
    config: &CompressionConfig,
) -> Result<Arc<dyn PageCompressor>, CompressionError> {
    match name {
        "zstd" => Ok(Arc::new(ZstdCompressor::new(config.zstd_level))),
        "raw" => Ok(Arc::new(RawCompressor)),
        other => Err(CompressionError::UnknownBackend(other.to_string())),
    }
}

/// If every machine word of the page is identical, return that word.
pub fn same_element(page: &[u8]) -> Option<u64> {
    let mut words = page
        .chunks_exact(8)
        .map(|w| u64::from_ne_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]));
    let first = words.next()?;
    words.all(|w| w == first).then_some(first)
}

/// Fill a page with one repeated machine word.
pub fn fill_element(page: &mut [u8], element: u64) {
    let bytes = element.to_ne_bytes();
    for chunk in page.chunks_exact_mut(8) {
        chunk.copy_from_slice(&bytes);
    }
}

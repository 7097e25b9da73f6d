//! Runtime configuration for zram-plus.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Device geometry, memory limits, writeback knobs and worker cadence live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::backing::batcher::WB_HEADER_SIZE;
use crate::{PAGE_SIZE, SECTOR_SIZE};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "zram-plus", about = "Compressed RAM block device with backing-store writeback")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address for the admin surface.
    #[arg(long, default_value = "127.0.0.1:8090")]
    pub listen: String,

    /// Backing file for written-back pages (overrides the config file).
    #[arg(long)]
    pub backing: Option<PathBuf>,

    /// Device size in bytes (overrides the config file).
    #[arg(long)]
    pub disksize: Option<u64>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin server configuration.
    pub server: ServerConfig,

    /// Device geometry and memory budget.
    pub device: DeviceConfig,

    /// Compression settings.
    pub compression: CompressionConfig,

    /// Backing store and writeback policy.
    pub writeback: WritebackConfig,

    /// Background worker cadence.
    pub ramplus: RamplusConfig,
}

/// Admin HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8090").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8090".to_string(),
        }
    }
}

/// Device-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device size in bytes. Zero leaves the device uninitialised at startup.
    pub disksize: u64,

    /// Logical block size; requests must be aligned to it (512 or 4096).
    pub logical_block_size: usize,

    /// Compression backend name.
    pub compressor: String,

    /// Compressed sizes at or above this are stored raw and flagged huge.
    pub huge_threshold: usize,

    /// Resident compressed bytes allowed (0 = unlimited).
    pub mem_limit: u64,

    /// Object pool capacity in bytes (0 = unlimited).
    pub pool_capacity: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            disksize: 0,
            logical_block_size: PAGE_SIZE,
            compressor: "zstd".to_string(),
            huge_threshold: PAGE_SIZE * 3 / 4,
            mem_limit: 0,
            pool_capacity: 0,
        }
    }
}

/// Compression tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { zstd_level: 1 }
    }
}

/// Backing store and writeback policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WritebackConfig {
    /// Backing file path (optional; without it there is no writeback).
    pub backing_path: Option<PathBuf>,

    /// Number of page-sized blocks in the backing file.
    pub backing_blocks: u32,

    /// Resident bytes the LRU writeback worker drains down to (0 = derive
    /// from the memory limit).
    pub lru_limit: u64,

    /// Maximum pages selected per LRU writeback cycle.
    pub lru_batch_pages: usize,

    /// Bytes that may be written back before writeback stops (None = unlimited).
    pub wb_limit: Option<u64>,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            backing_path: None,
            backing_blocks: 64 * 1024, // 256 MB
            lru_limit: 0,
            lru_batch_pages: 2048,
            wb_limit: None,
        }
    }
}

/// Background worker cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RamplusConfig {
    /// Prefetch worker periodic wake-up in milliseconds.
    pub prefetch_interval_ms: u64,

    /// LRU writeback worker periodic wake-up in milliseconds.
    pub lru_interval_ms: u64,

    /// Writeback worker periodic wake-up in milliseconds.
    pub writeback_interval_ms: u64,

    /// Pool worker periodic wake-up in milliseconds.
    pub pool_interval_ms: u64,

    /// Maximum queued batches a worker pops per wake-up.
    pub frame_limit: usize,

    /// Pool worker keeps at least this many chunks reserved.
    pub pool_min_chunks: usize,

    /// Pool worker never reserves more than this many chunks.
    pub pool_max_chunks: usize,
}

impl Default for RamplusConfig {
    fn default() -> Self {
        Self {
            prefetch_interval_ms: 1000,
            lru_interval_ms: 500,
            writeback_interval_ms: 1000,
            pool_interval_ms: 2000,
            frame_limit: 16,
            pool_min_chunks: 8,
            pool_max_chunks: 64,
        }
    }
}

impl RamplusConfig {
    pub fn prefetch_interval(&self) -> Duration {
        Duration::from_millis(self.prefetch_interval_ms)
    }

    pub fn lru_interval(&self) -> Duration {
        Duration::from_millis(self.lru_interval_ms)
    }

    pub fn writeback_interval(&self) -> Duration {
        Duration::from_millis(self.writeback_interval_ms)
    }

    pub fn pool_interval(&self) -> Duration {
        Duration::from_millis(self.pool_interval_ms)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        self.server.listen = cli.listen.clone();
        if let Some(path) = &cli.backing {
            self.writeback.backing_path = Some(path.clone());
        }
        if let Some(size) = cli.disksize {
            self.device.disksize = size;
        }
    }

    /// Reject settings the device cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        let lbs = self.device.logical_block_size;
        if lbs != SECTOR_SIZE && lbs != PAGE_SIZE {
            anyhow::bail!("logical_block_size must be {SECTOR_SIZE} or {PAGE_SIZE}, got {lbs}");
        }
        // A packed payload plus its header must always fit in one block.
        if self.device.huge_threshold == 0 || self.device.huge_threshold > PAGE_SIZE - WB_HEADER_SIZE {
            anyhow::bail!(
                "huge_threshold must be in 1..={}, got {}",
                PAGE_SIZE - WB_HEADER_SIZE,
                self.device.huge_threshold
            );
        }
        if self.ramplus.pool_min_chunks > self.ramplus.pool_max_chunks {
            anyhow::bail!("pool_min_chunks exceeds pool_max_chunks");
        }
        if self.ramplus.frame_limit == 0 {
            anyhow::bail!("frame_limit must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.device.compressor, "zstd");
        assert_eq!(cfg.device.logical_block_size, PAGE_SIZE);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"device": {"disksize": 1048576}}"#).unwrap();
        assert_eq!(cfg.device.disksize, 1 << 20);
        assert_eq!(cfg.device.huge_threshold, PAGE_SIZE * 3 / 4);
        assert_eq!(cfg.ramplus.pool_max_chunks, 64);
    }

    #[test]
    fn test_rejects_oversized_huge_threshold() {
        let mut cfg = Config::default();
        cfg.device.huge_threshold = PAGE_SIZE;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_odd_block_size() {
        let mut cfg = Config::default();
        cfg.device.logical_block_size = 1024;
        assert!(cfg.validate().is_err());
    }
}

//! Processing configuration.
//!
//! A `ProcessingConfig` is a read-only snapshot consumed by the coordinator.
//! It is built with `with_*` methods or loaded from TOML; missing keys take
//! their defaults.
//!
//! ```toml
//! memory_threshold_bytes = 268435456
//! max_tile_size = 256
//! tile_overlap = 16
//! mode = "auto"
//! ```

use crate::core::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

const MIB: usize = 1024 * 1024;

/// Default memory threshold (512 MiB).
pub const DEFAULT_MEMORY_THRESHOLD: usize = 512 * MIB;

/// Default tile edge in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 512;

/// Default tile overlap in pixels.
pub const DEFAULT_TILE_OVERLAP: u32 = 16;

/// Default result cache budget (256 MiB).
pub const DEFAULT_CACHE_BYTES: usize = 256 * MIB;

/// Default initial pool arena size (64 MiB).
pub const DEFAULT_POOL_INITIAL_BYTES: usize = 64 * MIB;

/// How the coordinator chooses between direct and tiled processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Tile when the footprint estimate or memory pressure demands it.
    #[default]
    Auto,
    /// Always go through the tile engine.
    ForceTiled,
    /// Never tile.
    ForceDirect,
}

/// Configuration for the tiled processing coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Memory budget in bytes; images whose footprint exceeds half of it are tiled.
    pub memory_threshold_bytes: usize,
    /// Tile edge length in pixels.
    pub max_tile_size: u32,
    /// Redundant pixels shared across each internal seam.
    pub tile_overlap: u32,
    /// Result cache budget in bytes.
    pub max_cache_bytes: usize,
    /// Initial arena size of the memory pool.
    pub pool_initial_bytes: usize,
    /// Tile worker threads (0 = one per core).
    pub worker_threads: usize,
    /// Direct/tiled routing policy.
    pub mode: ProcessingMode,
    /// Run the background memory monitor.
    pub monitor_enabled: bool,
    /// Memory monitor period.
    pub monitor_interval_ms: u64,
    /// Routine housekeeping period.
    pub housekeeping_interval_ms: u64,
    /// Cached results older than this are dropped during housekeeping.
    pub cache_ttl_secs: u64,
    /// Factor applied to the cache budget under memory pressure.
    pub cache_shrink_factor: f64,
    /// Free pooled blocks above this size are purged under memory pressure.
    pub large_block_bytes: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: DEFAULT_MEMORY_THRESHOLD,
            max_tile_size: DEFAULT_TILE_SIZE,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            max_cache_bytes: DEFAULT_CACHE_BYTES,
            pool_initial_bytes: DEFAULT_POOL_INITIAL_BYTES,
            worker_threads: 0,
            mode: ProcessingMode::Auto,
            monitor_enabled: true,
            monitor_interval_ms: 5_000,
            housekeeping_interval_ms: 30_000,
            cache_ttl_secs: 3_600,
            cache_shrink_factor: 0.75,
            large_block_bytes: 16 * MIB,
        }
    }
}

impl ProcessingConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory threshold in bytes.
    pub fn with_memory_threshold(mut self, bytes: usize) -> Self {
        self.memory_threshold_bytes = bytes;
        self
    }

    /// Set the memory threshold in megabytes.
    pub fn with_memory_threshold_mb(mut self, mb: usize) -> Self {
        self.memory_threshold_bytes = mb.saturating_mul(MIB);
        self
    }

    /// Set the tile edge length.
    pub fn with_tile_size(mut self, size: u32) -> Self {
        self.max_tile_size = size;
        self
    }

    /// Set the tile overlap.
    pub fn with_overlap(mut self, overlap: u32) -> Self {
        self.tile_overlap = overlap;
        self
    }

    /// Set the result cache budget.
    pub fn with_cache_bytes(mut self, bytes: usize) -> Self {
        self.max_cache_bytes = bytes;
        self
    }

    /// Set the initial pool size.
    pub fn with_pool_bytes(mut self, bytes: usize) -> Self {
        self.pool_initial_bytes = bytes;
        self
    }

    /// Set the number of tile worker threads.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the routing mode.
    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enable or disable the background monitor.
    pub fn with_monitor(mut self, enabled: bool) -> Self {
        self.monitor_enabled = enabled;
        self
    }

    /// Set both maintenance periods.
    pub fn with_intervals(mut self, monitor_ms: u64, housekeeping_ms: u64) -> Self {
        self.monitor_interval_ms = monitor_ms;
        self.housekeeping_interval_ms = housekeeping_ms;
        self
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ProcessingConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check that the values are usable together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tile_size == 0 {
            return Err(ConfigError::Invalid("max_tile_size must be non-zero".into()));
        }
        if self.tile_overlap >= self.max_tile_size {
            return Err(ConfigError::Invalid(format!(
                "tile_overlap {} must be smaller than max_tile_size {}",
                self.tile_overlap, self.max_tile_size
            )));
        }
        if !(self.cache_shrink_factor > 0.0 && self.cache_shrink_factor <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "cache_shrink_factor {} must be in (0, 1]",
                self.cache_shrink_factor
            )));
        }
        if self.monitor_interval_ms == 0 || self.housekeeping_interval_ms == 0 {
            return Err(ConfigError::Invalid("maintenance intervals must be non-zero".into()));
        }
        if self.memory_threshold_bytes == 0 {
            return Err(ConfigError::Invalid("memory_threshold_bytes must be non-zero".into()));
        }
        Ok(())
    }

    /// Footprint above which the automatic mode tiles.
    pub fn tiling_threshold(&self) -> usize {
        self.memory_threshold_bytes / 2
    }
}

//! Configuration for StrataKV
//!
//! Centralized configuration with sensible defaults. There is no CLI surface;
//! knobs are consumed as plain parameters by the RepoManager and the
//! background tasks it spawns.

use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a StrataKV store instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files (block files, catalog).
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── blocks_fast.dat   (fast-tier block file)
    ///     ├── blocks_slow.dat   (slow-tier block file)
    ///     └── catalog.dat       (file catalog)
    pub data_dir: PathBuf,

    /// Whether rotated memory layers are flushed to disk. When false the
    /// store runs as a "fast" repo: rotated layers stay resident as memory
    /// data layers and nothing is persisted.
    pub durable: bool,

    // -------------------------------------------------------------------------
    // Background Task Configuration
    // -------------------------------------------------------------------------
    /// Writer task period: how long the Writer sleeps between rotation checks
    /// when no insert has signalled it.
    pub write_delay: Duration,

    /// Merger task period.
    pub merge_delay: Duration,

    /// LayerCleaner task period.
    pub layer_cleaning_interval: Duration,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Number of disk layers in one size tier that triggers a merge.
    pub merge_trigger: usize,

    /// Number of pending (rotated but unflushed) memory layers that triggers
    /// a consolidating flush pass in one Writer wakeup.
    pub temp_file_consolidation_threshold: usize,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Max bytes of open SortedFile reader state kept resident (blockmaps).
    pub max_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./stratakv_data"),
            durable: true,
            write_delay: Duration::from_millis(250),
            merge_delay: Duration::from_millis(500),
            layer_cleaning_interval: Duration::from_millis(500),
            merge_trigger: 3,
            temp_file_consolidation_threshold: 4,
            max_cache_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set whether rotated memory layers are flushed to disk
    pub fn durable(mut self, durable: bool) -> Self {
        self.config.durable = durable;
        self
    }

    /// Set the Writer task period
    pub fn write_delay(mut self, delay: Duration) -> Self {
        self.config.write_delay = delay;
        self
    }

    /// Set the Merger task period
    pub fn merge_delay(mut self, delay: Duration) -> Self {
        self.config.merge_delay = delay;
        self
    }

    /// Set the LayerCleaner task period
    pub fn layer_cleaning_interval(mut self, interval: Duration) -> Self {
        self.config.layer_cleaning_interval = interval;
        self
    }

    /// Set the per-tier merge trigger (minimum layers per tier)
    pub fn merge_trigger(mut self, count: usize) -> Self {
        self.config.merge_trigger = count;
        self
    }

    /// Set the pending-memory-layer consolidation threshold
    pub fn temp_file_consolidation_threshold(mut self, count: usize) -> Self {
        self.config.temp_file_consolidation_threshold = count;
        self
    }

    /// Set the reader-state cache budget (in bytes)
    pub fn max_cache_size(mut self, size: usize) -> Self {
        self.config.max_cache_size = size;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

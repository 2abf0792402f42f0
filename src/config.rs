//! Configuration for Strata
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{Result, StrataError};

/// Main configuration for a Strata engine instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── blocks.dat        (append-only block log)
    ///     └── superblocks.log   (superblock journal)
    pub data_dir: PathBuf,

    /// Block cache capacity, measured in blocks
    pub datablock_cache_size: usize,

    /// Sync strategy: when to fsync block and superblock files
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Transaction Coalescing
    // -------------------------------------------------------------------------
    /// Group inserts per stream into periodic commits
    pub transaction_coalesce_enable: bool,

    /// How long a buffer stays open before the timer commits it (milliseconds)
    pub transaction_coalesce_interval_ms: u64,

    /// Buffered record count that forces a synchronous commit
    pub transaction_coalesce_early_trip: usize,
}

/// Storage sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync block and superblock writes at every commit (durable)
    EveryCommit,

    /// Leave flushing to the OS page cache (fast, loses the tail on power failure)
    OsBuffered,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./strata_data"),
            datablock_cache_size: 65526,
            sync_strategy: SyncStrategy::EveryCommit,
            transaction_coalesce_enable: true,
            transaction_coalesce_interval_ms: 5000,
            transaction_coalesce_early_trip: 16384,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.datablock_cache_size == 0 {
            return Err(StrataError::Config(
                "datablock_cache_size must be at least 1".to_string(),
            ));
        }
        if self.transaction_coalesce_early_trip == 0 {
            return Err(StrataError::Config(
                "transaction_coalesce_early_trip must be at least 1".to_string(),
            ));
        }
        if self.transaction_coalesce_enable && self.transaction_coalesce_interval_ms == 0 {
            return Err(StrataError::Config(
                "transaction_coalesce_interval_ms must be non-zero when coalescing".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether commits fsync before returning
    pub fn sync_on_commit(&self) -> bool {
        self.sync_strategy == SyncStrategy::EveryCommit
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

    /// Set the block cache capacity (in blocks)
    pub fn datablock_cache_size(mut self, blocks: usize) -> Self {
        self.config.datablock_cache_size = blocks;
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Enable or disable transaction coalescing
    pub fn transaction_coalesce_enable(mut self, enable: bool) -> Self {
        self.config.transaction_coalesce_enable = enable;
        self
    }

    /// Set the coalesce interval (in milliseconds)
    pub fn transaction_coalesce_interval_ms(mut self, ms: u64) -> Self {
        self.config.transaction_coalesce_interval_ms = ms;
        self
    }

    /// Set the early-trip record count
    pub fn transaction_coalesce_early_trip(mut self, records: usize) -> Self {
        self.config.transaction_coalesce_early_trip = records;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

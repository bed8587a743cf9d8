//! Storage engine - named blocks under one data directory

mod database;
mod engine;

pub use database::{Database, DatabaseMeta, DatabaseStats};
pub use engine::{EngineStats, StorageEngine};

use crate::block::BlockConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory, one subdirectory per database
    pub data_dir: PathBuf,
    /// Requested segment size for newly created databases
    pub segment_size: usize,
    /// Period of the background sync
    pub sync_period: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            segment_size: crate::config::SEGMENT_SIZE,
            sync_period: Duration::from_millis(crate::config::SYNC_PERIOD_MS),
        }
    }
}

impl StorageConfig {
    /// Block configuration for new databases
    pub fn block_config(&self) -> BlockConfig {
        BlockConfig {
            segment_size: self.segment_size,
        }
    }
}

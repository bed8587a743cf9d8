//! Database - one named block plus its metadata

use crate::block::{Block, BlockConfig};
use crate::point::POINT_SIZE;
use crate::{Point, Result, TallyError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const META_FILE: &str = "meta.json";

/// Parameters persisted next to a database's segment files.
///
/// Only the registry reads this; the block itself is told its record and
/// segment size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMeta {
    /// Points per record
    pub record_size: usize,
    /// Effective segment size in bytes
    pub segment_size: usize,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl DatabaseMeta {
    /// Read and validate the metadata of the database in `dir`
    pub fn read(dir: &Path) -> Result<Self> {
        let data = fs::read(dir.join(META_FILE))?;
        let meta: Self = serde_json::from_slice(&data)
            .map_err(|e| TallyError::InvalidFormat(format!("{}: {}", META_FILE, e)))?;

        let rbs = meta.record_size.checked_mul(POINT_SIZE).unwrap_or(0);
        if rbs == 0 || meta.segment_size == 0 || meta.segment_size % rbs != 0 {
            return Err(TallyError::InvalidFormat(format!(
                "{}: segment size {} does not hold whole records of {} points",
                META_FILE, meta.segment_size, meta.record_size
            )));
        }
        Ok(meta)
    }

    fn write(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| TallyError::Internal(format!("encode {}: {}", META_FILE, e)))?;

        let tmp = dir.join(format!("{}.tmp", META_FILE));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, dir.join(META_FILE))?;
        Ok(())
    }

    /// Block configuration reproducing the persisted layout
    pub fn block_config(&self) -> BlockConfig {
        BlockConfig {
            segment_size: self.segment_size,
        }
    }

    /// Check whether `dir` holds database metadata
    pub fn exists(dir: &Path) -> bool {
        dir.join(META_FILE).is_file()
    }
}

/// A single TallyDB database
pub struct Database {
    name: String,
    dir: PathBuf,
    meta: DatabaseMeta,
    block: Block,
}

impl Database {
    /// Create a new database directory under `data_dir`
    pub fn create(
        name: &str,
        data_dir: &Path,
        record_size: usize,
        config: &BlockConfig,
    ) -> Result<Self> {
        let dir = data_dir.join(name);
        if DatabaseMeta::exists(&dir) {
            return Err(TallyError::Config(format!("Database {} already exists", name)));
        }

        let segment_size = config.effective_segment_size(record_size)?;
        fs::create_dir_all(&dir)?;

        let meta = DatabaseMeta {
            record_size,
            segment_size,
            created_at: Utc::now(),
        };
        meta.write(&dir)?;

        info!(
            "Created database {} ({} points per record, {} byte segments)",
            name, record_size, segment_size
        );
        Self::open_with_meta(name, dir, meta)
    }

    /// Open an existing database directory under `data_dir`
    pub fn open(name: &str, data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join(name);
        let meta = DatabaseMeta::read(&dir)?;
        Self::open_with_meta(name, dir, meta)
    }

    fn open_with_meta(name: &str, dir: PathBuf, meta: DatabaseMeta) -> Result<Self> {
        let block = Block::open_with_config(&dir, meta.record_size, meta.block_config())?;

        Ok(Self {
            name: name.to_string(),
            dir,
            meta,
            block,
        })
    }

    /// Get database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persisted metadata
    pub fn meta(&self) -> &DatabaseMeta {
        &self.meta
    }

    /// Underlying block
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Accumulate into one point
    pub fn track(&self, record: usize, point: usize, total: f64, count: u64) -> Result<()> {
        self.block.track(record, point, total, count)
    }

    /// Copy records `[from, to)` out of the block
    pub fn fetch(&self, from: usize, to: usize) -> Result<Vec<Vec<Point>>> {
        let records = self.block.fetch(from, to)?;
        Ok(records.iter().map(|r| r.to_vec()).collect())
    }

    /// Flush dirty segments
    pub fn sync(&self) -> Result<()> {
        self.block.sync()
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            name: self.name.clone(),
            record_size: self.meta.record_size,
            records: self.block.len(),
            segments: self.block.segment_count(),
            mapped_bytes: self.block.mapped_len() as u64,
            dirty_segments: self.block.dirty_segments(),
        }
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub name: String,
    pub record_size: usize,
    pub records: usize,
    pub segments: usize,
    pub mapped_bytes: u64,
    pub dirty_segments: usize,
}

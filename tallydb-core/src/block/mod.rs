//! Block - memory-mapped aggregation storage
//!
//! A block is a growable array of records, each record a fixed number of
//! points, living directly in mapped segment memory. `track` adds a sample
//! into one point in place; addressing a record past the end grows the block
//! by whole segments first.
//!
//! # Concurrency
//!
//! - The segment store sits behind a mutex that is only held while growing
//!   and publishing a rebuilt [`RecordCache`].
//! - The current cache is an `Arc` snapshot. Growth only appends segments and
//!   every snapshot keeps its segments alive, so views taken before a growth
//!   stay valid; they just do not cover the new records.
//! - Each point read-modify-write holds one of [`config::LOCK_STRIPES`]
//!   stripe locks. `sync` holds all of them while flushing, so a flush never
//!   sees a half-applied accumulation.
//!
//! [`config::LOCK_STRIPES`]: crate::config::LOCK_STRIPES

mod cache;
mod stripes;

pub use cache::RecordCache;

use crate::point::{AtomicPoint, POINT_SIZE};
use crate::segment::{MmapStore, Segment, SegmentStore};
use crate::{Point, Result, TallyError};
use cache::MappedSegment;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use stripes::Stripes;
use tracing::{debug, info, warn};

/// Block configuration
#[derive(Debug, Clone)]
pub struct BlockConfig {
    /// Requested segment size in bytes
    pub segment_size: usize,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            segment_size: crate::config::SEGMENT_SIZE,
        }
    }
}

impl BlockConfig {
    /// Segment size actually used for records of `record_size` points: the
    /// requested size rounded down to whole records, at least one record.
    pub fn effective_segment_size(&self, record_size: usize) -> Result<usize> {
        let rbs = record_bytes(record_size)?;
        Ok((self.segment_size / rbs).max(1) * rbs)
    }
}

fn record_bytes(record_size: usize) -> Result<usize> {
    if record_size == 0 {
        return Err(TallyError::Config("record size must be positive".into()));
    }
    record_size
        .checked_mul(POINT_SIZE)
        .ok_or_else(|| TallyError::Config(format!("record size {} is too large", record_size)))
}

/// A memory-mapped block of records
pub struct Block<S: SegmentStore = MmapStore> {
    record_size: usize,
    rbs: usize,
    store: Mutex<S>,
    cache: RwLock<Arc<RecordCache<S::Segment>>>,
    stripes: Stripes,
}

impl Block<MmapStore> {
    /// Open or create a block in `dir` with the default configuration
    pub fn open(dir: impl AsRef<Path>, record_size: usize) -> Result<Self> {
        Self::open_with_config(dir, record_size, BlockConfig::default())
    }

    /// Open or create a block in `dir`
    pub fn open_with_config(
        dir: impl AsRef<Path>,
        record_size: usize,
        config: BlockConfig,
    ) -> Result<Self> {
        let segment_size = config.effective_segment_size(record_size)?;
        let store = MmapStore::open(dir, segment_size)?;
        Self::with_store(store, record_size)
    }

    /// Open a block that must already exist, without creating or repairing
    /// segment files. Opening with the wrong layout fails instead of
    /// rewriting the files to fit it.
    pub fn open_existing(
        dir: impl AsRef<Path>,
        record_size: usize,
        config: BlockConfig,
    ) -> Result<Self> {
        let segment_size = config.effective_segment_size(record_size)?;
        let store = MmapStore::open_existing(dir, segment_size)?;
        Self::with_store(store, record_size)
    }
}

impl<S: SegmentStore> Block<S> {
    /// Build a block over an already opened segment store
    pub fn with_store(store: S, record_size: usize) -> Result<Self> {
        let rbs = record_bytes(record_size)?;
        let segment_size = store.segment_size();
        if segment_size == 0 || segment_size % rbs != 0 {
            return Err(TallyError::Config(format!(
                "segment size {} is not a multiple of the record size {} bytes",
                segment_size, rbs
            )));
        }

        let segments = store
            .segments()
            .iter()
            .cloned()
            .map(|s| Arc::new(MappedSegment::new(s)))
            .collect();
        let cache = RecordCache::rebuild(segments, record_size);

        info!(
            "Opened block: {} records of {} points, {} segments",
            cache.len(),
            record_size,
            cache.segment_count()
        );

        Ok(Self {
            record_size,
            rbs,
            store: Mutex::new(store),
            cache: RwLock::new(Arc::new(cache)),
            stripes: Stripes::new(crate::config::LOCK_STRIPES, record_size),
        })
    }

    /// Points per record
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Segment size in bytes
    pub fn segment_size(&self) -> usize {
        self.store.lock().segment_size()
    }

    /// Number of records currently mapped
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Check if no segment has been allocated yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of segments currently mapped
    pub fn segment_count(&self) -> usize {
        self.snapshot().segment_count()
    }

    /// Mapped size in bytes
    pub fn mapped_len(&self) -> usize {
        self.snapshot().len() * self.rbs
    }

    /// Number of segments with unsynced writes
    pub fn dirty_segments(&self) -> usize {
        self.snapshot()
            .segments()
            .iter()
            .filter(|s| s.is_dirty())
            .count()
    }

    /// Add `total` and `count` into point `point` of record `record`,
    /// growing the block first when `record` is past the end.
    pub fn track(&self, record: usize, point: usize, total: f64, count: u64) -> Result<()> {
        self.check_point(point)?;

        let cache = self.ensure(record)?;
        let cell = Self::cell(&cache, record, point)?;

        let _guard = self.stripes.lock(record, point);
        cell.accumulate(total, count);
        cache.segment_of(record).mark_dirty();

        Ok(())
    }

    /// Read one point. Records past the end read as zero; no growth happens.
    pub fn point(&self, record: usize, point: usize) -> Result<Point> {
        self.check_point(point)?;

        let cache = self.snapshot();
        if record >= cache.len() {
            return Ok(Point::default());
        }

        let cell = Self::cell(&cache, record, point)?;
        let _guard = self.stripes.lock(record, point);
        Ok(cell.load())
    }

    /// Records in `[from, to)`, clamped to the current length
    pub fn fetch(&self, from: usize, to: usize) -> Result<Records<'_, S::Segment>> {
        if from > to {
            return Err(TallyError::OutOfRange(format!(
                "invalid record range {}..{}",
                from, to
            )));
        }

        let cache = self.snapshot();
        let to = to.min(cache.len());
        let from = from.min(to);

        Ok(Records {
            cache,
            stripes: &self.stripes,
            from,
            to,
        })
    }

    /// Flush every dirty segment. Nothing dirty is a no-op.
    pub fn sync(&self) -> Result<()> {
        let cache = self.snapshot();
        let _guards = self.stripes.lock_all();

        let mut flushed = 0;
        for mapped in cache.segments() {
            if !mapped.take_dirty() {
                continue;
            }
            if let Err(e) = mapped.segment().flush() {
                mapped.mark_dirty();
                return Err(e);
            }
            flushed += 1;
        }

        if flushed > 0 {
            debug!("Synced {} block segments", flushed);
        }
        Ok(())
    }

    /// Sync and release the block
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    fn check_point(&self, point: usize) -> Result<()> {
        if point >= self.record_size {
            return Err(TallyError::OutOfRange(format!(
                "point {} outside record of {} points",
                point, self.record_size
            )));
        }
        Ok(())
    }

    fn cell(cache: &RecordCache<S::Segment>, record: usize, point: usize) -> Result<&AtomicPoint> {
        cache
            .record(record)
            .and_then(|r| r.get(point))
            .ok_or_else(|| {
                TallyError::Internal(format!("point {}/{} missing after growth", record, point))
            })
    }

    fn snapshot(&self) -> Arc<RecordCache<S::Segment>> {
        self.cache.read().clone()
    }

    /// Snapshot covering `record`, growing if needed
    fn ensure(&self, record: usize) -> Result<Arc<RecordCache<S::Segment>>> {
        let cache = self.snapshot();
        if record < cache.len() {
            return Ok(cache);
        }
        self.grow(record)
    }

    fn grow(&self, record: usize) -> Result<Arc<RecordCache<S::Segment>>> {
        let need = record
            .checked_add(1)
            .and_then(|n| n.checked_mul(self.rbs))
            .ok_or_else(|| TallyError::OutOfRange(format!("record {} is not addressable", record)))?;

        let mut store = self.store.lock();

        // Another writer may have grown the block while we waited
        let current = self.snapshot();
        if record < current.len() {
            return Ok(current);
        }

        let have = store.segments().len();
        let target = need.div_ceil(store.segment_size());
        let result = store.extend(target - have);

        let added = store.segments().len() - have;
        if added == 0 {
            return result.map(|_| current);
        }

        let mut segments = current.segments().to_vec();
        segments.extend(
            store.segments()[have..]
                .iter()
                .cloned()
                .map(|s| Arc::new(MappedSegment::new(s))),
        );
        let rebuilt = Arc::new(RecordCache::rebuild(segments, self.record_size));
        *self.cache.write() = rebuilt.clone();

        match result {
            Ok(()) => {
                info!(
                    "Grew block by {} segments to {} records",
                    added,
                    rebuilt.len()
                );
                Ok(rebuilt)
            }
            Err(e) => {
                warn!(
                    "Block growth stopped after {} of {} segments: {}",
                    added,
                    target - have,
                    e
                );
                Err(e)
            }
        }
    }
}

/// Read-only snapshot of a record range
pub struct Records<'a, S> {
    cache: Arc<RecordCache<S>>,
    stripes: &'a Stripes,
    from: usize,
    to: usize,
}

impl<'a, S: Segment> Records<'a, S> {
    /// Index of the first record
    pub fn start(&self) -> usize {
        self.from
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.to - self.from
    }

    /// Check if the range is empty
    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }

    /// The `i`-th record of the range
    pub fn get(&self, i: usize) -> Option<RecordView<'_>> {
        let index = self.from.checked_add(i).filter(|index| *index < self.to)?;
        let points = self.cache.record(index)?;
        Some(RecordView {
            index,
            points,
            stripes: self.stripes,
        })
    }

    /// Iterate over the records of the range
    pub fn iter(&self) -> impl Iterator<Item = RecordView<'_>> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

/// Read-only view of one record
pub struct RecordView<'a> {
    index: usize,
    points: &'a [AtomicPoint],
    stripes: &'a Stripes,
}

impl<'a> RecordView<'a> {
    /// Record index within the block
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the record has no points
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Read point `i`
    pub fn point(&self, i: usize) -> Option<Point> {
        let cell = self.points.get(i)?;
        let _guard = self.stripes.lock(self.index, i);
        Some(cell.load())
    }

    /// Iterate over the points
    pub fn iter(&self) -> impl Iterator<Item = Point> + '_ {
        (0..self.points.len()).filter_map(move |i| self.point(i))
    }

    /// Copy the points out
    pub fn to_vec(&self) -> Vec<Point> {
        self.iter().collect()
    }
}

//! Memory-mapped segment files
//!
//! Each segment is a file named `seg_{index:020}.blk` holding exactly
//! `segment_size` bytes. New files are created zero-filled (sparse where the
//! filesystem allows it) and mapped read-write.

use super::{Segment, SegmentStore};
use crate::{Result, TallyError};
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{info, warn};

const SEGMENT_PREFIX: &str = "seg_";
const SEGMENT_SUFFIX: &str = ".blk";

/// A read-write mapping of one segment file
pub struct MmapSegment {
    mmap: MmapMut,
    ptr: NonNull<u8>,
    path: PathBuf,
}

// SAFETY: `ptr` is the base of `mmap`, which is owned by this value and is
// only unmapped on drop. Concurrent access goes through atomics.
unsafe impl Send for MmapSegment {}
unsafe impl Sync for MmapSegment {}

impl MmapSegment {
    /// Create a new zero-filled segment file and map it
    fn create(path: PathBuf, size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mapped = file
            .set_len(size as u64)
            .and_then(|_| file.sync_all())
            .map_err(TallyError::from)
            .and_then(|_| Self::map(&file, path.clone()));

        if mapped.is_err() {
            let _ = fs::remove_file(&path);
        }
        mapped
    }

    /// Map an existing segment file. A short file is only accepted when
    /// `repair` is set; it is then zero-extended to `size`.
    fn open(path: PathBuf, size: usize, repair: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();

        if len > size as u64 || (len < size as u64 && !repair) {
            return Err(TallyError::Corruption(format!(
                "segment {} is {} bytes, expected {}",
                path.display(),
                len,
                size
            )));
        }

        if len < size as u64 {
            warn!(
                "Extending truncated segment {} from {} to {} bytes",
                path.display(),
                len,
                size
            );
            file.set_len(size as u64)?;
            file.sync_all()?;
        }

        Self::map(&file, path)
    }

    fn map(file: &File, path: PathBuf) -> Result<Self> {
        // SAFETY: segment files belong to this store; nothing else is expected
        // to truncate them while they are mapped.
        let mut mmap = unsafe { MmapMut::map_mut(file)? };
        let ptr = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            TallyError::Storage(format!("empty mapping for {}", path.display()))
        })?;

        Ok(Self { mmap, ptr, path })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// SAFETY: mappings are page aligned, exactly `len` bytes, zero-filled by
// `set_len` on creation, and stay mapped until drop.
unsafe impl Segment for MmapSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.mmap.len()
    }

    fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

/// Directory of memory-mapped segment files
pub struct MmapStore {
    dir: PathBuf,
    segment_size: usize,
    segments: Vec<Arc<MmapSegment>>,
}

impl MmapStore {
    /// Open (or create) a store rooted at `dir`, mapping every existing
    /// segment file. A short last segment is zero-extended.
    pub fn open(dir: impl AsRef<Path>, segment_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Self::open_dir(dir, segment_size, true)
    }

    /// Open an existing store without changing anything on disk.
    ///
    /// The directory must exist and every segment file must already be
    /// exactly `segment_size` bytes; nothing is created or repaired.
    pub fn open_existing(dir: impl AsRef<Path>, segment_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(TallyError::Config(format!(
                "{} is not a block directory",
                dir.display()
            )));
        }
        Self::open_dir(dir, segment_size, false)
    }

    fn open_dir(dir: PathBuf, segment_size: usize, repair: bool) -> Result<Self> {
        if segment_size == 0 {
            return Err(TallyError::Config("segment size must be positive".into()));
        }

        let ids = Self::find_segments(&dir)?;
        let mut segments = Vec::with_capacity(ids.len());
        for (expected, id) in ids.iter().enumerate() {
            if *id != expected as u64 {
                return Err(TallyError::Corruption(format!(
                    "missing segment {} in {}",
                    expected,
                    dir.display()
                )));
            }

            let repair = repair && expected + 1 == ids.len();
            let path = Self::segment_path(&dir, *id);
            segments.push(Arc::new(MmapSegment::open(path, segment_size, repair)?));
        }

        if !segments.is_empty() {
            info!(
                "Mapped {} segments ({} bytes each) from {}",
                segments.len(),
                segment_size,
                dir.display()
            );
        }

        Ok(Self {
            dir,
            segment_size,
            segments,
        })
    }

    /// Directory holding the segment files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn segment_path(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("{}{:020}{}", SEGMENT_PREFIX, id, SEGMENT_SUFFIX))
    }

    fn find_segments(dir: &Path) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some(id) = name
                    .strip_prefix(SEGMENT_PREFIX)
                    .and_then(|s| s.strip_suffix(SEGMENT_SUFFIX))
                {
                    if let Ok(id) = id.parse::<u64>() {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

impl SegmentStore for MmapStore {
    type Segment = MmapSegment;

    fn segment_size(&self) -> usize {
        self.segment_size
    }

    fn segments(&self) -> &[Arc<MmapSegment>] {
        &self.segments
    }

    fn extend(&mut self, additional: usize) -> Result<()> {
        for _ in 0..additional {
            let id = self.segments.len() as u64;
            let path = Self::segment_path(&self.dir, id);
            let segment = MmapSegment::create(path, self.segment_size)?;
            self.segments.push(Arc::new(segment));
        }
        Ok(())
    }
}

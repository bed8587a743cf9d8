//! Heap-backed segment store

use super::{Segment, SegmentStore};
use crate::{Result, TallyError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A segment backed by zeroed heap memory
pub struct HeapSegment {
    words: Box<[AtomicU64]>,
    len: usize,
    flushes: AtomicUsize,
    fail_flush: Arc<AtomicBool>,
}

impl HeapSegment {
    /// Allocate a zeroed segment of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::with_flush_switch(len, Arc::new(AtomicBool::new(false)))
    }

    fn with_flush_switch(len: usize, fail_flush: Arc<AtomicBool>) -> Self {
        let words = (0..(len + 7) / 8).map(|_| AtomicU64::new(0)).collect();
        Self {
            words,
            len,
            flushes: AtomicUsize::new(0),
            fail_flush,
        }
    }

    /// Number of times this segment was flushed
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

// SAFETY: the memory is a boxed slice of atomics, 8-byte aligned, zeroed on
// creation and never reallocated. Writing through the pointer is writing
// through `UnsafeCell`s.
unsafe impl Segment for HeapSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.len
    }

    fn flush(&self) -> Result<()> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(TallyError::Storage("flush failed".into()));
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// In-memory [`SegmentStore`], optionally capped at a number of segments to
/// simulate running out of space.
pub struct MemoryStore {
    segment_size: usize,
    segments: Vec<Arc<HeapSegment>>,
    max_segments: Option<usize>,
    fail_flush: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new(segment_size: usize) -> Self {
        Self {
            segment_size,
            segments: Vec::new(),
            max_segments: None,
            fail_flush: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Switch shared by every segment of this store; while set, flushes
    /// fail with a storage error.
    pub fn flush_switch(&self) -> Arc<AtomicBool> {
        self.fail_flush.clone()
    }

    /// Create an empty store that refuses to grow past `max_segments`
    pub fn with_segment_limit(segment_size: usize, max_segments: usize) -> Self {
        Self {
            max_segments: Some(max_segments),
            ..Self::new(segment_size)
        }
    }
}

impl SegmentStore for MemoryStore {
    type Segment = HeapSegment;

    fn segment_size(&self) -> usize {
        self.segment_size
    }

    fn segments(&self) -> &[Arc<HeapSegment>] {
        &self.segments
    }

    fn extend(&mut self, additional: usize) -> Result<()> {
        for _ in 0..additional {
            if let Some(max) = self.max_segments {
                if self.segments.len() >= max {
                    return Err(TallyError::Storage(format!(
                        "segment limit of {} reached",
                        max
                    )));
                }
            }
            self.segments.push(Arc::new(HeapSegment::with_flush_switch(
                self.segment_size,
                self.fail_flush.clone(),
            )));
        }
        Ok(())
    }
}

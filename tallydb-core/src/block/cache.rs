//! Record cache: the mapped region viewed as fixed-size records

use crate::point::{AtomicPoint, POINT_SIZE};
use crate::segment::Segment;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A segment as seen by a block, with its dirty flag.
///
/// Shared between successive cache snapshots so the flag survives rebuilds.
pub(crate) struct MappedSegment<S> {
    segment: Arc<S>,
    dirty: AtomicBool,
}

impl<S: Segment> MappedSegment<S> {
    pub(crate) fn new(segment: Arc<S>) -> Self {
        Self {
            segment,
            dirty: AtomicBool::new(false),
        }
    }

    pub(crate) fn segment(&self) -> &S {
        &self.segment
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag, returning whether it was set
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Immutable snapshot of a block's records.
///
/// Record `i` lives in segment `i / records_per_segment`; segments hold a
/// whole number of records so a record never straddles two of them. Holding
/// a snapshot keeps its segments mapped.
pub struct RecordCache<S> {
    segments: Vec<Arc<MappedSegment<S>>>,
    record_size: usize,
    records_per_segment: usize,
    len: usize,
}

impl<S: Segment> RecordCache<S> {
    /// Build a fresh set of record views over `segments`
    pub(crate) fn rebuild(segments: Vec<Arc<MappedSegment<S>>>, record_size: usize) -> Self {
        let rbs = record_size * POINT_SIZE;
        let records_per_segment = segments
            .first()
            .map(|s| s.segment().len() / rbs)
            .unwrap_or(0);
        debug_assert!(segments
            .iter()
            .all(|s| s.segment().len() == records_per_segment * rbs));

        Self {
            len: segments.len() * records_per_segment,
            segments,
            record_size,
            records_per_segment,
        }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the cache covers no records
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Points per record
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Number of segments covered
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn segments(&self) -> &[Arc<MappedSegment<S>>] {
        &self.segments
    }

    /// Points of record `index`, aliasing mapped memory
    pub(crate) fn record(&self, index: usize) -> Option<&[AtomicPoint]> {
        if index >= self.len {
            return None;
        }

        let segment = self.segments[index / self.records_per_segment].segment();
        let offset = (index % self.records_per_segment) * self.record_size * POINT_SIZE;

        // SAFETY: the segment is at least `(offset + record_size) * POINT_SIZE`
        // bytes long, 8-byte aligned (Segment contract) and `offset` is a
        // multiple of 16, so every AtomicPoint is in bounds and aligned. The
        // memory outlives `&self` because the snapshot holds the segment.
        unsafe {
            let base = segment.as_ptr().add(offset) as *const AtomicPoint;
            Some(std::slice::from_raw_parts(base, self.record_size))
        }
    }

    /// Segment holding record `index`
    pub(crate) fn segment_of(&self, index: usize) -> &MappedSegment<S> {
        &self.segments[index / self.records_per_segment]
    }
}

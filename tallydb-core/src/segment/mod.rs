//! Growable segment stores
//!
//! A segment store presents a set of fixed-size segments as one logically
//! contiguous byte region: logical offset `o` lives in segment
//! `o / segment_size` at `o % segment_size`. The region only grows, and only
//! by appending whole segments, so memory handed out for existing segments
//! never moves.
//!
//! - [`MmapStore`]: segment files in a directory, memory-mapped
//! - [`MemoryStore`]: heap-backed segments for tests and benchmarks

mod memory;
mod mmap;

pub use memory::{HeapSegment, MemoryStore};
pub use mmap::{MmapSegment, MmapStore};

use crate::Result;
use std::sync::Arc;

/// One fixed-size chunk of zero-initialized backing memory.
///
/// # Safety
///
/// Implementors guarantee that [`Segment::as_ptr`] points to [`Segment::len`]
/// bytes that are readable and writable, aligned to at least 8 bytes, zeroed
/// when the segment was first created, and that stay at the same address for
/// as long as the segment value is alive. The engine only ever touches this
/// memory through atomic words, possibly from many threads at once.
pub unsafe trait Segment: Send + Sync + 'static {
    /// Base address of the segment memory
    fn as_ptr(&self) -> *mut u8;

    /// Size in bytes
    fn len(&self) -> usize;

    /// Make everything written so far durable
    fn flush(&self) -> Result<()>;
}

/// A growable region made of equally sized segments
pub trait SegmentStore: Send + 'static {
    /// Segment type handed out by this store
    type Segment: Segment;

    /// Size of every segment in bytes
    fn segment_size(&self) -> usize;

    /// All segments, in logical order
    fn segments(&self) -> &[Arc<Self::Segment>];

    /// Append `additional` zeroed segments.
    ///
    /// Segments created before a failure stay in the store; the region never
    /// shrinks.
    fn extend(&mut self, additional: usize) -> Result<()>;

    /// Total size of the region in bytes
    fn mapped_len(&self) -> usize {
        self.segments().len() * self.segment_size()
    }
}

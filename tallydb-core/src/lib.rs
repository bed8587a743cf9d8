//! TallyDB Core - Memory-Mapped Aggregation Engine
//!
//! A storage engine for online aggregation of numeric time-series samples.
//! Samples are folded into fixed 16-byte cells (running total plus count)
//! that live directly in memory-mapped segment files:
//!
//! - No serialization on the write path: `track` adds into mapped memory
//! - Blocks grow on demand by whole segments while writers keep running
//! - Readers get zero-copy views that stay valid across growth
//!
//! # Architecture
//!
//! - **Point**: 16-byte cell layout and zero-copy byte views
//! - **Segment**: growable store of fixed-size segments (mmap or heap)
//! - **Block**: records of points over a segment store, growth and sync
//! - **Storage**: named databases under one data directory
//! - **Sync**: periodic background flushing

pub mod block;
pub mod point;
pub mod segment;
pub mod storage;
pub mod sync;

mod error;

pub use block::{Block, BlockConfig, RecordView, Records};
pub use error::{Result, TallyError};
pub use point::{Point, POINT_SIZE};

/// TallyDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Requested segment size (64MB), rounded down to whole records per block
    pub const SEGMENT_SIZE: usize = 64 * 1024 * 1024;

    /// Period of the background sync in milliseconds
    pub const SYNC_PERIOD_MS: u64 = 100;

    /// Number of point lock stripes per block
    pub const LOCK_STRIPES: usize = 64;
}

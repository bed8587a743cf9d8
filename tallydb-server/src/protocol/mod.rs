//! Wire types for the batch track and fetch endpoints
//!
//! Batches are answered item by item: one failing item never fails the
//! whole request, it only carries an `error` in its own response slot.

use serde::{Deserialize, Serialize};
use tallydb_core::Point;

/// One sample to fold into a point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRequest {
    pub database: String,
    pub record: usize,
    pub point: usize,
    pub total: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Records `[from, to)` of one database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub database: String,
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-finite totals arrive as `"inf"`, `"-inf"` or `"NaN"`
    #[serde(default)]
    pub records: Vec<Vec<Point>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDatabaseRequest {
    pub record_size: usize,
    /// Requested segment size in bytes; the server default when absent
    #[serde(default)]
    pub segment_size: Option<usize>,
}

impl TrackResponse {
    pub fn failed(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
        }
    }
}

impl FetchResponse {
    pub fn failed(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            records: Vec::new(),
        }
    }

    pub fn records(records: Vec<Vec<Point>>) -> Self {
        Self {
            error: None,
            records,
        }
    }
}

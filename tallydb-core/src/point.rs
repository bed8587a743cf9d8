//! Point codec
//!
//! A point is the 16-byte aggregation cell every block is made of:
//!
//! ```text
//! offset 0   total   f64 little-endian
//! offset 8   count   u64 little-endian
//! ```
//!
//! The layout is persisted as-is in segment files and aliased in place, so it
//! must never change. All unsafe reinterpretation of bytes as points lives in
//! this module and in `block::cache`.

use crate::{Result, TallyError};
use bytemuck::{Pod, Zeroable};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(target_endian = "big")]
compile_error!("the point layout is little-endian and aliased in place; big-endian targets are unsupported");

/// Size of one point in bytes
pub const POINT_SIZE: usize = 16;

/// One aggregation cell: running sum and number of samples folded in
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Point {
    /// Accumulated sum. Serialized as a number when finite and as the
    /// string `"inf"`, `"-inf"` or `"NaN"` otherwise.
    #[serde(with = "total_repr")]
    pub total: f64,
    /// Number of samples
    pub count: u64,
}

const _: () = assert!(std::mem::size_of::<Point>() == POINT_SIZE);
const _: () = assert!(std::mem::align_of::<Point>() == 8);

impl Point {
    /// Create a new point
    pub fn new(total: f64, count: u64) -> Self {
        Self { total, count }
    }

    /// Check if nothing was ever accumulated into this cell
    pub fn is_zero(&self) -> bool {
        self.total.to_bits() == 0 && self.count == 0
    }

    /// Serialize to the on-disk byte layout
    pub fn encode(&self) -> [u8; POINT_SIZE] {
        let mut buf = [0u8; POINT_SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_f64_le(self.total);
        cursor.put_u64_le(self.count);
        buf
    }

    /// Deserialize from the on-disk byte layout
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < POINT_SIZE {
            return Err(TallyError::InvalidFormat(format!(
                "point needs {} bytes, got {}",
                POINT_SIZE,
                data.len()
            )));
        }

        Ok(Self {
            total: data.get_f64_le(),
            count: data.get_u64_le(),
        })
    }
}

/// View a byte buffer as points without copying.
///
/// The view has `bytes.len() / POINT_SIZE` points; trailing bytes that do not
/// form a whole point are not reachable through it.
pub fn points_as_view(bytes: &[u8]) -> Result<&[Point]> {
    let whole = bytes.len() / POINT_SIZE * POINT_SIZE;
    if whole == 0 {
        return Ok(&[]);
    }

    bytemuck::try_cast_slice(&bytes[..whole])
        .map_err(|e| TallyError::InvalidFormat(format!("cannot view bytes as points: {:?}", e)))
}

/// Mutable variant of [`points_as_view`]. Writes through the returned points
/// land directly in `bytes`.
pub fn points_as_view_mut(bytes: &mut [u8]) -> Result<&mut [Point]> {
    let whole = bytes.len() / POINT_SIZE * POINT_SIZE;
    if whole == 0 {
        return Ok(&mut []);
    }

    bytemuck::try_cast_slice_mut(&mut bytes[..whole])
        .map_err(|e| TallyError::InvalidFormat(format!("cannot view bytes as points: {:?}", e)))
}

/// A point living in shared mapped memory.
///
/// Same layout as [`Point`]; each field is an atomic word so the cell can be
/// reached through shared references from many threads. Keeping the two
/// fields consistent with each other is the job of the block's stripe locks.
#[repr(C)]
pub(crate) struct AtomicPoint {
    total: AtomicU64,
    count: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<AtomicPoint>() == POINT_SIZE);
const _: () = assert!(std::mem::align_of::<AtomicPoint>() == std::mem::align_of::<Point>());

impl AtomicPoint {
    /// Copy the current value out
    pub(crate) fn load(&self) -> Point {
        Point {
            total: f64::from_bits(self.total.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }

    /// Add deltas in place. Caller holds the stripe lock for this point.
    pub(crate) fn accumulate(&self, total: f64, count: u64) {
        let current = f64::from_bits(self.total.load(Ordering::Relaxed));
        self.total.store((current + total).to_bits(), Ordering::Relaxed);

        let current = self.count.load(Ordering::Relaxed);
        self.count.store(current.wrapping_add(count), Ordering::Relaxed);
    }
}

/// Serde form of a point total. JSON has no non-finite numbers and
/// serde_json would silently write them as `null`.
mod total_repr {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(total: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if total.is_finite() {
            serializer.serialize_f64(*total)
        } else if total.is_nan() {
            serializer.serialize_str("NaN")
        } else if total.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(text) => text
                .parse()
                .map_err(|_| D::Error::custom(format!("invalid total {:?}", text))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aligned_bytes(len: usize) -> Vec<u64> {
        vec![0u64; (len + 7) / 8]
    }

    #[test]
    fn test_encode_decode_bit_identical() {
        let samples = [
            Point::new(123.456, 5),
            Point::new(-0.0, 0),
            Point::new(f64::INFINITY, u64::MAX),
            Point::new(f64::MIN_POSITIVE, 1),
            Point::new(f64::from_bits(0x7ff8_dead_beef_0001), 42),
        ];

        for point in samples {
            let bytes = point.encode();
            let decoded = Point::decode(&bytes).unwrap();
            assert_eq!(decoded.total.to_bits(), point.total.to_bits());
            assert_eq!(decoded.count, point.count);
        }
    }

    #[test]
    fn test_encode_layout() {
        let bytes = Point::new(3.5, 7).encode();
        assert_eq!(&bytes[0..8], &3.5f64.to_le_bytes());
        assert_eq!(&bytes[8..16], &7u64.to_le_bytes());
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(matches!(
            Point::decode(&[0u8; 15]),
            Err(TallyError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_view_aliases_bytes() {
        let mut words = aligned_bytes(120);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);

        let points = points_as_view_mut(bytes).unwrap();
        assert_eq!(points.len(), 120 / POINT_SIZE);

        points[1] = Point::new(12.625, 10);

        let total = f64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let count = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        assert_eq!(total, 12.625);
        assert_eq!(count, 10);
    }

    #[test]
    fn test_bytes_visible_through_view() {
        let mut words = aligned_bytes(64);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
        bytes[32..48].copy_from_slice(&Point::new(-8.25, 3).encode());

        let points = points_as_view(bytes).unwrap();
        assert_eq!(points[2], Point::new(-8.25, 3));
        assert!(points[0].is_zero());
    }

    #[test]
    fn test_trailing_bytes_unreachable() {
        let mut words = aligned_bytes(40);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
        bytes[32] = 0xff;

        let points = points_as_view(&bytes[..40]).unwrap();
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(Point::is_zero));

        assert!(points_as_view(&bytes[..15]).unwrap().is_empty());
    }

    #[test]
    fn test_misaligned_view_rejected() {
        let mut words = aligned_bytes(40);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);

        assert!(matches!(
            points_as_view(&bytes[1..33]),
            Err(TallyError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_atomic_point_accumulates() {
        let cell = AtomicPoint {
            total: AtomicU64::new(0),
            count: AtomicU64::new(0),
        };

        cell.accumulate(1.0, 1);
        cell.accumulate(1.0, 1);
        assert_eq!(cell.load(), Point::new(2.0, 2));

        cell.accumulate(-0.5, 0);
        assert_eq!(cell.load(), Point::new(1.5, 2));
    }

    #[test]
    fn test_non_finite_totals_serialized_as_strings() {
        let points = [
            Point::new(f64::INFINITY, 3),
            Point::new(f64::NEG_INFINITY, 1),
            Point::new(f64::NAN, 2),
            Point::new(1.5, 4),
        ];

        let json = serde_json::to_string(&points).unwrap();
        assert_eq!(
            json,
            r#"[{"total":"inf","count":3},{"total":"-inf","count":1},{"total":"NaN","count":2},{"total":1.5,"count":4}]"#
        );

        let back: Vec<Point> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[0], points[0]);
        assert_eq!(back[1], points[1]);
        assert!(back[2].total.is_nan());
        assert_eq!(back[3], points[3]);

        assert!(serde_json::from_str::<Point>(r#"{"total":"lots","count":1}"#).is_err());
    }
}

// src/track/point.rs
//! Persisted track points and sentinel marker encoding
//!
//! The persisted row format encodes pause/resume markers as out-of-range
//! coordinates for compatibility with existing track databases. Inside
//! the crate a point always carries an explicit kind; the coordinate
//! encoding is applied and stripped only at the storage boundary.

use crate::gps::Fix;
use chrono::{DateTime, Utc};

/// Latitude value marking a recording pause in the persisted format.
pub const PAUSE_LATITUDE: f64 = 100.0;
/// Latitude value marking a recording resume in the persisted format.
pub const RESUME_LATITUDE: f64 = 200.0;

pub type PointId = i64;

/// What a persisted point represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    /// A real positioning sample.
    Fix,
    /// Recording was paused after the preceding point.
    Pause,
    /// Recording resumed at this point's timestamp.
    Resume,
    /// Any other invalid coordinate: a segment boundary of unknown origin.
    SegmentBreak,
}

impl PointKind {
    /// Decode the persisted coordinate encoding.
    pub fn from_coordinates(latitude: f64, longitude: f64) -> Self {
        if latitude == PAUSE_LATITUDE && longitude == 0.0 {
            PointKind::Pause
        } else if latitude == RESUME_LATITUDE && longitude == 0.0 {
            PointKind::Resume
        } else if latitude.abs() > 90.0 || longitude.abs() > 180.0 {
            PointKind::SegmentBreak
        } else {
            PointKind::Fix
        }
    }

    /// The coordinates this kind is persisted with, when it is a marker.
    pub fn sentinel_coordinates(self) -> Option<(f64, f64)> {
        match self {
            PointKind::Fix => None,
            PointKind::Pause => Some((PAUSE_LATITUDE, 0.0)),
            PointKind::Resume => Some((RESUME_LATITUDE, 0.0)),
            PointKind::SegmentBreak => Some((PAUSE_LATITUDE, 180.0)),
        }
    }

    pub fn is_marker(self) -> bool {
        self != PointKind::Fix
    }
}

/// A persisted fix or marker, with the id assigned by storage.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPoint {
    pub id: PointId,
    pub track_id: i64,
    pub kind: PointKind,
    pub fix: Fix,
}

impl TrackPoint {
    /// True when this row is a real location rather than a marker.
    pub fn is_valid_fix(&self) -> bool {
        self.kind == PointKind::Fix && self.fix.is_valid()
    }
}

/// Build the fix payload for a marker row at a given time.
pub fn sentinel_fix(kind: PointKind, time: DateTime<Utc>) -> Fix {
    let (latitude, longitude) = kind
        .sentinel_coordinates()
        .expect("sentinel_fix requires a marker kind");
    Fix::new(latitude, longitude, time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_markers() {
        assert_eq!(PointKind::from_coordinates(100.0, 0.0), PointKind::Pause);
        assert_eq!(PointKind::from_coordinates(200.0, 0.0), PointKind::Resume);
        assert_eq!(PointKind::from_coordinates(100.0, 180.0), PointKind::SegmentBreak);
        assert_eq!(PointKind::from_coordinates(91.0, 10.0), PointKind::SegmentBreak);
        assert_eq!(PointKind::from_coordinates(45.0, 7.0), PointKind::Fix);
    }

    #[test]
    fn test_sentinel_roundtrip() {
        for kind in [PointKind::Pause, PointKind::Resume, PointKind::SegmentBreak] {
            let (latitude, longitude) = kind.sentinel_coordinates().unwrap();
            assert_eq!(PointKind::from_coordinates(latitude, longitude), kind);
        }
        assert!(PointKind::Fix.sentinel_coordinates().is_none());
    }

    #[test]
    fn test_sentinel_fix_is_invalid() {
        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let fix = sentinel_fix(PointKind::Pause, time);
        assert!(!fix.is_valid());
        assert_eq!(fix.time, time);
    }
}

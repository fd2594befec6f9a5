// src/track/mod.rs
//! Tracks, waypoints and their creation requests

pub mod point;

pub use point::{PointId, PointKind, TrackPoint};

use crate::stats::TripStatistics;
use chrono::{DateTime, Utc};

pub type TrackId = i64;
pub type WaypointId = i64;

/// A recorded track: identity, naming, the owned statistics snapshot and
/// the id range of its points.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    pub category: String,
    pub statistics: TripStatistics,
    pub start_point_id: Option<PointId>,
    pub stop_point_id: Option<PointId>,
    pub number_of_points: u64,
}

impl Track {
    pub fn new(name: String, category: String, statistics: TripStatistics) -> Self {
        Self {
            id: -1,
            name,
            category,
            statistics,
            start_point_id: None,
            stop_point_id: None,
            number_of_points: 0,
        }
    }

    /// Extend the point id range to include `point_id`; counts the point
    /// when it is a new valid location.
    pub fn observe_point(&mut self, point_id: PointId, valid: bool) {
        if self.start_point_id.is_none() {
            self.start_point_id = Some(point_id);
        }
        self.stop_point_id = Some(point_id);
        if valid {
            self.number_of_points += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaypointKind {
    /// A plain user annotation.
    Marker,
    /// Closes out a sub-interval of the track with a statistics snapshot.
    Statistics,
}

/// A user- or system-created annotation attached to a track.
#[derive(Debug, Clone)]
pub struct Waypoint {
    pub id: WaypointId,
    pub track_id: TrackId,
    pub name: String,
    pub description: String,
    pub category: String,
    pub kind: WaypointKind,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub time: DateTime<Utc>,
    /// Track distance in meters at creation time.
    pub length: f64,
    /// Track duration at creation time.
    pub duration_ms: i64,
    /// Present on statistics markers only.
    pub statistics: Option<TripStatistics>,
}

impl Waypoint {
    /// True when the waypoint sits at a displayable location. The
    /// track-wide statistics marker created at track start carries a
    /// placeholder location and fails this check.
    pub fn has_valid_location(&self) -> bool {
        self.latitude.abs() <= 90.0 && self.longitude.abs() <= 180.0
    }
}

/// Request to create a waypoint while recording.
#[derive(Debug, Clone, Default)]
pub struct WaypointRequest {
    pub statistics: bool,
    /// Track-wide statistics marker; allowed before the first point.
    pub track_statistics: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
}

impl WaypointRequest {
    /// A plain marker with user-supplied text.
    pub fn marker(name: Option<String>, description: Option<String>) -> Self {
        Self { name, description, ..Default::default() }
    }

    /// A statistics marker closing out the current sub-interval.
    pub fn statistics_marker() -> Self {
        Self { statistics: true, ..Default::default() }
    }

    /// The start-of-track statistics marker.
    pub fn start_of_track() -> Self {
        Self { statistics: true, track_statistics: true, ..Default::default() }
    }
}

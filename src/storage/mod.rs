// src/storage/mod.rs
//! Narrow storage boundary for tracks, points and waypoints
//!
//! The recording filter and the data hub only ever touch storage through
//! `TrackStorage`. Point ids are assigned by the store and are strictly
//! increasing, which the resampling cursor depends on. The sentinel
//! coordinate encoding for pause/resume markers is applied on write and
//! decoded on read here, nowhere else.

use crate::error::{Result, TrackError};
use crate::gps::Fix;
use crate::track::point::{sentinel_fix, PointId, PointKind, TrackPoint};
use crate::track::{Track, TrackId, Waypoint, WaypointId, WaypointKind};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Table-change notifications, fired after successful writes. The data
/// hub implements this to schedule scoped reloads.
pub trait TableListener: Send + Sync {
    fn on_tracks_table_changed(&self);
    fn on_waypoints_table_changed(&self);
    fn on_track_points_table_changed(&self);
}

/// Cursor over a snapshot of persisted points in ascending id order.
/// Holding a cursor does not block writers; dropping it releases the
/// snapshot.
pub struct PointCursor {
    points: std::vec::IntoIter<TrackPoint>,
}

impl Iterator for PointCursor {
    type Item = TrackPoint;

    fn next(&mut self) -> Option<TrackPoint> {
        self.points.next()
    }
}

pub trait TrackStorage: Send + Sync {
    /// Insert a track row and return its assigned id.
    fn insert_track(&self, track: &Track) -> Result<TrackId>;

    fn update_track(&self, track: &Track) -> Result<()>;

    fn get_track(&self, track_id: TrackId) -> Option<Track>;

    /// Persist one point; marker kinds are stored with their sentinel
    /// coordinate encoding regardless of the fix payload's coordinates.
    fn insert_track_point(&self, track_id: TrackId, kind: PointKind, fix: &Fix) -> Result<PointId>;

    fn get_last_point_id(&self, track_id: TrackId) -> Option<PointId>;

    /// Most recent point that is a real, valid location (skips markers).
    fn get_last_valid_point(&self, track_id: TrackId) -> Option<TrackPoint>;

    /// Points of a track with id >= `min_id`, ascending.
    fn point_cursor(&self, track_id: TrackId, min_id: PointId) -> PointCursor;

    fn insert_waypoint(&self, waypoint: &Waypoint) -> Result<WaypointId>;

    /// Up to `max` waypoints of a track in insertion order.
    fn waypoints(&self, track_id: TrackId, max: usize) -> Vec<Waypoint>;

    /// Sequence number for auto-generated waypoint names of a kind.
    fn next_waypoint_number(&self, track_id: TrackId, kind: WaypointKind) -> u32;

    fn set_table_listener(&self, listener: Option<Arc<dyn TableListener>>);
}

#[derive(Default)]
struct Tables {
    tracks: BTreeMap<TrackId, Track>,
    points: BTreeMap<TrackId, Vec<TrackPoint>>,
    waypoints: Vec<Waypoint>,
    next_track_id: TrackId,
    next_point_id: PointId,
    next_waypoint_id: WaypointId,
}

/// In-memory reference implementation of `TrackStorage`.
pub struct MemoryStorage {
    tables: RwLock<Tables>,
    listener: RwLock<Option<Arc<dyn TableListener>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                next_track_id: 1,
                next_point_id: 1,
                next_waypoint_id: 1,
                ..Default::default()
            }),
            listener: RwLock::new(None),
        }
    }

    fn listener(&self) -> Option<Arc<dyn TableListener>> {
        self.listener.read().unwrap().clone()
    }

    fn notify_tracks(&self) {
        if let Some(listener) = self.listener() {
            listener.on_tracks_table_changed();
        }
    }

    fn notify_waypoints(&self) {
        if let Some(listener) = self.listener() {
            listener.on_waypoints_table_changed();
        }
    }

    fn notify_points(&self) {
        if let Some(listener) = self.listener() {
            listener.on_track_points_table_changed();
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackStorage for MemoryStorage {
    fn insert_track(&self, track: &Track) -> Result<TrackId> {
        let track_id = {
            let mut tables = self.tables.write().unwrap();
            let track_id = tables.next_track_id;
            tables.next_track_id += 1;
            let mut row = track.clone();
            row.id = track_id;
            tables.tracks.insert(track_id, row);
            tables.points.insert(track_id, Vec::new());
            track_id
        };
        self.notify_tracks();
        Ok(track_id)
    }

    fn update_track(&self, track: &Track) -> Result<()> {
        {
            let mut tables = self.tables.write().unwrap();
            if !tables.tracks.contains_key(&track.id) {
                return Err(TrackError::InvalidState(format!("No track with id {}", track.id)));
            }
            tables.tracks.insert(track.id, track.clone());
        }
        self.notify_tracks();
        Ok(())
    }

    fn get_track(&self, track_id: TrackId) -> Option<Track> {
        self.tables.read().unwrap().tracks.get(&track_id).cloned()
    }

    fn insert_track_point(&self, track_id: TrackId, kind: PointKind, fix: &Fix) -> Result<PointId> {
        let point_id = {
            let mut tables = self.tables.write().unwrap();
            if !tables.tracks.contains_key(&track_id) {
                return Err(TrackError::InvalidState(format!("No track with id {}", track_id)));
            }
            let point_id = tables.next_point_id;
            tables.next_point_id += 1;

            // Persisted-format boundary: markers keep their sentinel
            // coordinate encoding on disk.
            let stored_fix = if kind.is_marker() {
                let mut sentinel = sentinel_fix(kind, fix.time);
                sentinel.sensor = fix.sensor;
                sentinel
            } else {
                fix.clone()
            };
            let decoded_kind =
                PointKind::from_coordinates(stored_fix.latitude, stored_fix.longitude);

            tables.points.entry(track_id).or_default().push(TrackPoint {
                id: point_id,
                track_id,
                kind: decoded_kind,
                fix: stored_fix,
            });
            point_id
        };
        self.notify_points();
        Ok(point_id)
    }

    fn get_last_point_id(&self, track_id: TrackId) -> Option<PointId> {
        self.tables
            .read()
            .unwrap()
            .points
            .get(&track_id)
            .and_then(|points| points.last())
            .map(|point| point.id)
    }

    fn get_last_valid_point(&self, track_id: TrackId) -> Option<TrackPoint> {
        self.tables
            .read()
            .unwrap()
            .points
            .get(&track_id)
            .and_then(|points| points.iter().rev().find(|point| point.is_valid_fix()))
            .cloned()
    }

    fn point_cursor(&self, track_id: TrackId, min_id: PointId) -> PointCursor {
        let points: Vec<TrackPoint> = self
            .tables
            .read()
            .unwrap()
            .points
            .get(&track_id)
            .map(|points| points.iter().filter(|p| p.id >= min_id).cloned().collect())
            .unwrap_or_default();
        PointCursor { points: points.into_iter() }
    }

    fn insert_waypoint(&self, waypoint: &Waypoint) -> Result<WaypointId> {
        let waypoint_id = {
            let mut tables = self.tables.write().unwrap();
            if !tables.tracks.contains_key(&waypoint.track_id) {
                return Err(TrackError::InvalidState(format!(
                    "No track with id {}",
                    waypoint.track_id
                )));
            }
            let waypoint_id = tables.next_waypoint_id;
            tables.next_waypoint_id += 1;
            let mut row = waypoint.clone();
            row.id = waypoint_id;
            tables.waypoints.push(row);
            waypoint_id
        };
        self.notify_waypoints();
        Ok(waypoint_id)
    }

    fn waypoints(&self, track_id: TrackId, max: usize) -> Vec<Waypoint> {
        self.tables
            .read()
            .unwrap()
            .waypoints
            .iter()
            .filter(|w| w.track_id == track_id)
            .take(max)
            .cloned()
            .collect()
    }

    fn next_waypoint_number(&self, track_id: TrackId, kind: WaypointKind) -> u32 {
        self.tables
            .read()
            .unwrap()
            .waypoints
            .iter()
            .filter(|w| w.track_id == track_id && w.kind == kind)
            .count() as u32
    }

    fn set_table_listener(&self, listener: Option<Arc<dyn TableListener>>) {
        *self.listener.write().unwrap() = listener;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TripStatistics;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_track(storage: &MemoryStorage) -> TrackId {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let track = Track::new("test".to_string(), String::new(), TripStatistics::new(start));
        storage.insert_track(&track).unwrap()
    }

    fn fix_at(latitude: f64, seconds: i64) -> Fix {
        Fix::new(latitude, 7.0, Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap())
    }

    #[test]
    fn test_point_ids_are_increasing() {
        let storage = MemoryStorage::new();
        let track_id = new_track(&storage);
        let mut previous = 0;
        for i in 0..5 {
            let id = storage
                .insert_track_point(track_id, PointKind::Fix, &fix_at(45.0, i))
                .unwrap();
            assert!(id > previous);
            previous = id;
        }
        assert_eq!(storage.get_last_point_id(track_id), Some(previous));
    }

    #[test]
    fn test_sentinel_roundtrip_through_storage() {
        let storage = MemoryStorage::new();
        let track_id = new_track(&storage);
        let time = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        // Caller-side fix payload coordinates are irrelevant for markers
        storage
            .insert_track_point(track_id, PointKind::Pause, &Fix::new(45.0, 7.0, time))
            .unwrap();

        let points: Vec<TrackPoint> = storage.point_cursor(track_id, 0).collect();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].kind, PointKind::Pause);
        assert_eq!(points[0].fix.latitude, 100.0);
        assert_eq!(points[0].fix.time, time);
    }

    #[test]
    fn test_last_valid_point_skips_markers() {
        let storage = MemoryStorage::new();
        let track_id = new_track(&storage);
        storage.insert_track_point(track_id, PointKind::Fix, &fix_at(45.0, 0)).unwrap();
        storage.insert_track_point(track_id, PointKind::Fix, &fix_at(45.1, 10)).unwrap();
        storage.insert_track_point(track_id, PointKind::Pause, &fix_at(0.0, 20)).unwrap();

        let last = storage.get_last_valid_point(track_id).unwrap();
        assert_eq!(last.fix.latitude, 45.1);
    }

    #[test]
    fn test_cursor_range_and_order() {
        let storage = MemoryStorage::new();
        let track_id = new_track(&storage);
        let ids: Vec<PointId> = (0..4)
            .map(|i| storage.insert_track_point(track_id, PointKind::Fix, &fix_at(45.0, i)).unwrap())
            .collect();

        let seen: Vec<PointId> = storage.point_cursor(track_id, ids[2]).map(|p| p.id).collect();
        assert_eq!(seen, vec![ids[2], ids[3]]);
    }

    #[test]
    fn test_waypoint_numbering_per_kind() {
        let storage = MemoryStorage::new();
        let track_id = new_track(&storage);
        assert_eq!(storage.next_waypoint_number(track_id, WaypointKind::Marker), 0);

        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let wp = Waypoint {
            id: -1,
            track_id,
            name: "Marker 0".to_string(),
            description: String::new(),
            category: String::new(),
            kind: WaypointKind::Marker,
            latitude: 45.0,
            longitude: 7.0,
            altitude: None,
            time,
            length: 0.0,
            duration_ms: 0,
            statistics: None,
        };
        storage.insert_waypoint(&wp).unwrap();
        assert_eq!(storage.next_waypoint_number(track_id, WaypointKind::Marker), 1);
        assert_eq!(storage.next_waypoint_number(track_id, WaypointKind::Statistics), 0);
    }

    #[test]
    fn test_table_listener_fires_per_table() {
        struct Counter {
            tracks: AtomicUsize,
            waypoints: AtomicUsize,
            points: AtomicUsize,
        }
        impl TableListener for Counter {
            fn on_tracks_table_changed(&self) {
                self.tracks.fetch_add(1, Ordering::SeqCst);
            }
            fn on_waypoints_table_changed(&self) {
                self.waypoints.fetch_add(1, Ordering::SeqCst);
            }
            fn on_track_points_table_changed(&self) {
                self.points.fetch_add(1, Ordering::SeqCst);
            }
        }

        let storage = MemoryStorage::new();
        let counter = Arc::new(Counter {
            tracks: AtomicUsize::new(0),
            waypoints: AtomicUsize::new(0),
            points: AtomicUsize::new(0),
        });
        storage.set_table_listener(Some(counter.clone()));

        let track_id = new_track(&storage);
        storage.insert_track_point(track_id, PointKind::Fix, &fix_at(45.0, 0)).unwrap();
        storage.insert_track_point(track_id, PointKind::Fix, &fix_at(45.1, 1)).unwrap();

        assert_eq!(counter.tracks.load(Ordering::SeqCst), 1);
        assert_eq!(counter.points.load(Ordering::SeqCst), 2);
        assert_eq!(counter.waypoints.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_update_missing_track_fails() {
        let storage = MemoryStorage::new();
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut track = Track::new("ghost".to_string(), String::new(), TripStatistics::new(start));
        track.id = 42;
        assert!(storage.update_track(&track).is_err());
    }
}

// src/stats/trip.rs
//! Trip statistics aggregate

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Aggregate metrics over a contiguous range of track points.
///
/// Owned exclusively by the updater folding into it; consumers only ever
/// see cloned snapshots. Total distance and moving time are monotonically
/// non-decreasing while a track is being folded.
#[derive(Debug, Clone, PartialEq)]
pub struct TripStatistics {
    start_time: DateTime<Utc>,
    stop_time: DateTime<Utc>,
    total_time_ms: i64,
    moving_time_ms: i64,
    total_distance: f64,
    total_elevation_gain: f64,
    min_elevation: Option<f64>,
    max_elevation: Option<f64>,
    min_grade: Option<f64>,
    max_grade: Option<f64>,
    max_speed: f64,
}

impl TripStatistics {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            stop_time: start_time,
            total_time_ms: 0,
            moving_time_ms: 0,
            total_distance: 0.0,
            total_elevation_gain: 0.0,
            min_elevation: None,
            max_elevation: None,
            min_grade: None,
            max_grade: None,
            max_speed: 0.0,
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn stop_time(&self) -> DateTime<Utc> {
        self.stop_time
    }

    /// Wall-clock time covered, including stopped periods.
    pub fn total_time(&self) -> Duration {
        Duration::from_millis(self.total_time_ms.max(0) as u64)
    }

    /// Time spent above the no-movement speed threshold.
    pub fn moving_time(&self) -> Duration {
        Duration::from_millis(self.moving_time_ms.max(0) as u64)
    }

    /// Total distance in meters.
    pub fn total_distance(&self) -> f64 {
        self.total_distance
    }

    /// Accumulated positive elevation change in meters.
    pub fn total_elevation_gain(&self) -> f64 {
        self.total_elevation_gain
    }

    pub fn min_elevation(&self) -> Option<f64> {
        self.min_elevation
    }

    pub fn max_elevation(&self) -> Option<f64> {
        self.max_elevation
    }

    pub fn min_grade(&self) -> Option<f64> {
        self.min_grade
    }

    pub fn max_grade(&self) -> Option<f64> {
        self.max_grade
    }

    /// Maximum accepted instantaneous speed in m/s.
    pub fn max_speed(&self) -> f64 {
        self.max_speed
    }

    /// Overall average speed in m/s (distance over total time), if any
    /// time has elapsed.
    pub fn average_speed(&self) -> Option<f64> {
        let seconds = self.total_time_ms as f64 / 1000.0;
        if seconds > 0.0 {
            Some(self.total_distance / seconds)
        } else {
            None
        }
    }

    /// Average speed while moving in m/s.
    pub fn average_moving_speed(&self) -> Option<f64> {
        let seconds = self.moving_time_ms as f64 / 1000.0;
        if seconds > 0.0 {
            Some(self.total_distance / seconds)
        } else {
            None
        }
    }

    pub(crate) fn set_stop_time(&mut self, stop_time: DateTime<Utc>) {
        self.stop_time = stop_time;
    }

    pub(crate) fn set_total_time_ms(&mut self, total_time_ms: i64) {
        self.total_time_ms = total_time_ms;
    }

    pub(crate) fn add_total_distance(&mut self, distance: f64) {
        self.total_distance += distance;
    }

    pub(crate) fn add_moving_time_ms(&mut self, moving_time_ms: i64) {
        if moving_time_ms > 0 {
            self.moving_time_ms += moving_time_ms;
        }
    }

    pub(crate) fn add_elevation_gain(&mut self, gain: f64) {
        if gain > 0.0 {
            self.total_elevation_gain += gain;
        }
    }

    pub(crate) fn update_elevation_extremes(&mut self, elevation: f64) {
        self.min_elevation = Some(self.min_elevation.map_or(elevation, |m| m.min(elevation)));
        self.max_elevation = Some(self.max_elevation.map_or(elevation, |m| m.max(elevation)));
    }

    pub(crate) fn update_grade_extremes(&mut self, grade: f64) {
        if !grade.is_finite() {
            return;
        }
        self.min_grade = Some(self.min_grade.map_or(grade, |m| m.min(grade)));
        self.max_grade = Some(self.max_grade.map_or(grade, |m| m.max(grade)));
    }

    pub(crate) fn update_max_speed(&mut self, speed: f64) {
        if speed > self.max_speed {
            self.max_speed = speed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_new_is_zeroed() {
        let stats = TripStatistics::new(start());
        assert_eq!(stats.total_distance(), 0.0);
        assert_eq!(stats.total_time(), Duration::ZERO);
        assert!(stats.min_elevation().is_none());
        assert!(stats.average_speed().is_none());
    }

    #[test]
    fn test_average_speeds() {
        let mut stats = TripStatistics::new(start());
        stats.add_total_distance(1000.0);
        stats.set_total_time_ms(200_000);
        stats.add_moving_time_ms(100_000);
        assert!((stats.average_speed().unwrap() - 5.0).abs() < 1e-9);
        assert!((stats.average_moving_speed().unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_extremes() {
        let mut stats = TripStatistics::new(start());
        stats.update_elevation_extremes(100.0);
        stats.update_elevation_extremes(80.0);
        stats.update_elevation_extremes(120.0);
        assert_eq!(stats.min_elevation(), Some(80.0));
        assert_eq!(stats.max_elevation(), Some(120.0));

        stats.update_grade_extremes(0.1);
        stats.update_grade_extremes(f64::NAN); // discarded
        stats.update_grade_extremes(-0.05);
        assert_eq!(stats.min_grade(), Some(-0.05));
        assert_eq!(stats.max_grade(), Some(0.1));
    }

    #[test]
    fn test_negative_moving_time_ignored() {
        let mut stats = TripStatistics::new(start());
        stats.add_moving_time_ms(-500);
        assert_eq!(stats.moving_time(), Duration::ZERO);
    }
}

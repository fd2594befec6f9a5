// src/stats/updater.rs
//! Incremental trip statistics folding
//!
//! One updater owns one `TripStatistics` aggregate and folds locations in
//! one at a time. The recording filter drives two of these: one for the
//! whole track and one for the interval since the last statistics marker.

use super::smoothing::SmoothingBuffer;
use super::trip::TripStatistics;
use crate::gps::Fix;
use chrono::{DateTime, Utc};

pub const ELEVATION_SMOOTHING_SAMPLES: usize = 25;
pub const SPEED_SMOOTHING_SAMPLES: usize = 25;

/// Below this speed (m/s) the device is considered stopped.
const MAX_NO_MOVEMENT_SPEED: f64 = 0.224;
/// Maximum plausible acceleration, in m/s of speed change per millisecond.
const MAX_ACCELERATION: f64 = 0.02;
/// 128 m/s shows up as a bogus reading from some receivers.
const BOGUS_SPEED: f64 = 128.0;

#[derive(Debug)]
pub struct TripStatisticsUpdater {
    statistics: TripStatistics,
    elevation_buffer: SmoothingBuffer,
    speed_buffer: SmoothingBuffer,
    last_location: Option<Fix>,
    last_smoothed_elevation: Option<f64>,
}

impl TripStatisticsUpdater {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            statistics: TripStatistics::new(start_time),
            elevation_buffer: SmoothingBuffer::new(ELEVATION_SMOOTHING_SAMPLES),
            speed_buffer: SmoothingBuffer::new(SPEED_SMOOTHING_SAMPLES),
            last_location: None,
            last_smoothed_elevation: None,
        }
    }

    pub fn statistics(&self) -> &TripStatistics {
        &self.statistics
    }

    /// Read-only snapshot for consumers.
    pub fn snapshot(&self) -> TripStatistics {
        self.statistics.clone()
    }

    /// Smoothed elevation for external consumers building profiles.
    pub fn smoothed_elevation(&self) -> f64 {
        self.elevation_buffer.average()
    }

    /// Extend total (not moving) time to `now` without adding a location.
    pub fn update_time(&mut self, now: DateTime<Utc>) {
        self.statistics.set_stop_time(now);
        self.statistics
            .set_total_time_ms(now.signed_duration_since(self.statistics.start_time()).num_milliseconds());
    }

    /// Fold one location into the aggregate.
    ///
    /// Sentinel/invalid locations reset the smoothing state so nothing is
    /// accumulated across a segment boundary; the caller handles segment
    /// bookkeeping itself.
    pub fn add_location(&mut self, fix: &Fix, min_recording_distance: f64) {
        self.update_time(fix.time);

        if !fix.is_valid() {
            self.last_location = None;
            self.last_smoothed_elevation = None;
            self.elevation_buffer.reset();
            self.speed_buffer.reset();
            return;
        }

        let Some(last) = self.last_location.clone() else {
            // First location of a segment seeds the smoothing state.
            if let Some(altitude) = fix.altitude {
                self.update_elevation(altitude);
            }
            self.last_location = Some(fix.clone());
            return;
        };

        let distance = last.distance_to(fix);
        if distance < min_recording_distance && !fix.has_sensor_data() {
            // GPS jitter: keep the clock running but don't let it inflate
            // distance, elevation or grade.
            self.last_location = Some(fix.clone());
            return;
        }

        let elevation_delta = match fix.altitude {
            Some(altitude) => self.update_elevation(altitude),
            None => 0.0,
        };

        self.statistics.add_total_distance(distance);

        let time_delta_ms = fix.time.signed_duration_since(last.time).num_milliseconds();
        let speed = fix.speed.unwrap_or_else(|| {
            if time_delta_ms > 0 {
                distance / (time_delta_ms as f64 / 1000.0)
            } else {
                0.0
            }
        });
        if speed > MAX_NO_MOVEMENT_SPEED {
            self.statistics.add_moving_time_ms(time_delta_ms);
        }

        if let (Some(current_speed), Some(last_speed)) = (fix.speed, last.speed) {
            self.update_speed(fix.time, current_speed, last.time, last_speed);
        }

        if distance > 0.0 && fix.altitude.is_some() && last.altitude.is_some() {
            self.statistics.update_grade_extremes(elevation_delta / distance);
        }

        self.last_location = Some(fix.clone());
    }

    /// Push a raw altitude reading; returns the change of the smoothed
    /// elevation and maintains the elevation extremes and gain.
    fn update_elevation(&mut self, altitude: f64) -> f64 {
        self.elevation_buffer.push(altitude);
        let smoothed = self.elevation_buffer.average();
        let delta = match self.last_smoothed_elevation {
            Some(previous) => smoothed - previous,
            None => 0.0,
        };
        self.statistics.update_elevation_extremes(smoothed);
        self.statistics.add_elevation_gain(delta);
        self.last_smoothed_elevation = Some(smoothed);
        delta
    }

    fn update_speed(
        &mut self,
        time: DateTime<Utc>,
        speed: f64,
        last_time: DateTime<Utc>,
        last_speed: f64,
    ) {
        if !self.is_valid_speed(time, speed, last_time, last_speed) {
            log::debug!("Ignoring speed reading {:.2} m/s as noise", speed);
            return;
        }
        self.speed_buffer.push(speed);
        self.statistics.update_max_speed(speed);
    }

    /// Accept a speed reading only when it is internally consistent with
    /// the elapsed time and the previous reading. Thresholds match the
    /// long-standing recording behavior; see DESIGN.md before changing.
    fn is_valid_speed(
        &self,
        time: DateTime<Utc>,
        speed: f64,
        last_time: DateTime<Utc>,
        last_speed: f64,
    ) -> bool {
        if speed == 0.0 {
            return false;
        }
        if (speed - BOGUS_SPEED).abs() < 1.0 {
            return false;
        }
        let time_delta_ms = time.signed_duration_since(last_time).num_milliseconds() as f64;
        if (speed - last_speed).abs() > MAX_ACCELERATION * time_delta_ms {
            return false;
        }
        if !self.speed_buffer.is_full() {
            return true;
        }
        let average = self.speed_buffer.average();
        speed < average * 10.0 && (average - speed).abs() < MAX_ACCELERATION * time_delta_ms
    }
}

// src/gps/fix.rs
//! Raw location samples and their validity rules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mean earth radius in meters, used for the planar distance approximation.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Validity of one external sensor channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorState {
    Valid,
    OutOfRange,
    Unavailable,
}

/// One external sensor reading with its validity state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorValue {
    pub state: SensorState,
    pub value: f64,
}

impl SensorValue {
    pub fn valid(value: f64) -> Self {
        Self { state: SensorState::Valid, value }
    }

    pub fn is_valid(&self) -> bool {
        self.state == SensorState::Valid
    }
}

/// External sensor data attached to a fix (power meter, cadence, heart rate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorPayload {
    pub power: Option<SensorValue>,
    pub cadence: Option<SensorValue>,
    pub heart_rate: Option<SensorValue>,
}

impl SensorPayload {
    /// True when at least one channel carries a valid reading.
    pub fn has_valid_data(&self) -> bool {
        [self.power, self.cadence, self.heart_rate]
            .iter()
            .flatten()
            .any(|v| v.is_valid())
    }
}

/// A single raw positioning sample. Produced by a location source and
/// consumed immediately; only the recording filter decides whether it
/// becomes a durable track point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    /// Altitude above sea level in meters.
    pub altitude: Option<f64>,
    /// Ground speed in m/s.
    pub speed: Option<f64>,
    /// Course over ground in degrees.
    pub bearing: Option<f64>,
    /// Estimated accuracy radius in meters.
    pub accuracy: Option<f64>,
    pub time: DateTime<Utc>,
    pub sensor: Option<SensorPayload>,
}

impl Fix {
    pub fn new(latitude: f64, longitude: f64, time: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            speed: None,
            bearing: None,
            accuracy: None,
            time,
            sensor: None,
        }
    }

    /// A coordinate pair is valid when it lies within the +-90/+-180 range.
    /// Sentinel markers and segment breaks deliberately fail this check.
    pub fn is_valid(&self) -> bool {
        self.latitude.abs() <= 90.0 && self.longitude.abs() <= 180.0
    }

    /// True when the attached sensor payload has at least one valid channel.
    pub fn has_sensor_data(&self) -> bool {
        self.sensor.map_or(false, |s| s.has_valid_data())
    }

    /// Planar distance in meters to another fix (equirectangular
    /// approximation; adequate at track-point spacing).
    pub fn distance_to(&self, other: &Fix) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians() * ((lat1 + lat2) / 2.0).cos();
        EARTH_RADIUS_M * (d_lat * d_lat + d_lon * d_lon).sqrt()
    }

    /// Age of the fix relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fix_at(latitude: f64, longitude: f64) -> Fix {
        Fix::new(latitude, longitude, Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    #[test]
    fn test_validity_range() {
        assert!(fix_at(45.0, -120.0).is_valid());
        assert!(fix_at(90.0, 180.0).is_valid());
        assert!(!fix_at(100.0, 0.0).is_valid()); // pause sentinel encoding
        assert!(!fix_at(200.0, 0.0).is_valid()); // resume sentinel encoding
        assert!(!fix_at(0.0, 181.0).is_valid());
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        let a = fix_at(45.0, 7.0);
        let b = fix_at(46.0, 7.0);
        let d = a.distance_to(&b);
        // One degree of latitude is roughly 111.2 km.
        assert!((d - 111_195.0).abs() < 500.0, "distance was {}", d);
    }

    #[test]
    fn test_distance_symmetric_and_zero() {
        let a = fix_at(45.0, 7.0);
        let b = fix_at(45.001, 7.001);
        assert!((a.distance_to(&b) - b.distance_to(&a)).abs() < 1e-9);
        assert_eq!(a.distance_to(&a), 0.0);
    }

    #[test]
    fn test_sensor_payload_validity() {
        let mut payload = SensorPayload::default();
        assert!(!payload.has_valid_data());
        payload.heart_rate = Some(SensorValue { state: SensorState::OutOfRange, value: 300.0 });
        assert!(!payload.has_valid_data());
        payload.cadence = Some(SensorValue::valid(85.0));
        assert!(payload.has_valid_data());
    }
}

// src/recording/policy.rs
//! Location polling interval policy
//!
//! Decides how often the location source should be polled and the minimum
//! movement between updates, based on how long the device has been idle
//! at its current position. Pure state, no I/O; the recording filter asks
//! for the desired interval after every fix and re-registers with the
//! source when the answer changes.

use crate::config::IntervalPolicy;
use std::time::Duration;

const ONE_SECOND: Duration = Duration::from_secs(1);
const THIRTY_SECONDS: Duration = Duration::from_secs(30);
const FIVE_MINUTES: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq)]
pub enum LocationListenerPolicy {
    /// Fixed interval regardless of idle time.
    Absolute { interval: Duration },
    /// Interval grows with idle time between a min and max bound, trading
    /// battery for responsiveness while stationary.
    Adaptive {
        min_interval: Duration,
        max_interval: Duration,
        min_distance: f64,
        idle_time: Duration,
    },
}

impl LocationListenerPolicy {
    pub fn absolute(interval: Duration) -> Self {
        LocationListenerPolicy::Absolute { interval }
    }

    pub fn adaptive(min_interval: Duration, max_interval: Duration, min_distance: f64) -> Self {
        LocationListenerPolicy::Adaptive {
            min_interval,
            max_interval,
            min_distance,
            idle_time: Duration::ZERO,
        }
    }

    /// Map the preference value to a policy variant.
    pub fn from_preference(policy: IntervalPolicy) -> Self {
        match policy {
            // Choose battery life over moving time accuracy.
            IntervalPolicy::AdaptBatteryLife => Self::adaptive(THIRTY_SECONDS, FIVE_MINUTES, 5.0),
            // Get all the updates.
            IntervalPolicy::AdaptAccuracy => Self::adaptive(ONE_SECOND, THIRTY_SECONDS, 0.0),
            IntervalPolicy::Absolute(seconds) => Self::absolute(Duration::from_secs(seconds)),
        }
    }

    /// The polling interval this policy would like at this moment.
    pub fn desired_polling_interval(&self) -> Duration {
        match self {
            LocationListenerPolicy::Absolute { interval } => *interval,
            LocationListenerPolicy::Adaptive { min_interval, max_interval, idle_time, .. } => {
                // Half the idle time, rounded down to whole seconds.
                let desired = Duration::from_secs(idle_time.as_secs() / 2);
                desired.clamp(*min_interval, *max_interval)
            }
        }
    }

    /// Minimum distance between updates in meters.
    pub fn min_distance(&self) -> f64 {
        match self {
            LocationListenerPolicy::Absolute { .. } => 0.0,
            LocationListenerPolicy::Adaptive { min_distance, .. } => *min_distance,
        }
    }

    /// Record how long the device has been idle at its current location.
    pub fn update_idle_time(&mut self, idle: Duration) {
        if let LocationListenerPolicy::Adaptive { idle_time, .. } = self {
            *idle_time = idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_ignores_idle_time() {
        let mut policy = LocationListenerPolicy::absolute(Duration::from_secs(10));
        assert_eq!(policy.desired_polling_interval(), Duration::from_secs(10));
        policy.update_idle_time(Duration::from_secs(600));
        assert_eq!(policy.desired_polling_interval(), Duration::from_secs(10));
        assert_eq!(policy.min_distance(), 0.0);
    }

    #[test]
    fn test_adaptive_grows_with_idle_time() {
        let mut policy =
            LocationListenerPolicy::adaptive(Duration::from_secs(30), Duration::from_secs(300), 5.0);
        // No idle time yet: clamped up to the minimum
        assert_eq!(policy.desired_polling_interval(), Duration::from_secs(30));

        policy.update_idle_time(Duration::from_secs(120));
        assert_eq!(policy.desired_polling_interval(), Duration::from_secs(60));

        // Odd millisecond idle times round down to whole seconds
        policy.update_idle_time(Duration::from_millis(121_500));
        assert_eq!(policy.desired_polling_interval(), Duration::from_secs(60));

        // Far past the threshold: capped at the maximum
        policy.update_idle_time(Duration::from_secs(3600));
        assert_eq!(policy.desired_polling_interval(), Duration::from_secs(300));
        assert_eq!(policy.min_distance(), 5.0);
    }

    #[test]
    fn test_preference_mapping() {
        let battery = LocationListenerPolicy::from_preference(IntervalPolicy::AdaptBatteryLife);
        assert_eq!(battery.desired_polling_interval(), Duration::from_secs(30));

        let accuracy = LocationListenerPolicy::from_preference(IntervalPolicy::AdaptAccuracy);
        assert_eq!(accuracy.desired_polling_interval(), Duration::from_secs(1));
        assert_eq!(accuracy.min_distance(), 0.0);

        let absolute = LocationListenerPolicy::from_preference(IntervalPolicy::Absolute(15));
        assert_eq!(absolute.desired_polling_interval(), Duration::from_secs(15));
    }
}

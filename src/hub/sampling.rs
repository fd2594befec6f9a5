// src/hub/sampling.rs
//! Resampling of the persisted point stream for display
//!
//! Translates an unbounded, append-only point stream into a bounded
//! sampled-in set: every stride-th point is shown, segment splits are
//! always surfaced, and the point right after a split is forced in so a
//! gap is never silently bridged. The stride is derived once per scan
//! from the id span ahead of the cursor.

use crate::track::point::PointId;
use crate::track::TrackPoint;

/// Outcome for one scanned point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDecision {
    SampledIn,
    SampledOut,
    SegmentSplit,
}

/// Cursor state over one track's point stream. Mutated only by the hub
/// worker; reset whenever the selection changes or the point budget is
/// exceeded.
#[derive(Debug, Clone)]
pub struct SamplingState {
    num_loaded_points: usize,
    first_seen_id: Option<PointId>,
    last_seen_id: Option<PointId>,
    // Valid for the current scan only
    stride: Option<usize>,
    include_next: bool,
}

impl SamplingState {
    pub fn new() -> Self {
        Self {
            num_loaded_points: 0,
            first_seen_id: None,
            last_seen_id: None,
            stride: None,
            include_next: false,
        }
    }

    /// Forget everything; the next scan restarts from the track start.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Start a scan window: the stride is re-derived from the first point
    /// seen in this window.
    pub fn begin_scan(&mut self) {
        self.stride = None;
        self.include_next = false;
    }

    pub fn num_loaded_points(&self) -> usize {
        self.num_loaded_points
    }

    pub fn last_seen_id(&self) -> Option<PointId> {
        self.last_seen_id
    }

    /// True once the loaded-point count has reached the display budget,
    /// i.e. the track should be resampled from scratch at a coarser
    /// stride.
    pub fn needs_resample(&self, target_points: usize) -> bool {
        self.num_loaded_points >= target_points
    }

    /// Classify the next point in id order.
    ///
    /// `last_track_point_id` is the id of the newest persisted point and
    /// anchors the stride; the final point of a track that is not being
    /// recorded is always sampled in so the end marker stays visible.
    pub fn decide(
        &mut self,
        point: &TrackPoint,
        last_track_point_id: PointId,
        target_points: usize,
        track_recording: bool,
    ) -> SampleDecision {
        let first_seen_id = *self.first_seen_id.get_or_insert(point.id);
        let stride = *self.stride.get_or_insert_with(|| {
            let span = (last_track_point_id - first_seen_id).max(0) as usize;
            1 + span / target_points.max(1)
        });

        let decision = if !point.is_valid_fix() {
            self.include_next = true;
            SampleDecision::SegmentSplit
        } else if self.include_next
            || self.num_loaded_points % stride == 0
            || (point.id == last_track_point_id && !track_recording)
        {
            self.include_next = false;
            SampleDecision::SampledIn
        } else {
            SampleDecision::SampledOut
        };

        self.num_loaded_points += 1;
        self.last_seen_id = Some(point.id);
        decision
    }
}

impl Default for SamplingState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gps::Fix;
    use crate::track::point::PointKind;
    use chrono::{TimeZone, Utc};

    fn point(id: PointId, kind: PointKind) -> TrackPoint {
        let (latitude, longitude) = match kind.sentinel_coordinates() {
            Some(coordinates) => coordinates,
            None => (45.0, 7.0),
        };
        TrackPoint {
            id,
            track_id: 1,
            kind,
            fix: Fix::new(latitude, longitude, Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap()),
        }
    }

    #[test]
    fn test_stride_formula() {
        // Ids 1..=1000 with a target of 100: stride = 1 + 999/100 = 10,
        // so roughly every 10th point is shown.
        let mut state = SamplingState::new();
        state.begin_scan();
        state.decide(&point(1, PointKind::Fix), 1000, 100, true);
        let mut sampled_in = 1;
        for id in 2..=1000 {
            if state.decide(&point(id, PointKind::Fix), 1000, 100, true) == SampleDecision::SampledIn
            {
                sampled_in += 1;
            }
        }
        // Every 10th point; nothing extra is forced in while recording
        assert_eq!(state.num_loaded_points(), 1000);
        assert!(sampled_in <= 101, "sampled in {}", sampled_in);
        assert!(sampled_in >= 91, "sampled in {}", sampled_in);
    }

    #[test]
    fn test_first_point_always_sampled_in() {
        let mut state = SamplingState::new();
        state.begin_scan();
        assert_eq!(
            state.decide(&point(1, PointKind::Fix), 500, 10, true),
            SampleDecision::SampledIn
        );
    }

    #[test]
    fn test_split_forces_next_point_in() {
        let mut state = SamplingState::new();
        state.begin_scan();
        // Large stride so ordinary points would be sampled out
        state.decide(&point(1, PointKind::Fix), 1000, 10, true);
        assert_eq!(
            state.decide(&point(2, PointKind::Fix), 1000, 10, true),
            SampleDecision::SampledOut
        );
        assert_eq!(
            state.decide(&point(3, PointKind::Pause), 1000, 10, true),
            SampleDecision::SegmentSplit
        );
        // The next valid point bypasses the stride
        assert_eq!(
            state.decide(&point(4, PointKind::Fix), 1000, 10, true),
            SampleDecision::SampledIn
        );
        assert_eq!(
            state.decide(&point(5, PointKind::Fix), 1000, 10, true),
            SampleDecision::SampledOut
        );
    }

    #[test]
    fn test_last_point_shown_when_not_recording() {
        let mut state = SamplingState::new();
        state.begin_scan();
        state.decide(&point(1, PointKind::Fix), 100, 10, false);
        for id in 2..100 {
            state.decide(&point(id, PointKind::Fix), 100, 10, false);
        }
        assert_eq!(
            state.decide(&point(100, PointKind::Fix), 100, 10, false),
            SampleDecision::SampledIn
        );

        // While recording the same trailing point follows the stride
        let mut recording = SamplingState::new();
        recording.begin_scan();
        for id in 1..=99 {
            recording.decide(&point(id, PointKind::Fix), 100, 10, true);
        }
        assert_eq!(
            recording.decide(&point(100, PointKind::Fix), 100, 10, true),
            SampleDecision::SampledOut
        );
    }

    #[test]
    fn test_incremental_scan_keeps_counting() {
        let mut state = SamplingState::new();
        state.begin_scan();
        for id in 1..=10 {
            state.decide(&point(id, PointKind::Fix), 10, 100, true);
        }
        assert_eq!(state.last_seen_id(), Some(10));

        // New points arrive; a fresh scan window continues the count
        state.begin_scan();
        for id in 11..=20 {
            state.decide(&point(id, PointKind::Fix), 20, 100, true);
        }
        assert_eq!(state.num_loaded_points(), 20);
        assert_eq!(state.last_seen_id(), Some(20));
    }

    #[test]
    fn test_needs_resample_at_budget() {
        let mut state = SamplingState::new();
        state.begin_scan();
        for id in 1..=50 {
            state.decide(&point(id, PointKind::Fix), 50, 100, true);
        }
        assert!(!state.needs_resample(100));
        for id in 51..=100 {
            state.decide(&point(id, PointKind::Fix), 100, 100, true);
        }
        assert!(state.needs_resample(100));
        state.reset();
        assert_eq!(state.num_loaded_points(), 0);
        assert!(state.last_seen_id().is_none());
    }
}

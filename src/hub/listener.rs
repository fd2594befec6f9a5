// src/hub/listener.rs
//! Listener interface for track data distribution
//!
//! Consumers receive one tagged event stream instead of implementing a
//! wide interface; the interest set declared at registration filters
//! which event families they see.

use crate::gps::Fix;
use crate::track::{Track, TrackPoint, Waypoint};
use std::collections::HashSet;

/// Quality of the live location, as shown to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationState {
    Disabled,
    NoFix,
    BadFix,
    GoodFix,
}

/// Families of data a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackDataType {
    SelectedTrack,
    TracksTable,
    WaypointsTable,
    SampledInPoints,
    SampledOutPoints,
    Location,
    Heading,
    Preference,
}

/// One push notification from the hub.
///
/// Point and waypoint pushes arrive in batches: a full reload opens with
/// the matching `Clear...` event, and every batch closes with the
/// matching `...Done` event so listeners can defer expensive redraws.
#[derive(Debug, Clone)]
pub enum TrackDataEvent {
    LocationStateChanged(LocationState),
    LocationChanged(Fix),
    HeadingChanged(f64),
    SelectedTrackChanged(Option<Track>),
    TrackUpdated(Option<Track>),
    ClearTrackPoints,
    SampledInPoint(TrackPoint),
    SampledOutPoint(TrackPoint),
    SegmentSplit(TrackPoint),
    TrackPointsDone,
    ClearWaypoints,
    NewWaypoint(Waypoint),
    WaypointsDone,
}

/// A display-relevant preference changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreferenceChange {
    MetricUnits(bool),
    ReportSpeed(bool),
    MinRecordingDistance(f64),
}

/// Receives push notifications on the hub's worker. Callbacks must not
/// block and must not call back into the hub synchronously; enqueue via a
/// cloned hub handle instead.
pub trait TrackDataListener: Send {
    fn on_event(&mut self, event: TrackDataEvent);

    /// Return true to request a reload of this listener's data.
    fn on_preference_changed(&mut self, change: &PreferenceChange) -> bool {
        let _ = change;
        false
    }
}

pub type ListenerId = u64;

/// A registered listener with its interest set.
pub(crate) struct ListenerRegistration {
    pub id: ListenerId,
    pub listener: Box<dyn TrackDataListener>,
    pub interests: HashSet<TrackDataType>,
}

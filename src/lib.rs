// src/lib.rs
//! Track Recorder Library
//!
//! A GPS track recording engine: filters raw fixes into durable track
//! points, maintains trip statistics incrementally, and redistributes a
//! resampled, display-ready view of the data to registered listeners.

pub mod config;
pub mod error;
pub mod gps;
pub mod hub;
pub mod recording;
pub mod stats;
pub mod storage;
pub mod track;

// Re-export main types for convenience
pub use config::{IntervalPolicy, PreferenceKey, PreferenceStore, Preferences};
pub use error::{Result, TrackError};
pub use gps::{Fix, GpsdSource, LocationSource, SimulatedSource};
pub use hub::{
    LocationState, TrackDataEvent, TrackDataHub, TrackDataListener, TrackDataType,
};
pub use recording::{RecordingFilter, RecordingState, TrackRecorder};
pub use stats::{SmoothingBuffer, TripStatistics, TripStatisticsUpdater};
pub use storage::{MemoryStorage, TableListener, TrackStorage};
pub use track::{Track, TrackPoint, Waypoint, WaypointRequest};

// src/config.rs v2
//! Recording preferences with file-backed storage
//!
//! Preferences cover the filter thresholds, the polling interval policy,
//! display units, and the current selection/recording state. The recording
//! state lives here (rather than inside the recorder) so that the data hub
//! can answer "is the selected track recording" without talking to the
//! recorder directly.

use crate::error::{Result, TrackError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// How the location source polling interval is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalPolicy {
    /// Grow the interval while idle, trading accuracy for battery.
    AdaptBatteryLife,
    /// Keep the interval short, trading battery for accuracy.
    AdaptAccuracy,
    /// Fixed interval in seconds regardless of idle time.
    Absolute(u64),
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        IntervalPolicy::Absolute(0)
    }
}

/// Preference keys, used to scope change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreferenceKey {
    MinRecordingDistance,
    MaxRecordingDistance,
    MinRequiredAccuracy,
    MinRecordingInterval,
    MetricUnits,
    ReportSpeed,
    TargetDisplayedPoints,
    SelectedTrackId,
    RecordingTrackId,
    RecordingPaused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    /// Minimum distance in meters between recorded points.
    pub min_recording_distance: f64,
    /// Distance in meters beyond which a fix is treated as a segment break.
    pub max_recording_distance: f64,
    /// Fixes with a worse accuracy radius (meters) are dropped.
    pub min_required_accuracy: f64,
    pub min_recording_interval: IntervalPolicy,
    pub metric_units: bool,
    /// Report speed (true) or pace (false).
    pub report_speed: bool,
    /// Target number of on-screen points before resampling kicks in.
    pub target_displayed_points: usize,
    pub selected_track_id: Option<i64>,
    pub recording_track_id: Option<i64>,
    pub recording_paused: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            min_recording_distance: 5.0,
            max_recording_distance: 200.0,
            min_required_accuracy: 200.0,
            min_recording_interval: IntervalPolicy::default(),
            metric_units: true,
            report_speed: true,
            target_displayed_points: 2000,
            selected_track_id: None,
            recording_track_id: None,
            recording_paused: false,
        }
    }
}

/// Shared preference storage. Readers take a snapshot; writers persist to
/// the backing file (when one is configured) and are expected to follow up
/// with a change notification to interested components.
pub struct PreferenceStore {
    inner: RwLock<Preferences>,
    path: Option<PathBuf>,
}

impl PreferenceStore {
    /// In-memory store with default values. Used by tests and embedders
    /// that manage persistence themselves.
    pub fn in_memory() -> Self {
        Self { inner: RwLock::new(Preferences::default()), path: None }
    }

    /// Load from a JSON file, falling back to defaults when the file does
    /// not exist yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        let preferences = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| TrackError::Config(format!("Failed to read preferences: {}", e)))?;
            serde_json::from_str(&contents)
                .map_err(|e| TrackError::Config(format!("Failed to parse preferences: {}", e)))?
        } else {
            Preferences::default()
        };
        Ok(Self { inner: RwLock::new(preferences), path: Some(path.to_path_buf()) })
    }

    /// Default preference file path under the user's config directory.
    pub fn default_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .map_err(|_| TrackError::Config("HOME environment variable not set".to_string()))?;
        Ok(PathBuf::from(home).join(".config").join("track-recorder").join("preferences.json"))
    }

    fn save(&self, preferences: &Preferences) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TrackError::Config(format!("Failed to create config directory: {}", e)))?;
        }
        let contents = serde_json::to_string_pretty(preferences)?;
        std::fs::write(path, contents)
            .map_err(|e| TrackError::Config(format!("Failed to write preferences: {}", e)))?;
        Ok(())
    }

    /// A point-in-time copy of all preferences.
    pub fn snapshot(&self) -> Preferences {
        self.inner.read().unwrap().clone()
    }

    pub fn min_recording_distance(&self) -> f64 {
        self.inner.read().unwrap().min_recording_distance
    }

    pub fn max_recording_distance(&self) -> f64 {
        self.inner.read().unwrap().max_recording_distance
    }

    pub fn min_required_accuracy(&self) -> f64 {
        self.inner.read().unwrap().min_required_accuracy
    }

    pub fn min_recording_interval(&self) -> IntervalPolicy {
        self.inner.read().unwrap().min_recording_interval
    }

    pub fn metric_units(&self) -> bool {
        self.inner.read().unwrap().metric_units
    }

    pub fn report_speed(&self) -> bool {
        self.inner.read().unwrap().report_speed
    }

    pub fn target_displayed_points(&self) -> usize {
        self.inner.read().unwrap().target_displayed_points
    }

    pub fn selected_track_id(&self) -> Option<i64> {
        self.inner.read().unwrap().selected_track_id
    }

    pub fn recording_track_id(&self) -> Option<i64> {
        self.inner.read().unwrap().recording_track_id
    }

    pub fn recording_paused(&self) -> bool {
        self.inner.read().unwrap().recording_paused
    }

    fn update<F: FnOnce(&mut Preferences)>(&self, apply: F) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        apply(&mut guard);
        self.save(&guard)
    }

    pub fn set_min_recording_distance(&self, meters: f64) -> Result<()> {
        self.update(|p| p.min_recording_distance = meters)
    }

    pub fn set_max_recording_distance(&self, meters: f64) -> Result<()> {
        self.update(|p| p.max_recording_distance = meters)
    }

    pub fn set_min_required_accuracy(&self, meters: f64) -> Result<()> {
        self.update(|p| p.min_required_accuracy = meters)
    }

    pub fn set_min_recording_interval(&self, policy: IntervalPolicy) -> Result<()> {
        self.update(|p| p.min_recording_interval = policy)
    }

    pub fn set_metric_units(&self, metric: bool) -> Result<()> {
        self.update(|p| p.metric_units = metric)
    }

    pub fn set_report_speed(&self, report_speed: bool) -> Result<()> {
        self.update(|p| p.report_speed = report_speed)
    }

    pub fn set_target_displayed_points(&self, target: usize) -> Result<()> {
        self.update(|p| p.target_displayed_points = target.max(1))
    }

    pub fn set_selected_track_id(&self, track_id: Option<i64>) -> Result<()> {
        self.update(|p| p.selected_track_id = track_id)
    }

    pub fn set_recording_state(&self, track_id: Option<i64>, paused: bool) -> Result<()> {
        self.update(|p| {
            p.recording_track_id = track_id;
            p.recording_paused = paused;
        })
    }
}

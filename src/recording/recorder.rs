// src/recording/recorder.rs
//! The recording state machine and its single-threaded worker
//!
//! `RecordingFilter` is the synchronous core: it consumes raw fixes,
//! applies validity/accuracy/distance gating, writes track points and
//! sentinel markers through the storage boundary, and drives the two trip
//! statistics updaters. `TrackRecorder` wraps it in a command channel
//! drained by one task, so fixes are processed strictly one at a time.
//!
//! Point writes use write-ahead-one semantics: the most recent accepted
//! fix sits in a one-slot buffer and is only persisted when the next
//! accepted fix (or a pause/stop) confirms it. Dropped fixes are never
//! buffered. This lets a segment be closed exactly where it ended without
//! duplicate-timestamp writes.

use super::policy::LocationListenerPolicy;
use crate::config::PreferenceStore;
use crate::error::{Result, TrackError};
use crate::gps::{Fix, LocationSource, RegistrationId, SourceEvent};
use crate::stats::{TripStatistics, TripStatisticsUpdater};
use crate::storage::TrackStorage;
use crate::track::point::{sentinel_fix, PointId, PointKind};
use crate::track::{Track, TrackId, Waypoint, WaypointId, WaypointKind, WaypointRequest};
use chrono::Utc;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Current state of the recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording { track_id: TrackId },
    Paused { track_id: TrackId },
}

#[derive(Debug, Clone)]
struct BufferedFix {
    fix: Fix,
    persisted: bool,
}

/// The recording filter core. All methods are synchronous and must only
/// be called from one thread at a time; `TrackRecorder` provides that
/// serialization.
pub struct RecordingFilter {
    storage: Arc<dyn TrackStorage>,
    preferences: Arc<PreferenceStore>,
    source: Arc<dyn LocationSource>,
    policy: LocationListenerPolicy,
    fix_sink: Option<mpsc::UnboundedSender<SourceEvent>>,
    registration: Option<RegistrationId>,
    current_interval: Option<Duration>,

    recording_track_id: Option<TrackId>,
    paused: bool,
    track_updater: Option<TripStatisticsUpdater>,
    marker_updater: Option<TripStatisticsUpdater>,
    buffered: Option<BufferedFix>,
    current_segment_has_location: bool,
}

impl RecordingFilter {
    pub fn new(
        storage: Arc<dyn TrackStorage>,
        preferences: Arc<PreferenceStore>,
        source: Arc<dyn LocationSource>,
    ) -> Self {
        let policy = LocationListenerPolicy::from_preference(preferences.min_recording_interval());
        Self {
            storage,
            preferences,
            source,
            policy,
            fix_sink: None,
            registration: None,
            current_interval: None,
            recording_track_id: None,
            paused: false,
            track_updater: None,
            marker_updater: None,
            buffered: None,
            current_segment_has_location: false,
        }
    }

    /// Install the sink that location-source registrations deliver to.
    /// Without a sink the filter never registers with the source and
    /// fixes must be fed through `on_fix` directly.
    pub fn set_fix_sink(&mut self, sink: mpsc::UnboundedSender<SourceEvent>) {
        self.fix_sink = Some(sink);
    }

    pub fn is_recording(&self) -> bool {
        self.recording_track_id.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn recording_state(&self) -> RecordingState {
        match self.recording_track_id {
            None => RecordingState::Idle,
            Some(track_id) if self.paused => RecordingState::Paused { track_id },
            Some(track_id) => RecordingState::Recording { track_id },
        }
    }

    /// Statistics of the active recording with total time extended to now
    /// (unless paused). None while idle.
    pub fn current_statistics(&mut self) -> Option<TripStatistics> {
        let paused = self.paused;
        self.track_updater.as_mut().map(|updater| {
            if !paused {
                updater.update_time(Utc::now());
            }
            updater.snapshot()
        })
    }

    /// Start a new track. Fails when a recording is already active.
    pub fn start_new_track(&mut self) -> Result<TrackId> {
        if self.is_recording() {
            log::debug!("Ignoring start_new_track: already recording");
            return Err(TrackError::AlreadyRecording);
        }
        let now = Utc::now();
        self.track_updater = Some(TripStatisticsUpdater::new(now));
        self.marker_updater = Some(TripStatisticsUpdater::new(now));

        let name = format!("Track {}", now.format("%Y-%m-%d %H:%M"));
        let track = Track::new(name, String::new(), TripStatistics::new(now));
        let track_id = self.storage.insert_track(&track)?;

        self.recording_track_id = Some(track_id);
        self.paused = false;
        self.update_recording_preferences();

        let mut track = self.storage.get_track(track_id).ok_or_else(|| {
            TrackError::InvalidState(format!("Track {} vanished after insert", track_id))
        })?;
        track.statistics = self.track_updater.as_ref().unwrap().snapshot();
        self.storage.update_track(&track)?;

        if let Err(e) = self.insert_waypoint(WaypointRequest::start_of_track()) {
            log::warn!("Could not insert start-of-track marker: {}", e);
        }

        self.start_recording_segment();
        log::info!("Started recording track {}", track_id);
        Ok(track_id)
    }

    /// Pause the active recording, closing the open segment.
    pub fn pause_current_track(&mut self) -> Result<()> {
        if !self.is_recording() {
            log::debug!("Ignoring pause_current_track: not recording");
            return Err(TrackError::NotRecording);
        }
        if self.paused {
            log::debug!("Ignoring pause_current_track: already paused");
            return Err(TrackError::Paused);
        }
        self.flush_buffered();
        self.insert_point(PointKind::Pause, &sentinel_fix(PointKind::Pause, Utc::now()));

        self.paused = true;
        self.update_recording_preferences();
        self.end_recording_segment();
        log::info!("Paused recording");
        Ok(())
    }

    /// Resume a paused recording with a resume marker at the current time.
    pub fn resume_current_track(&mut self) -> Result<()> {
        if !self.is_recording() {
            log::debug!("Ignoring resume_current_track: not recording");
            return Err(TrackError::NotRecording);
        }
        if !self.paused {
            log::debug!("Ignoring resume_current_track: not paused");
            return Err(TrackError::NotPaused);
        }
        self.paused = false;
        self.update_recording_preferences();
        self.insert_point(PointKind::Resume, &sentinel_fix(PointKind::Resume, Utc::now()));
        self.start_recording_segment();
        log::info!("Resumed recording");
        Ok(())
    }

    /// End the active recording. Terminal for this session: no further
    /// writes are accepted for the track.
    pub fn end_current_track(&mut self) -> Result<()> {
        if !self.is_recording() {
            log::debug!("Ignoring end_current_track: not recording");
            return Err(TrackError::NotRecording);
        }
        let track_id = self.recording_track_id.unwrap();
        if !self.paused {
            self.flush_buffered();
        }

        if let Some(mut track) = self.storage.get_track(track_id) {
            if let Some(updater) = &mut self.track_updater {
                updater.update_time(Utc::now());
                track.statistics = updater.snapshot();
            }
            track.stop_point_id = self.storage.get_last_point_id(track_id);
            if let Err(e) = self.storage.update_track(&track) {
                log::warn!("Failed to finalize track {}: {}", track_id, e);
            }
        } else {
            log::error!("Recording track {} missing at end", track_id);
        }

        self.recording_track_id = None;
        self.paused = false;
        self.update_recording_preferences();
        self.track_updater = None;
        self.marker_updater = None;
        self.end_recording_segment();
        log::info!("Ended recording track {}", track_id);
        Ok(())
    }

    /// Rebuild recording state for a track that storage reports as
    /// mid-recording (e.g. after a process restart): both updaters are
    /// reconstructed by replaying the persisted points.
    pub fn restart_track(&mut self, track_id: TrackId) -> Result<()> {
        if self.is_recording() {
            return Err(TrackError::AlreadyRecording);
        }
        let track = self.storage.get_track(track_id).ok_or_else(|| {
            TrackError::InvalidState(format!("No track with id {} to restart", track_id))
        })?;
        log::info!("Restarting track {}", track_id);

        let track_start = track.statistics.start_time();
        let marker_start = self
            .storage
            .waypoints(track_id, usize::MAX)
            .iter()
            .rev()
            .find_map(|w| w.statistics.as_ref().map(|s| s.stop_time()))
            .unwrap_or(track_start);

        let mut track_updater = TripStatisticsUpdater::new(track_start);
        let mut marker_updater = TripStatisticsUpdater::new(marker_start);
        let min_distance = self.preferences.min_recording_distance();
        for point in self.storage.point_cursor(track_id, 0) {
            track_updater.add_location(&point.fix, min_distance);
            if point.fix.time > marker_start {
                marker_updater.add_location(&point.fix, min_distance);
            }
        }
        self.track_updater = Some(track_updater);
        self.marker_updater = Some(marker_updater);
        self.recording_track_id = Some(track_id);
        self.paused = false;
        self.update_recording_preferences();
        self.start_recording_segment();
        Ok(())
    }

    /// Insert a waypoint for the active recording.
    pub fn insert_waypoint(&mut self, request: WaypointRequest) -> Result<WaypointId> {
        if !self.is_recording() {
            return Err(TrackError::NotRecording);
        }
        if self.paused {
            return Err(TrackError::Paused);
        }
        let track_id = self.recording_track_id.unwrap();
        let kind = if request.statistics { WaypointKind::Statistics } else { WaypointKind::Marker };

        let name = match request.name {
            Some(name) => name,
            None => {
                let number = self.storage.next_waypoint_number(track_id, kind);
                match kind {
                    WaypointKind::Statistics => format!("Split {}", number),
                    WaypointKind::Marker => format!("Marker {}", number),
                }
            }
        };

        let (statistics, description) = if request.statistics {
            let now = Utc::now();
            let updater = self
                .marker_updater
                .as_mut()
                .ok_or_else(|| TrackError::InvalidState("No marker updater while recording".to_string()))?;
            updater.update_time(now);
            let snapshot = updater.snapshot();
            let description = format!(
                "{:.2} km in {} s",
                snapshot.total_distance() / 1000.0,
                snapshot.total_time().as_secs()
            );
            // Close out the interval and reseed at now
            self.marker_updater = Some(TripStatisticsUpdater::new(now));
            (Some(snapshot), request.description.unwrap_or(description))
        } else {
            (None, request.description.unwrap_or_default())
        };

        let last_point = if self.current_segment_has_location {
            self.storage.get_last_valid_point(track_id)
        } else {
            None
        };

        let (latitude, longitude, altitude, time, length, duration_ms) = match last_point {
            Some(point) => {
                let track_stats = self
                    .track_updater
                    .as_ref()
                    .map(|u| u.snapshot())
                    .unwrap_or_else(|| TripStatistics::new(point.fix.time));
                (
                    point.fix.latitude,
                    point.fix.longitude,
                    point.fix.altitude,
                    point.fix.time,
                    track_stats.total_distance(),
                    track_stats.total_time().as_millis() as i64,
                )
            }
            None => {
                if !request.track_statistics {
                    return Err(TrackError::InvalidState(
                        "No location in the current segment".to_string(),
                    ));
                }
                // Track-wide statistics marker before the first point:
                // persisted with a placeholder (invalid) location.
                (100.0, 180.0, None, Utc::now(), 0.0, 0)
            }
        };

        let waypoint = Waypoint {
            id: -1,
            track_id,
            name,
            description,
            category: request.category.unwrap_or_default(),
            kind,
            latitude,
            longitude,
            altitude,
            time,
            length,
            duration_ms,
            statistics,
        };
        self.storage.insert_waypoint(&waypoint)
    }

    /// Feed one raw fix through the gating pipeline. Never fails; fixes
    /// that don't survive the filters are logged and dropped.
    pub fn on_fix(&mut self, fix: Fix) {
        if !self.is_recording() || self.paused {
            log::warn!("Ignoring fix: not recording or paused");
            return;
        }
        let track_id = self.recording_track_id.unwrap();
        if self.storage.get_track(track_id).is_none() {
            log::warn!("Ignoring fix: recording track {} not in storage", track_id);
            return;
        }
        if !fix.is_valid() {
            log::warn!("Ignoring fix: invalid coordinates");
            return;
        }
        let min_required_accuracy = self.preferences.min_required_accuracy();
        if fix.accuracy.map_or(false, |accuracy| accuracy > min_required_accuracy) {
            log::debug!("Ignoring fix: accuracy worse than {} m", min_required_accuracy);
            return;
        }

        let last_valid = if self.current_segment_has_location {
            self.storage.get_last_valid_point(track_id)
        } else {
            None
        };

        // Adaptive polling feedback: idle time since the last valid point
        let idle_ms = last_valid
            .as_ref()
            .map(|point| fix.time.signed_duration_since(point.fix.time).num_milliseconds().max(0))
            .unwrap_or(0);
        self.policy.update_idle_time(Duration::from_millis(idle_ms as u64));
        if self.current_interval != Some(self.policy.desired_polling_interval()) {
            self.register_location_listener();
        }

        if !self.current_segment_has_location {
            // Always insert the first location of a segment
            self.insert_point(PointKind::Fix, &fix);
            self.current_segment_has_location = true;
            self.buffered = Some(BufferedFix { fix, persisted: true });
            return;
        }

        let Some(last_valid) = last_valid else {
            // Should not happen: the segment claims a location but storage
            // has none. Recover by treating this as a segment start.
            log::error!("Segment marked as having a location but storage has none");
            self.insert_point(PointKind::Fix, &fix);
            self.buffered = Some(BufferedFix { fix, persisted: true });
            return;
        };

        let distance = fix.distance_to(&last_valid.fix);
        let min_distance = self.preferences.min_recording_distance();
        let max_distance = self.preferences.max_recording_distance();

        if distance < min_distance && !fix.has_sensor_data() {
            log::debug!("Dropping fix {:.1} m from the last point", distance);
            return;
        }

        if distance > max_distance {
            // Implausible jump (tunnel, glitch): close the segment where
            // it actually ended and start a new one at the far fix.
            let break_time = self
                .buffered
                .as_ref()
                .map(|b| b.fix.time)
                .unwrap_or(last_valid.fix.time);
            self.flush_buffered();
            self.insert_point(PointKind::Pause, &sentinel_fix(PointKind::Pause, break_time));
            self.insert_point(PointKind::Fix, &fix);
            self.buffered = Some(BufferedFix { fix, persisted: true });
            log::info!("Segment break after {:.0} m jump", distance);
            return;
        }

        self.flush_buffered();
        self.buffered = Some(BufferedFix { fix, persisted: false });
    }

    /// Persist the buffered fix if it hasn't been written yet.
    fn flush_buffered(&mut self) {
        let Some(buffered) = &self.buffered else {
            return;
        };
        if buffered.persisted {
            return;
        }
        let fix = buffered.fix.clone();

        // Duplicate-timestamp guard: merging with a sentinel insertion
        // must not write the same instant twice.
        if let Some(track_id) = self.recording_track_id {
            if let Some(last) = self.storage.get_last_valid_point(track_id) {
                if last.fix.time == fix.time {
                    log::warn!("Skipping flush: timestamp equals last persisted point");
                    if let Some(buffered) = &mut self.buffered {
                        buffered.persisted = true;
                    }
                    return;
                }
            }
        }

        self.insert_point(PointKind::Fix, &fix);
        if let Some(buffered) = &mut self.buffered {
            buffered.persisted = true;
        }
    }

    /// Write one point, then advance statistics and the track row. The
    /// updaters are only advanced after a successful write; a failed
    /// write is logged and skipped without corrupting in-memory state.
    fn insert_point(&mut self, kind: PointKind, fix: &Fix) -> Option<PointId> {
        let track_id = self.recording_track_id?;
        let point_id = match self.storage.insert_track_point(track_id, kind, fix) {
            Ok(point_id) => point_id,
            Err(e) => {
                log::warn!("Failed to insert track point: {}", e);
                return None;
            }
        };

        // Updaters see what storage persisted: markers with their
        // sentinel encoding, which resets their segment state.
        let stored_fix = if kind.is_marker() { sentinel_fix(kind, fix.time) } else { fix.clone() };
        let min_distance = self.preferences.min_recording_distance();
        if let Some(updater) = &mut self.track_updater {
            updater.add_location(&stored_fix, min_distance);
        }
        if let Some(updater) = &mut self.marker_updater {
            updater.add_location(&stored_fix, min_distance);
        }

        self.update_recording_track(track_id, point_id, kind == PointKind::Fix && fix.is_valid());
        Some(point_id)
    }

    fn update_recording_track(&mut self, track_id: TrackId, point_id: PointId, valid: bool) {
        let Some(mut track) = self.storage.get_track(track_id) else {
            log::error!("Recording track {} missing during update", track_id);
            return;
        };
        track.observe_point(point_id, valid);
        if let Some(updater) = &mut self.track_updater {
            updater.update_time(Utc::now());
            track.statistics = updater.snapshot();
        }
        if let Err(e) = self.storage.update_track(&track) {
            log::warn!("Failed to update track {}: {}", track_id, e);
        }
    }

    fn update_recording_preferences(&self) {
        if let Err(e) =
            self.preferences.set_recording_state(self.recording_track_id, self.paused)
        {
            log::warn!("Failed to persist recording state: {}", e);
        }
    }

    /// Common segment setup for start, resume and restart.
    fn start_recording_segment(&mut self) {
        self.buffered = None;
        self.current_segment_has_location = false;
        self.policy = LocationListenerPolicy::from_preference(self.preferences.min_recording_interval());
        self.register_location_listener();
    }

    /// Common teardown for pause and end: release the location listener.
    fn end_recording_segment(&mut self) {
        self.buffered = None;
        self.current_segment_has_location = false;
        self.unregister_location_listener();
    }

    /// (Re)install the location source registration with the interval the
    /// policy currently wants. Changing the interval is a resource
    /// reacquire, not a parameter flip.
    fn register_location_listener(&mut self) {
        let Some(sink) = self.fix_sink.clone() else {
            return;
        };
        self.unregister_location_listener();
        let interval = self.policy.desired_polling_interval();
        let registration = self.source.request_updates(interval, self.policy.min_distance(), sink);
        self.registration = Some(registration);
        self.current_interval = Some(interval);
    }

    fn unregister_location_listener(&mut self) {
        if let Some(registration) = self.registration.take() {
            self.source.remove_updates(registration);
        }
        self.current_interval = None;
    }

    #[cfg(test)]
    fn current_interval(&self) -> Option<Duration> {
        self.current_interval
    }
}

enum RecorderCommand {
    StartNewTrack(oneshot::Sender<Result<TrackId>>),
    Pause(oneshot::Sender<Result<()>>),
    Resume(oneshot::Sender<Result<()>>),
    End(oneshot::Sender<Result<()>>),
    InsertWaypoint(WaypointRequest, oneshot::Sender<Result<WaypointId>>),
    RecordingState(oneshot::Sender<RecordingState>),
    CurrentStatistics(oneshot::Sender<Option<TripStatistics>>),
    Shutdown,
}

/// Asynchronous handle to the recording worker. Cloneable; all calls are
/// serialized onto the worker task together with incoming fixes.
#[derive(Clone)]
pub struct TrackRecorder {
    commands: mpsc::UnboundedSender<RecorderCommand>,
    running: Arc<AtomicBool>,
}

impl TrackRecorder {
    /// Spawn the recording worker.
    pub fn spawn(
        storage: Arc<dyn TrackStorage>,
        preferences: Arc<PreferenceStore>,
        source: Arc<dyn LocationSource>,
    ) -> Self {
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (fix_tx, mut fix_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let mut filter = RecordingFilter::new(storage, preferences, source);
        filter.set_fix_sink(fix_tx);

        let worker_running = Arc::clone(&running);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        let Some(command) = command else { break };
                        if !worker_running.load(Ordering::Relaxed) {
                            break;
                        }
                        if Self::handle_command(&mut filter, command) {
                            break;
                        }
                    }
                    event = fix_rx.recv() => {
                        let Some(event) = event else { break };
                        if !worker_running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let SourceEvent::Fix(fix) = event {
                            // One bad fix must never stop the session.
                            let outcome = std::panic::catch_unwind(
                                std::panic::AssertUnwindSafe(|| filter.on_fix(fix)),
                            );
                            if outcome.is_err() {
                                log::error!("Panic while processing a fix; continuing");
                            }
                        }
                    }
                }
            }
            log::debug!("Recording worker stopped");
        });

        Self { commands: command_tx, running }
    }

    fn handle_command(filter: &mut RecordingFilter, command: RecorderCommand) -> bool {
        match command {
            RecorderCommand::StartNewTrack(reply) => {
                let _ = reply.send(filter.start_new_track());
            }
            RecorderCommand::Pause(reply) => {
                let _ = reply.send(filter.pause_current_track());
            }
            RecorderCommand::Resume(reply) => {
                let _ = reply.send(filter.resume_current_track());
            }
            RecorderCommand::End(reply) => {
                let _ = reply.send(filter.end_current_track());
            }
            RecorderCommand::InsertWaypoint(request, reply) => {
                let _ = reply.send(filter.insert_waypoint(request));
            }
            RecorderCommand::RecordingState(reply) => {
                let _ = reply.send(filter.recording_state());
            }
            RecorderCommand::CurrentStatistics(reply) => {
                let _ = reply.send(filter.current_statistics());
            }
            RecorderCommand::Shutdown => return true,
        }
        false
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RecorderCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .map_err(|_| TrackError::Other("Recording worker is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| TrackError::Other("Recording worker dropped the request".to_string()))
    }

    pub async fn start_new_track(&self) -> Result<TrackId> {
        self.request(RecorderCommand::StartNewTrack).await?
    }

    pub async fn pause_current_track(&self) -> Result<()> {
        self.request(RecorderCommand::Pause).await?
    }

    pub async fn resume_current_track(&self) -> Result<()> {
        self.request(RecorderCommand::Resume).await?
    }

    pub async fn end_current_track(&self) -> Result<()> {
        self.request(RecorderCommand::End).await?
    }

    pub async fn insert_waypoint(&self, request: WaypointRequest) -> Result<WaypointId> {
        self.request(|reply| RecorderCommand::InsertWaypoint(request, reply)).await?
    }

    pub async fn recording_state(&self) -> Result<RecordingState> {
        self.request(RecorderCommand::RecordingState).await
    }

    pub async fn current_statistics(&self) -> Result<Option<TripStatistics>> {
        self.request(RecorderCommand::CurrentStatistics).await
    }

    /// Stop the worker. Pending commands and fixes are discarded, not
    /// drained.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.commands.send(RecorderCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gps::SimulatedSource;
    use crate::storage::MemoryStorage;
    use crate::track::point::PointKind;
    use chrono::{DateTime, TimeZone};

    /// Meters of latitude per degree under the planar approximation.
    const METERS_PER_DEGREE: f64 = 111_194.93;

    fn time_at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn fix_north_of(base_latitude: f64, meters: f64, seconds: i64) -> Fix {
        let mut fix = Fix::new(base_latitude + meters / METERS_PER_DEGREE, 7.0, time_at(seconds));
        fix.speed = Some(2.0);
        fix.accuracy = Some(10.0);
        fix
    }

    fn new_filter() -> (RecordingFilter, Arc<MemoryStorage>, Arc<PreferenceStore>) {
        let storage = Arc::new(MemoryStorage::new());
        let preferences = Arc::new(PreferenceStore::in_memory());
        let source = Arc::new(SimulatedSource::new());
        let filter = RecordingFilter::new(
            storage.clone() as Arc<dyn TrackStorage>,
            preferences.clone(),
            source,
        );
        (filter, storage, preferences)
    }

    fn point_kinds(storage: &MemoryStorage, track_id: TrackId) -> Vec<PointKind> {
        storage.point_cursor(track_id, 0).map(|p| p.kind).collect()
    }

    #[test]
    fn test_double_start_fails_without_second_track() {
        let (mut filter, storage, _) = new_filter();
        let track_id = filter.start_new_track().unwrap();
        assert!(matches!(filter.start_new_track(), Err(TrackError::AlreadyRecording)));
        assert_eq!(filter.recording_state(), RecordingState::Recording { track_id });
        assert!(storage.get_track(track_id + 1).is_none());
    }

    #[test]
    fn test_recording_state_reflected_in_preferences() {
        let (mut filter, _, preferences) = new_filter();
        assert!(preferences.recording_track_id().is_none());
        let track_id = filter.start_new_track().unwrap();
        assert_eq!(preferences.recording_track_id(), Some(track_id));
        filter.pause_current_track().unwrap();
        assert!(preferences.recording_paused());
        filter.resume_current_track().unwrap();
        assert!(!preferences.recording_paused());
        filter.end_current_track().unwrap();
        assert!(preferences.recording_track_id().is_none());
    }

    #[test]
    fn test_write_ahead_one_point_delay() {
        let (mut filter, storage, _) = new_filter();
        let track_id = filter.start_new_track().unwrap();

        filter.on_fix(fix_north_of(45.0, 0.0, 0));
        assert_eq!(point_kinds(&storage, track_id).len(), 1); // first inserted eagerly

        filter.on_fix(fix_north_of(45.0, 10.0, 10));
        assert_eq!(point_kinds(&storage, track_id).len(), 1); // buffered, unwritten

        filter.on_fix(fix_north_of(45.0, 20.0, 20));
        assert_eq!(point_kinds(&storage, track_id).len(), 2); // previous flushed

        filter.end_current_track().unwrap();
        assert_eq!(point_kinds(&storage, track_id).len(), 3); // final flush
    }

    #[test]
    fn test_segment_break_scenario() {
        // Fixes at [0, 3, 3, 3, 250] meters: the three near-duplicates are
        // dropped, the far fix forces a break. Exactly three rows result:
        // the first point, a pause sentinel at its time, the far point.
        let (mut filter, storage, _) = new_filter();
        let track_id = filter.start_new_track().unwrap();

        filter.on_fix(fix_north_of(45.0, 0.0, 0));
        filter.on_fix(fix_north_of(45.0, 3.0, 10));
        filter.on_fix(fix_north_of(45.0, 3.0, 20));
        filter.on_fix(fix_north_of(45.0, 3.0, 30));
        filter.on_fix(fix_north_of(45.0, 250.0, 40));

        let points: Vec<_> = storage.point_cursor(track_id, 0).collect();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].kind, PointKind::Fix);
        assert_eq!(points[1].kind, PointKind::Pause);
        assert_eq!(points[2].kind, PointKind::Fix);
        // The sentinel closes the segment where it actually ended
        assert_eq!(points[1].fix.time, points[0].fix.time);
        // The new segment starts at the far fix, not a near one
        assert!((points[2].fix.latitude - (45.0 + 250.0 / METERS_PER_DEGREE)).abs() < 1e-9);

        // Statistics must not bridge the gap
        let distance = storage.get_track(track_id).unwrap().statistics.total_distance();
        assert_eq!(distance, 0.0);
    }

    #[test]
    fn test_pause_and_resume_markers() {
        let (mut filter, storage, _) = new_filter();
        let track_id = filter.start_new_track().unwrap();

        filter.on_fix(fix_north_of(45.0, 0.0, 0));
        filter.on_fix(fix_north_of(45.0, 10.0, 10));
        filter.pause_current_track().unwrap();

        // first point, flushed buffer, pause sentinel
        assert_eq!(
            point_kinds(&storage, track_id),
            vec![PointKind::Fix, PointKind::Fix, PointKind::Pause]
        );

        // Fixes while paused are dropped
        filter.on_fix(fix_north_of(45.0, 20.0, 20));
        assert_eq!(point_kinds(&storage, track_id).len(), 3);

        filter.resume_current_track().unwrap();
        assert_eq!(point_kinds(&storage, track_id).last(), Some(&PointKind::Resume));

        // First fix after resume starts a fresh segment: inserted eagerly
        filter.on_fix(fix_north_of(45.0, 21.0, 30));
        assert_eq!(point_kinds(&storage, track_id).len(), 5);
        assert_eq!(point_kinds(&storage, track_id).last(), Some(&PointKind::Fix));
    }

    #[test]
    fn test_accuracy_and_validity_gating() {
        let (mut filter, storage, _) = new_filter();
        let track_id = filter.start_new_track().unwrap();

        let mut bad_accuracy = fix_north_of(45.0, 0.0, 0);
        bad_accuracy.accuracy = Some(500.0); // default threshold is 200 m
        filter.on_fix(bad_accuracy);

        let mut invalid = fix_north_of(45.0, 0.0, 1);
        invalid.latitude = 95.0;
        filter.on_fix(invalid);

        assert!(point_kinds(&storage, track_id).is_empty());
    }

    #[test]
    fn test_fixes_ignored_while_idle() {
        let (mut filter, storage, _) = new_filter();
        filter.on_fix(fix_north_of(45.0, 0.0, 0));
        assert!(storage.get_last_point_id(1).is_none());
        assert!(matches!(filter.pause_current_track(), Err(TrackError::NotRecording)));
        assert!(matches!(filter.resume_current_track(), Err(TrackError::NotRecording)));
        assert!(matches!(filter.end_current_track(), Err(TrackError::NotRecording)));
    }

    #[test]
    fn test_waypoint_insertion_rules() {
        let (mut filter, storage, _) = new_filter();
        assert!(matches!(
            filter.insert_waypoint(WaypointRequest::marker(None, None)),
            Err(TrackError::NotRecording)
        ));

        let track_id = filter.start_new_track().unwrap();
        // start_new_track inserted the start-of-track statistics marker
        assert_eq!(storage.next_waypoint_number(track_id, WaypointKind::Statistics), 1);

        // No location in the segment yet: plain markers are rejected
        assert!(filter.insert_waypoint(WaypointRequest::marker(None, None)).is_err());

        filter.on_fix(fix_north_of(45.0, 0.0, 0));
        let waypoint_id = filter.insert_waypoint(WaypointRequest::marker(None, None)).unwrap();
        assert!(waypoint_id > 0);
        let waypoints = storage.waypoints(track_id, 10);
        let marker = waypoints.iter().find(|w| w.kind == WaypointKind::Marker).unwrap();
        assert_eq!(marker.name, "Marker 0");
        assert!((marker.latitude - 45.0).abs() < 1e-9);

        // Paused recordings reject waypoints
        filter.pause_current_track().unwrap();
        assert!(matches!(
            filter.insert_waypoint(WaypointRequest::marker(None, None)),
            Err(TrackError::Paused)
        ));
    }

    #[test]
    fn test_statistics_marker_closes_interval() {
        let (mut filter, storage, _) = new_filter();
        let track_id = filter.start_new_track().unwrap();

        filter.on_fix(fix_north_of(45.0, 0.0, 0));
        filter.on_fix(fix_north_of(45.0, 50.0, 10));
        filter.on_fix(fix_north_of(45.0, 100.0, 20));

        filter.insert_waypoint(WaypointRequest::statistics_marker()).unwrap();
        let waypoints = storage.waypoints(track_id, 10);
        let split = waypoints.iter().find(|w| w.name == "Split 1").unwrap();
        let snapshot = split.statistics.as_ref().unwrap();
        // Two inter-point hops of 50 m persisted so far (third is buffered)
        assert!((snapshot.total_distance() - 50.0).abs() < 1.0);

        // The marker interval restarts: a second split right away is empty
        filter.on_fix(fix_north_of(45.0, 150.0, 30));
        filter.insert_waypoint(WaypointRequest::statistics_marker()).unwrap();
        let waypoints = storage.waypoints(track_id, 10);
        let second = waypoints.iter().find(|w| w.name == "Split 2").unwrap();
        let second_stats = second.statistics.as_ref().unwrap();
        assert!(second_stats.total_distance() < snapshot.total_distance() + 51.0);
    }

    #[test]
    fn test_restart_rebuilds_statistics() {
        let (mut filter, storage, preferences) = new_filter();
        let track_id = filter.start_new_track().unwrap();
        filter.on_fix(fix_north_of(45.0, 0.0, 0));
        filter.on_fix(fix_north_of(45.0, 100.0, 10));
        filter.on_fix(fix_north_of(45.0, 200.0, 20));
        let distance_before = filter.current_statistics().unwrap().total_distance();
        assert!(distance_before > 0.0);

        // Simulate a process restart: fresh filter over the same storage
        let source = Arc::new(SimulatedSource::new());
        let mut restarted = RecordingFilter::new(
            storage.clone() as Arc<dyn TrackStorage>,
            preferences,
            source,
        );
        restarted.restart_track(track_id).unwrap();
        let distance_after = restarted.current_statistics().unwrap().total_distance();
        assert!((distance_after - distance_before).abs() < 1e-6);
        assert_eq!(restarted.recording_state(), RecordingState::Recording { track_id });
    }

    #[test]
    fn test_adaptive_policy_reregisters_on_idle() {
        let (mut filter, _, preferences) = new_filter();
        preferences
            .set_min_recording_interval(crate::config::IntervalPolicy::AdaptBatteryLife)
            .unwrap();
        let (sink, _keepalive) = mpsc::unbounded_channel();
        filter.set_fix_sink(sink);

        filter.start_new_track().unwrap();
        assert_eq!(filter.current_interval(), Some(Duration::from_secs(30)));

        filter.on_fix(fix_north_of(45.0, 0.0, 0));
        // 400 s idle at the same spot: desired interval climbs to 200 s.
        // The too-close fix is dropped but still drives the policy.
        filter.on_fix(fix_north_of(45.0, 1.0, 400));
        assert_eq!(filter.current_interval(), Some(Duration::from_secs(200)));
    }

    #[tokio::test]
    async fn test_worker_records_fixes_from_source() {
        let storage = Arc::new(MemoryStorage::new());
        let preferences = Arc::new(PreferenceStore::in_memory());
        let source = Arc::new(SimulatedSource::new());
        let recorder = TrackRecorder::spawn(
            storage.clone() as Arc<dyn TrackStorage>,
            preferences,
            source.clone() as Arc<dyn LocationSource>,
        );

        let track_id = recorder.start_new_track().await.unwrap();
        assert_eq!(
            recorder.recording_state().await.unwrap(),
            RecordingState::Recording { track_id }
        );

        source.emit_fix(fix_north_of(45.0, 0.0, 0));
        source.emit_fix(fix_north_of(45.0, 50.0, 10));
        source.emit_fix(fix_north_of(45.0, 100.0, 20));
        // Let the worker drain the fix channel
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        recorder.end_current_track().await.unwrap();
        let points: Vec<_> = storage.point_cursor(track_id, 0).collect();
        assert_eq!(points.len(), 3);

        let stats = recorder.current_statistics().await.unwrap();
        assert!(stats.is_none()); // idle again

        recorder.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_discards_pending_work() {
        let storage = Arc::new(MemoryStorage::new());
        let preferences = Arc::new(PreferenceStore::in_memory());
        let source = Arc::new(SimulatedSource::new());
        let recorder = TrackRecorder::spawn(
            storage.clone() as Arc<dyn TrackStorage>,
            preferences,
            source.clone() as Arc<dyn LocationSource>,
        );
        let track_id = recorder.start_new_track().await.unwrap();

        recorder.shutdown();
        // Emitted after shutdown: must never be persisted
        source.emit_fix(fix_north_of(45.0, 0.0, 0));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(storage.point_cursor(track_id, 0).next().is_none());
    }
}

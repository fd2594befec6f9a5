// src/hub/mod.rs v2
//! Track data distribution hub
//!
//! The hub owns one serialized worker task. Every public operation
//! enqueues a command and returns immediately; all hub state lives inside
//! the worker, so no locking is needed around it. Producers are the
//! public handle, the storage table-change notifier and the location
//! source. Listener callbacks run synchronously on the worker.

pub mod listener;
pub mod sampling;

pub use listener::{
    ListenerId, LocationState, PreferenceChange, TrackDataEvent, TrackDataListener, TrackDataType,
};
pub use sampling::{SampleDecision, SamplingState};

use crate::config::{PreferenceKey, PreferenceStore};
use crate::gps::{Fix, LocationSource, SourceEvent};
use crate::hub::listener::ListenerRegistration;
use crate::storage::{TableListener, TrackStorage};
use crate::track::TrackId;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Interval for the hub's own display-purpose location registration.
const DISPLAY_UPDATE_INTERVAL: Duration = Duration::from_secs(1);
/// A fix older than this no longer counts as having a fix.
const MAX_FIX_AGE_MS: i64 = 60_000;
/// Upper bound on waypoints pushed per reload.
const MAX_DISPLAYED_WAYPOINTS: usize = 128;

enum HubCommand {
    LoadTrack(TrackId),
    RegisterListener(ListenerId, Box<dyn TrackDataListener>, HashSet<TrackDataType>),
    UnregisterListener(ListenerId),
    ReloadListener(ListenerId),
    TracksTableUpdated,
    WaypointsTableUpdated,
    TrackPointsTableUpdated,
    PreferenceChanged(PreferenceKey),
    HeadingChanged(f64),
    ForceUpdateLocation,
    Flush(oneshot::Sender<()>),
    Stop,
}

/// All hub state. Only ever touched by the worker task; unit tests drive
/// it directly since every method is synchronous.
struct HubCore {
    storage: Arc<dyn TrackStorage>,
    preferences: Arc<PreferenceStore>,
    source: Arc<dyn LocationSource>,
    listeners: Vec<ListenerRegistration>,

    // Preference snapshot
    selected_track_id: Option<TrackId>,
    recording_track_id: Option<TrackId>,
    recording_paused: bool,
    metric_units: bool,
    report_speed: bool,
    min_required_accuracy: f64,
    min_recording_distance: f64,
    target_points: usize,

    // Track point sampling state
    sampling: SamplingState,

    // Location values
    last_seen_fix: Option<Fix>,
    provider_enabled: bool,
    has_fix: bool,
    has_good_fix: bool,
    last_heading: f64,
}

impl HubCore {
    fn new(
        storage: Arc<dyn TrackStorage>,
        preferences: Arc<PreferenceStore>,
        source: Arc<dyn LocationSource>,
    ) -> Self {
        let snapshot = preferences.snapshot();
        let provider_enabled = source.is_enabled();
        Self {
            storage,
            preferences,
            source,
            listeners: Vec::new(),
            selected_track_id: snapshot.selected_track_id,
            recording_track_id: snapshot.recording_track_id,
            recording_paused: snapshot.recording_paused,
            metric_units: snapshot.metric_units,
            report_speed: snapshot.report_speed,
            min_required_accuracy: snapshot.min_required_accuracy,
            min_recording_distance: snapshot.min_recording_distance,
            target_points: snapshot.target_displayed_points,
            sampling: SamplingState::new(),
            last_seen_fix: None,
            provider_enabled,
            has_fix: false,
            has_good_fix: false,
            last_heading: 0.0,
        }
    }

    fn is_selected_track_recording(&self) -> bool {
        self.selected_track_id.is_some() && self.selected_track_id == self.recording_track_id
    }

    /// Deliver one event to every listener interested in `data_type`,
    /// optionally narrowed to a single listener id.
    fn emit(&mut self, data_type: TrackDataType, only: Option<ListenerId>, event: TrackDataEvent) {
        for registration in self.listeners.iter_mut() {
            if !registration.interests.contains(&data_type) {
                continue;
            }
            if only.map_or(false, |id| registration.id != id) {
                continue;
            }
            registration.listener.on_event(event.clone());
        }
    }

    fn emit_to_listener(&mut self, id: ListenerId, event: TrackDataEvent) {
        if let Some(registration) = self.listeners.iter_mut().find(|r| r.id == id) {
            registration.listener.on_event(event);
        }
    }

    fn has_listener(&self, data_type: TrackDataType, only: Option<ListenerId>) -> bool {
        self.listeners.iter().any(|registration| {
            registration.interests.contains(&data_type)
                && only.map_or(true, |id| registration.id == id)
        })
    }

    fn register_listener(
        &mut self,
        id: ListenerId,
        listener: Box<dyn TrackDataListener>,
        interests: HashSet<TrackDataType>,
    ) {
        self.listeners.push(ListenerRegistration { id, listener, interests });
        // Catch the new listener up without disturbing the others
        self.load_data_for_listener(id);
    }

    fn unregister_listener(&mut self, id: ListenerId) {
        self.listeners.retain(|registration| registration.id != id);
    }

    fn load_track(&mut self, track_id: TrackId) {
        if self.selected_track_id == Some(track_id) {
            log::info!("Not reloading track {}", track_id);
            return;
        }
        self.selected_track_id = Some(track_id);
        if let Err(e) = self.preferences.set_selected_track_id(Some(track_id)) {
            log::warn!("Failed to persist selected track: {}", e);
        }
        self.load_data_for_all();
    }

    /// Full reload for every listener, bracketed with clear/done events.
    fn load_data_for_all(&mut self) {
        self.sampling.reset();
        if self.listeners.is_empty() {
            return;
        }

        let changes = self.preference_changes();
        for registration in self.listeners.iter_mut() {
            if registration.interests.contains(&TrackDataType::Preference) {
                for change in &changes {
                    let _ = registration.listener.on_preference_changed(change);
                }
            }
        }

        self.push_selected_track(None);
        self.push_tracks_table(None);
        self.emit(TrackDataType::SampledInPoints, None, TrackDataEvent::ClearTrackPoints);
        self.push_track_points(true, None);
        self.push_waypoints(None);
        self.push_location(None);
        self.push_heading(None);
    }

    /// Catch-up push scoped to one listener's interests.
    fn load_data_for_listener(&mut self, id: ListenerId) {
        let Some(interests) = self
            .listeners
            .iter()
            .find(|registration| registration.id == id)
            .map(|registration| registration.interests.clone())
        else {
            return;
        };

        if interests.contains(&TrackDataType::Preference) {
            let changes = self.preference_changes();
            if let Some(registration) = self.listeners.iter_mut().find(|r| r.id == id) {
                for change in &changes {
                    let _ = registration.listener.on_preference_changed(change);
                }
            }
        }

        if interests.contains(&TrackDataType::SelectedTrack) {
            self.push_selected_track(Some(id));
        }
        if interests.contains(&TrackDataType::TracksTable) {
            self.push_tracks_table(Some(id));
        }

        let has_sampled = interests.contains(&TrackDataType::SampledInPoints)
            || interests.contains(&TrackDataType::SampledOutPoints);
        if has_sampled {
            self.emit_to_listener(id, TrackDataEvent::ClearTrackPoints);
            let is_only_listener = self.listeners.len() == 1;
            if is_only_listener {
                self.sampling.reset();
            }
            self.push_track_points(is_only_listener, Some(id));
        }

        if interests.contains(&TrackDataType::WaypointsTable) {
            self.push_waypoints(Some(id));
        }
        if interests.contains(&TrackDataType::Location) {
            self.push_location(Some(id));
        }
        if interests.contains(&TrackDataType::Heading) {
            self.push_heading(Some(id));
        }
    }

    fn preference_changes(&self) -> [PreferenceChange; 3] {
        [
            PreferenceChange::MetricUnits(self.metric_units),
            PreferenceChange::ReportSpeed(self.report_speed),
            PreferenceChange::MinRecordingDistance(self.min_recording_distance),
        ]
    }

    fn push_selected_track(&mut self, only: Option<ListenerId>) {
        if !self.has_listener(TrackDataType::SelectedTrack, only) {
            return;
        }
        let track = self.selected_track_id.and_then(|id| self.storage.get_track(id));
        self.emit(TrackDataType::SelectedTrack, only, TrackDataEvent::SelectedTrackChanged(track));
    }

    fn push_tracks_table(&mut self, only: Option<ListenerId>) {
        if !self.has_listener(TrackDataType::TracksTable, only) {
            return;
        }
        let track = self.selected_track_id.and_then(|id| self.storage.get_track(id));
        self.emit(TrackDataType::TracksTable, only, TrackDataEvent::TrackUpdated(track));
    }

    fn push_waypoints(&mut self, only: Option<ListenerId>) {
        if !self.has_listener(TrackDataType::WaypointsTable, only) {
            return;
        }
        self.emit(TrackDataType::WaypointsTable, only, TrackDataEvent::ClearWaypoints);
        if let Some(track_id) = self.selected_track_id {
            for waypoint in self.storage.waypoints(track_id, MAX_DISPLAYED_WAYPOINTS) {
                if !waypoint.has_valid_location() {
                    continue;
                }
                self.emit(
                    TrackDataType::WaypointsTable,
                    only,
                    TrackDataEvent::NewWaypoint(waypoint),
                );
            }
        }
        self.emit(TrackDataType::WaypointsTable, only, TrackDataEvent::WaypointsDone);
    }

    /// Walk new persisted points through the sampling cursor and push the
    /// decisions. With `update_state` the hub's own cursor advances (and
    /// resamples when over budget); otherwise a scratch cursor bounded by
    /// the hub's last seen id replays history for a catch-up.
    fn push_track_points(&mut self, update_state: bool, only: Option<ListenerId>) {
        let has_sampled_in = self.has_listener(TrackDataType::SampledInPoints, only);
        let has_sampled_out = self.has_listener(TrackDataType::SampledOutPoints, only);
        if !has_sampled_in && !has_sampled_out {
            return;
        }

        if update_state && self.sampling.needs_resample(self.target_points) {
            // Reload and resample the track at a lower frequency. Full
            // rescan bounds memory on very long tracks.
            log::info!("Resampling track after {} points", self.sampling.num_loaded_points());
            self.sampling.reset();
            self.emit(TrackDataType::SampledInPoints, only, TrackDataEvent::ClearTrackPoints);
        }

        let max_point_id = if update_state { None } else { self.sampling.last_seen_id() };
        let mut scan = if update_state { self.sampling.clone() } else { SamplingState::new() };
        scan.begin_scan();

        if let Some(track_id) = self.selected_track_id {
            let last_track_point_id = self.storage.get_last_point_id(track_id).unwrap_or(-1);
            let recording = self.is_selected_track_recording();
            let target_points = self.target_points;
            let min_id = scan.last_seen_id().map(|id| id + 1).unwrap_or(0);
            for point in self.storage.point_cursor(track_id, min_id) {
                if max_point_id.map_or(false, |max| point.id > max) {
                    break;
                }
                match scan.decide(&point, last_track_point_id, target_points, recording) {
                    SampleDecision::SegmentSplit => self.emit(
                        TrackDataType::SampledInPoints,
                        only,
                        TrackDataEvent::SegmentSplit(point),
                    ),
                    SampleDecision::SampledIn => self.emit(
                        TrackDataType::SampledInPoints,
                        only,
                        TrackDataEvent::SampledInPoint(point),
                    ),
                    SampleDecision::SampledOut => self.emit(
                        TrackDataType::SampledOutPoints,
                        only,
                        TrackDataEvent::SampledOutPoint(point),
                    ),
                }
            }
        }

        if update_state {
            self.sampling = scan;
        }
        self.emit(TrackDataType::SampledInPoints, only, TrackDataEvent::TrackPointsDone);
    }

    fn push_location(&mut self, only: Option<ListenerId>) {
        match self.last_seen_fix.clone() {
            Some(fix) => self.handle_location_changed(fix, true, only),
            None => self.push_location_state(only),
        }
    }

    fn push_location_state(&mut self, only: Option<ListenerId>) {
        let state = if !self.provider_enabled {
            self.last_seen_fix = None;
            LocationState::Disabled
        } else if !self.has_fix {
            LocationState::NoFix
        } else if !self.has_good_fix {
            LocationState::BadFix
        } else {
            LocationState::GoodFix
        };
        self.emit(TrackDataType::Location, only, TrackDataEvent::LocationStateChanged(state));
    }

    fn handle_location_changed(&mut self, fix: Fix, force_state: bool, only: Option<ListenerId>) {
        let old_has_fix = self.has_fix;
        let old_has_good_fix = self.has_good_fix;
        let age_ms = Utc::now().signed_duration_since(fix.time).num_milliseconds();
        self.has_fix = fix.is_valid() && age_ms <= MAX_FIX_AGE_MS;
        self.has_good_fix = self.has_fix
            && fix.accuracy.map_or(true, |accuracy| accuracy <= self.min_required_accuracy);
        self.last_seen_fix = Some(fix.clone());

        if force_state || self.has_fix != old_has_fix || self.has_good_fix != old_has_good_fix {
            self.push_location_state(only);
        }
        self.emit(TrackDataType::Location, only, TrackDataEvent::LocationChanged(fix));
    }

    fn handle_provider_state(&mut self, enabled: bool) {
        self.provider_enabled = enabled;
        if !enabled {
            self.has_fix = false;
            self.has_good_fix = false;
        }
        self.push_location_state(None);
    }

    fn handle_heading_changed(&mut self, heading: f64) {
        self.last_heading = heading;
        self.push_heading(None);
    }

    fn push_heading(&mut self, only: Option<ListenerId>) {
        let heading = self.last_heading;
        self.emit(TrackDataType::Heading, only, TrackDataEvent::HeadingChanged(heading));
    }

    fn force_update_location(&mut self) {
        match self.source.last_known_fix() {
            Some(fix) => self.handle_location_changed(fix, false, None),
            None => log::debug!("force_update_location: no last known fix"),
        }
    }

    fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Fix(fix) => self.handle_location_changed(fix, false, None),
            SourceEvent::ProviderState(enabled) => self.handle_provider_state(enabled),
        }
    }

    /// Re-read one preference-backed field; replay scoped reloads when a
    /// semantically meaningful value changed.
    fn handle_preference_changed(&mut self, key: PreferenceKey) {
        let snapshot = self.preferences.snapshot();
        match key {
            PreferenceKey::SelectedTrackId => {
                if snapshot.selected_track_id != self.selected_track_id {
                    self.selected_track_id = snapshot.selected_track_id;
                    self.load_data_for_all();
                }
            }
            PreferenceKey::RecordingTrackId => {
                self.recording_track_id = snapshot.recording_track_id;
            }
            PreferenceKey::RecordingPaused => {
                self.recording_paused = snapshot.recording_paused;
            }
            PreferenceKey::MetricUnits => {
                self.metric_units = snapshot.metric_units;
                self.dispatch_preference(PreferenceChange::MetricUnits(snapshot.metric_units));
            }
            PreferenceKey::ReportSpeed => {
                self.report_speed = snapshot.report_speed;
                self.dispatch_preference(PreferenceChange::ReportSpeed(snapshot.report_speed));
            }
            PreferenceKey::MinRecordingDistance => {
                self.min_recording_distance = snapshot.min_recording_distance;
                self.dispatch_preference(PreferenceChange::MinRecordingDistance(
                    snapshot.min_recording_distance,
                ));
            }
            PreferenceKey::MinRequiredAccuracy => {
                self.min_required_accuracy = snapshot.min_required_accuracy;
            }
            PreferenceKey::TargetDisplayedPoints => {
                self.target_points = snapshot.target_displayed_points;
            }
            // The recorder owns the interval policy and the segment-break distance
            PreferenceKey::MinRecordingInterval | PreferenceKey::MaxRecordingDistance => {}
        }
    }

    fn dispatch_preference(&mut self, change: PreferenceChange) {
        let mut reload = Vec::new();
        for registration in self.listeners.iter_mut() {
            if registration.interests.contains(&TrackDataType::Preference)
                && registration.listener.on_preference_changed(&change)
            {
                reload.push(registration.id);
            }
        }
        for id in reload {
            self.load_data_for_listener(id);
        }
    }

    fn handle_command(&mut self, command: HubCommand) -> bool {
        match command {
            HubCommand::LoadTrack(track_id) => self.load_track(track_id),
            HubCommand::RegisterListener(id, listener, interests) => {
                self.register_listener(id, listener, interests)
            }
            HubCommand::UnregisterListener(id) => self.unregister_listener(id),
            HubCommand::ReloadListener(id) => self.load_data_for_listener(id),
            HubCommand::TracksTableUpdated => self.push_tracks_table(None),
            HubCommand::WaypointsTableUpdated => self.push_waypoints(None),
            HubCommand::TrackPointsTableUpdated => self.push_track_points(true, None),
            HubCommand::PreferenceChanged(key) => self.handle_preference_changed(key),
            HubCommand::HeadingChanged(heading) => self.handle_heading_changed(heading),
            HubCommand::ForceUpdateLocation => self.force_update_location(),
            HubCommand::Flush(reply) => {
                let _ = reply.send(());
            }
            HubCommand::Stop => return true,
        }
        false
    }
}

struct WorkerHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    running: Arc<AtomicBool>,
}

/// Handle to the distribution hub. Cheap to clone; every operation is
/// fire-and-forget onto the single worker.
#[derive(Clone)]
pub struct TrackDataHub {
    storage: Arc<dyn TrackStorage>,
    preferences: Arc<PreferenceStore>,
    source: Arc<dyn LocationSource>,
    worker: Arc<Mutex<Option<WorkerHandle>>>,
    next_listener_id: Arc<AtomicU64>,
}

impl TrackDataHub {
    pub fn new(
        storage: Arc<dyn TrackStorage>,
        preferences: Arc<PreferenceStore>,
        source: Arc<dyn LocationSource>,
    ) -> Self {
        Self {
            storage,
            preferences,
            source,
            worker: Arc::new(Mutex::new(None)),
            next_listener_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start the worker. Idempotent: a second start logs and no-ops.
    pub fn start(&self) {
        let mut guard = self.worker.lock().unwrap();
        if guard.is_some() {
            log::info!("TrackDataHub already started, ignoring start");
            return;
        }

        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let mut core =
            HubCore::new(Arc::clone(&self.storage), Arc::clone(&self.preferences), Arc::clone(&self.source));
        let registration =
            self.source.request_updates(DISPLAY_UPDATE_INTERVAL, 0.0, event_tx);
        let source = Arc::clone(&self.source);

        let worker_running = Arc::clone(&running);
        tokio::spawn(async move {
            core.load_data_for_all();
            loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        let Some(command) = command else { break };
                        if !worker_running.load(Ordering::Relaxed) {
                            break;
                        }
                        if core.handle_command(command) {
                            break;
                        }
                    }
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        if !worker_running.load(Ordering::Relaxed) {
                            break;
                        }
                        core.handle_source_event(event);
                    }
                }
            }
            source.remove_updates(registration);
            log::debug!("TrackDataHub worker stopped");
        });

        *guard = Some(WorkerHandle { commands: command_tx, running });
    }

    /// Stop the worker. Pending commands are discarded, not drained, and
    /// registered listeners are dropped with the worker.
    pub fn stop(&self) {
        let mut guard = self.worker.lock().unwrap();
        let Some(handle) = guard.take() else {
            log::info!("TrackDataHub not started, ignoring stop");
            return;
        };
        handle.running.store(false, Ordering::Relaxed);
        let _ = handle.commands.send(HubCommand::Stop);
    }

    fn send(&self, command: HubCommand) {
        let guard = self.worker.lock().unwrap();
        match guard.as_ref() {
            Some(handle) => {
                let _ = handle.commands.send(command);
            }
            None => log::debug!("TrackDataHub not started, dropping command"),
        }
    }

    /// Select a track for display. No-op when already selected.
    pub fn load_track(&self, track_id: TrackId) {
        self.send(HubCommand::LoadTrack(track_id));
    }

    /// Register a listener for the given data types. The listener
    /// immediately receives a catch-up push scoped to its interests.
    pub fn register_listener(
        &self,
        listener: Box<dyn TrackDataListener>,
        interests: HashSet<TrackDataType>,
    ) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.send(HubCommand::RegisterListener(id, listener, interests));
        id
    }

    pub fn unregister_listener(&self, id: ListenerId) {
        self.send(HubCommand::UnregisterListener(id));
    }

    /// Replay a full catch-up for one listener.
    pub fn reload_listener(&self, id: ListenerId) {
        self.send(HubCommand::ReloadListener(id));
    }

    pub fn notify_tracks_table_updated(&self) {
        self.send(HubCommand::TracksTableUpdated);
    }

    pub fn notify_waypoints_table_updated(&self) {
        self.send(HubCommand::WaypointsTableUpdated);
    }

    pub fn notify_track_points_table_updated(&self) {
        self.send(HubCommand::TrackPointsTableUpdated);
    }

    pub fn notify_preference_changed(&self, key: PreferenceKey) {
        self.send(HubCommand::PreferenceChanged(key));
    }

    pub fn notify_heading_changed(&self, heading: f64) {
        self.send(HubCommand::HeadingChanged(heading));
    }

    /// Re-broadcast the source's last known fix immediately, bypassing
    /// the normal cadence.
    pub fn force_update_location(&self) {
        self.send(HubCommand::ForceUpdateLocation);
    }

    /// Wait until all previously enqueued commands have been processed.
    pub async fn flush(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::Flush(reply_tx));
        let _ = reply_rx.await;
    }

    pub fn is_selected_track_recording(&self) -> bool {
        let snapshot = self.preferences.snapshot();
        snapshot.selected_track_id.is_some()
            && snapshot.selected_track_id == snapshot.recording_track_id
    }

    pub fn is_selected_track_paused(&self) -> bool {
        self.is_selected_track_recording() && self.preferences.snapshot().recording_paused
    }

    pub fn is_provider_enabled(&self) -> bool {
        self.source.is_enabled()
    }
}

impl TableListener for TrackDataHub {
    fn on_tracks_table_changed(&self) {
        self.notify_tracks_table_updated();
    }

    fn on_waypoints_table_changed(&self) {
        self.notify_waypoints_table_updated();
    }

    fn on_track_points_table_changed(&self) {
        self.notify_track_points_table_updated();
    }
}

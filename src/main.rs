// src/main.rs v2
//! Track recorder demo binary
//!
//! Records a track from a gpsd daemon or a simulated walk and prints the
//! live statistics the data hub pushes to its listeners.

use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use track_recorder::{
    config::{PreferenceKey, PreferenceStore},
    gps::{Fix, GpsdSource, LocationSource, SimulatedSource},
    hub::{TrackDataEvent, TrackDataHub, TrackDataListener, TrackDataType},
    recording::TrackRecorder,
    storage::{MemoryStorage, TrackStorage},
    track::WaypointRequest,
};

#[derive(Parser)]
#[command(name = "track-recorder", about = "Record a GPS track and watch live statistics")]
struct Args {
    /// Location source: "gpsd" or "walk" (simulated)
    #[arg(long, default_value = "walk")]
    source: String,

    #[arg(long, default_value = "localhost")]
    gpsd_host: String,

    #[arg(long, default_value_t = 2947)]
    gpsd_port: u16,

    /// Recording duration in seconds (Ctrl-C stops earlier)
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Preference file; in-memory defaults when omitted
    #[arg(long)]
    preferences: Option<PathBuf>,

    /// Drop a statistics marker halfway through the recording
    #[arg(long)]
    split: bool,
}

/// Listener printing one status line per point batch.
struct StatsPrinter {
    sampled_in: usize,
    last_distance: f64,
    last_max_speed: f64,
}

impl StatsPrinter {
    fn new() -> Self {
        Self { sampled_in: 0, last_distance: 0.0, last_max_speed: 0.0 }
    }
}

impl TrackDataListener for StatsPrinter {
    fn on_event(&mut self, event: TrackDataEvent) {
        match event {
            TrackDataEvent::ClearTrackPoints => self.sampled_in = 0,
            TrackDataEvent::SampledInPoint(_) => self.sampled_in += 1,
            TrackDataEvent::TrackUpdated(Some(track)) => {
                self.last_distance = track.statistics.total_distance();
                self.last_max_speed = track.statistics.max_speed();
            }
            TrackDataEvent::TrackPointsDone => {
                println!(
                    "  {:8.1} m   {:4} shown points   max {:4.1} m/s",
                    self.last_distance, self.sampled_in, self.last_max_speed
                );
            }
            _ => {}
        }
    }
}

/// Emit a synthetic northbound walk through the simulated source.
fn spawn_walk(source: Arc<SimulatedSource>) {
    tokio::spawn(async move {
        let mut step: u64 = 0;
        loop {
            let meters = step as f64 * 1.5; // ~3 m/s at 2 Hz
            let mut fix = Fix::new(45.0 + meters / 111_195.0, 7.0, chrono::Utc::now());
            fix.speed = Some(3.0);
            fix.accuracy = Some(8.0);
            fix.altitude = Some(320.0 + (step as f64 / 20.0).sin() * 15.0);
            source.emit_fix(fix);
            step += 1;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let preferences = Arc::new(match &args.preferences {
        Some(path) => PreferenceStore::load_from(path)?,
        None => PreferenceStore::in_memory(),
    });
    let storage = Arc::new(MemoryStorage::new());

    let source: Arc<dyn LocationSource> = match args.source.as_str() {
        "gpsd" => {
            println!("Connecting to gpsd at {}:{}...", args.gpsd_host, args.gpsd_port);
            let source = GpsdSource::connect(&args.gpsd_host, args.gpsd_port).await?;
            println!("Connected successfully!");
            Arc::new(source)
        }
        "walk" => {
            let simulated = Arc::new(SimulatedSource::new());
            spawn_walk(Arc::clone(&simulated));
            simulated
        }
        other => anyhow::bail!("Unknown source '{}', expected 'gpsd' or 'walk'", other),
    };

    let hub = TrackDataHub::new(storage.clone(), preferences.clone(), Arc::clone(&source));
    hub.start();
    storage.set_table_listener(Some(Arc::new(hub.clone())));

    let recorder = TrackRecorder::spawn(storage.clone(), preferences, source);

    let interests: HashSet<TrackDataType> = [
        TrackDataType::SampledInPoints,
        TrackDataType::TracksTable,
        TrackDataType::SelectedTrack,
    ]
    .into_iter()
    .collect();
    hub.register_listener(Box::new(StatsPrinter::new()), interests);

    let track_id = recorder.start_new_track().await?;
    hub.notify_preference_changed(PreferenceKey::RecordingTrackId);
    hub.load_track(track_id);
    println!("Recording track {} for up to {} s (Ctrl-C to stop)...", track_id, args.duration);

    let half = Duration::from_secs(args.duration / 2);
    tokio::select! {
        _ = async {
            tokio::time::sleep(half).await;
            if args.split {
                match recorder.insert_waypoint(WaypointRequest::statistics_marker()).await {
                    Ok(id) => println!("Inserted statistics marker {}", id),
                    Err(e) => eprintln!("Could not insert marker: {}", e),
                }
            }
            tokio::time::sleep(Duration::from_secs(args.duration) - half).await;
        } => {}
        _ = tokio::signal::ctrl_c() => println!("Interrupted."),
    }

    recorder.end_current_track().await?;
    hub.notify_preference_changed(PreferenceKey::RecordingTrackId);
    if let Some(track) = storage.get_track(track_id) {
        let stats = &track.statistics;
        println!(
            "Done: {:.1} m in {} s ({} points), max speed {:.1} m/s",
            stats.total_distance(),
            stats.total_time().as_secs(),
            track.number_of_points,
            stats.max_speed()
        );
    }

    hub.stop();
    recorder.shutdown();
    Ok(())
}

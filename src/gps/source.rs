// src/gps/source.rs
//! Location source boundary
//!
//! A location source owns the hardware/daemon side of fix delivery. Both
//! the recording filter and the data hub register with the same source,
//! each with its own interval/distance constraints; changing a
//! registration's interval means removing it and installing a new one.

use super::fix::Fix;
use super::gpsd;
use crate::error::Result;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, RwLock,
};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc::UnboundedSender;

/// Events pushed from a source to its registered sinks.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Fix(Fix),
    /// The underlying provider became enabled/disabled.
    ProviderState(bool),
}

pub type RegistrationId = u64;

/// A pluggable fix producer. Implementations must support multiple
/// concurrent registrations.
pub trait LocationSource: Send + Sync {
    /// Register a sink. Updates are throttled to at most one per
    /// `min_interval` and only after moving `min_distance` meters.
    fn request_updates(
        &self,
        min_interval: Duration,
        min_distance: f64,
        sink: UnboundedSender<SourceEvent>,
    ) -> RegistrationId;

    fn remove_updates(&self, registration: RegistrationId);

    fn last_known_fix(&self) -> Option<Fix>;

    fn is_enabled(&self) -> bool;
}

struct Registration {
    id: RegistrationId,
    min_interval: Duration,
    min_distance: f64,
    sink: UnboundedSender<SourceEvent>,
    last_delivered: Option<Fix>,
}

/// Shared registration table with interval/distance throttling.
#[derive(Default)]
struct Registrations {
    entries: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Registrations {
    fn add(
        &self,
        min_interval: Duration,
        min_distance: f64,
        sink: UnboundedSender<SourceEvent>,
    ) -> RegistrationId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push(Registration {
            id,
            min_interval,
            min_distance,
            sink,
            last_delivered: None,
        });
        id
    }

    fn remove(&self, id: RegistrationId) {
        self.entries.lock().unwrap().retain(|r| r.id != id);
    }

    fn deliver_fix(&self, fix: &Fix) {
        let mut entries = self.entries.lock().unwrap();
        // Drop registrations whose receiving end has gone away.
        entries.retain(|r| !r.sink.is_closed());
        for registration in entries.iter_mut() {
            if let Some(last) = &registration.last_delivered {
                let elapsed = fix.time.signed_duration_since(last.time);
                let min_interval = chrono::Duration::from_std(registration.min_interval)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                if elapsed < min_interval {
                    continue;
                }
                if registration.min_distance > 0.0
                    && last.distance_to(fix) < registration.min_distance
                {
                    continue;
                }
            }
            if registration.sink.send(SourceEvent::Fix(fix.clone())).is_ok() {
                registration.last_delivered = Some(fix.clone());
            }
        }
    }

    fn deliver_provider_state(&self, enabled: bool) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|r| !r.sink.is_closed());
        for registration in entries.iter() {
            let _ = registration.sink.send(SourceEvent::ProviderState(enabled));
        }
    }
}

/// Location source backed by a gpsd daemon.
pub struct GpsdSource {
    registrations: Arc<Registrations>,
    last_fix: Arc<RwLock<Option<Fix>>>,
    enabled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl GpsdSource {
    /// Connect and start the background reader task.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let reader = gpsd::connect(host, port).await?;

        let registrations = Arc::new(Registrations::default());
        let last_fix = Arc::new(RwLock::new(None));
        let enabled = Arc::new(AtomicBool::new(true));
        let running = Arc::new(AtomicBool::new(true));

        let source = Self {
            registrations: Arc::clone(&registrations),
            last_fix: Arc::clone(&last_fix),
            enabled: Arc::clone(&enabled),
            running: Arc::clone(&running),
        };

        tokio::spawn(async move {
            let mut reader = reader;
            let mut line = String::new();

            while running.load(Ordering::Relaxed) {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break, // EOF
                    Ok(_) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match gpsd::parse_line(line) {
                            Ok(Some(fix)) => {
                                *last_fix.write().unwrap() = Some(fix.clone());
                                registrations.deliver_fix(&fix);
                            }
                            Ok(None) => {}
                            Err(e) => log::warn!("Ignoring unparseable gpsd line: {}", e),
                        }
                    }
                    Err(e) => {
                        log::error!("Error reading from gpsd: {}", e);
                        break;
                    }
                }
            }
            enabled.store(false, Ordering::Relaxed);
            registrations.deliver_provider_state(false);
        });

        Ok(source)
    }

    /// Stop the reader task after its current read completes.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl LocationSource for GpsdSource {
    fn request_updates(
        &self,
        min_interval: Duration,
        min_distance: f64,
        sink: UnboundedSender<SourceEvent>,
    ) -> RegistrationId {
        self.registrations.add(min_interval, min_distance, sink)
    }

    fn remove_updates(&self, registration: RegistrationId) {
        self.registrations.remove(registration);
    }

    fn last_known_fix(&self) -> Option<Fix> {
        self.last_fix.read().unwrap().clone()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Scripted location source for tests and the demo binary. Fixes are
/// pushed by the caller and fan out through the same throttling rules as
/// the real sources.
pub struct SimulatedSource {
    registrations: Registrations,
    last_fix: RwLock<Option<Fix>>,
    enabled: AtomicBool,
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self {
            registrations: Registrations::default(),
            last_fix: RwLock::new(None),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn emit_fix(&self, fix: Fix) {
        *self.last_fix.write().unwrap() = Some(fix.clone());
        self.registrations.deliver_fix(&fix);
    }

    pub fn set_provider_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        self.registrations.deliver_provider_state(enabled);
    }
}

impl LocationSource for SimulatedSource {
    fn request_updates(
        &self,
        min_interval: Duration,
        min_distance: f64,
        sink: UnboundedSender<SourceEvent>,
    ) -> RegistrationId {
        self.registrations.add(min_interval, min_distance, sink)
    }

    fn remove_updates(&self, registration: RegistrationId) {
        self.registrations.remove(registration);
    }

    fn last_known_fix(&self) -> Option<Fix> {
        self.last_fix.read().unwrap().clone()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc;

    fn fix_at(latitude: f64, longitude: f64, seconds: i64) -> Fix {
        Fix::new(latitude, longitude, Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap())
    }

    #[test]
    fn test_interval_throttling() {
        let source = SimulatedSource::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        source.request_updates(Duration::from_secs(10), 0.0, tx);

        source.emit_fix(fix_at(45.0, 7.0, 0));
        source.emit_fix(fix_at(45.0, 7.0, 5)); // too soon
        source.emit_fix(fix_at(45.0, 7.0, 10));

        let mut delivered = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SourceEvent::Fix(_)) {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 2);
    }

    #[test]
    fn test_min_distance_throttling() {
        let source = SimulatedSource::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        source.request_updates(Duration::ZERO, 50.0, tx);

        source.emit_fix(fix_at(45.0, 7.0, 0));
        source.emit_fix(fix_at(45.0001, 7.0, 1)); // ~11 m, below threshold
        source.emit_fix(fix_at(45.001, 7.0, 2)); // ~111 m from first

        let mut delivered = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SourceEvent::Fix(_)) {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 2);
    }

    #[test]
    fn test_independent_registrations() {
        let source = SimulatedSource::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        source.request_updates(Duration::from_secs(60), 0.0, tx_a);
        let b = source.request_updates(Duration::ZERO, 0.0, tx_b);

        source.emit_fix(fix_at(45.0, 7.0, 0));
        source.emit_fix(fix_at(45.0, 7.0, 1));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());

        source.remove_updates(b);
        source.emit_fix(fix_at(45.0, 7.0, 2));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_last_known_fix_and_provider_state() {
        let source = SimulatedSource::new();
        assert!(source.last_known_fix().is_none());
        assert!(source.is_enabled());

        source.emit_fix(fix_at(45.0, 7.0, 0));
        assert_eq!(source.last_known_fix().unwrap().latitude, 45.0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        source.request_updates(Duration::ZERO, 0.0, tx);
        source.set_provider_enabled(false);
        assert!(!source.is_enabled());
        assert!(matches!(rx.try_recv().unwrap(), SourceEvent::ProviderState(false)));
    }
}

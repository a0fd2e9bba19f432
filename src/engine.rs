//! The engine: shared state behind one lock, and the background loop that
//! feeds it.
//!
//! [`Engine`] is a cheap, clonable handle. Every accessor takes the lock for
//! the duration of one read or mutation and never performs I/O while holding
//! it. [`EngineLoop`] owns the scan source and runs on its own thread:
//!
//! ```text
//! running --(scan source failed to start)--> paused
//! paused  --(set_running(true))-----------> running
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use crate::alert::{Alert, AlertDispatcher, Delivery, NotificationTransport};
use crate::defaults::{
    DEFAULT_LINE_TIMEOUT_MS, DEFAULT_PAUSED_POLL_MS, DEFAULT_RESPAWN_BACKOFF_MS,
};
use crate::eventlog::{EventLog, LogEntry};
use crate::filter::TargetEntry;
use crate::protocol::{BdAddress, LocationError, ObserverLocation, VERSION};
use crate::registry::{DeviceRecord, DeviceRegistry};
use crate::scanner::{parse_sighting, LineRead, ScanSource, Sighting, SourceState};

// ── Shared state ─────────────────────────────────────────────────────

struct EngineState {
    registry: DeviceRegistry,
    targets: Vec<TargetEntry>,
    log: EventLog,
    location: Option<ObserverLocation>,
    running: bool,
    /// Appended under the lock, mirrored to the process logger after it drops
    unmirrored: Vec<LogEntry>,
}

impl EngineState {
    fn log(&mut self, message: impl Into<String>) {
        let entry = self.log.append(Utc::now(), message);
        self.unmirrored.push(entry);
    }
}

/// Point-in-time summary for status requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub devices: usize,
    pub targets: usize,
    pub alerted: usize,
    pub location: Option<ObserverLocation>,
    pub uptime_secs: u64,
    pub version: &'static str,
}

/// Handle to the engine's shared state.
#[derive(Clone)]
pub struct Engine {
    state: Arc<Mutex<EngineState>>,
    started: Instant,
}

impl Engine {
    pub fn new(targets: Vec<TargetEntry>) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState {
                registry: DeviceRegistry::new(),
                targets,
                log: EventLog::new(),
                location: None,
                running: true,
                unmirrored: Vec::new(),
            })),
            started: Instant::now(),
        }
    }

    /// The guarded data stays consistent across a panicking holder, so a
    /// poisoned lock is taken over rather than propagated.
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a mutation under the lock. Log entries it appended reach the
    /// process logger only after the guard is dropped.
    fn update<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let (result, entries) = {
            let mut state = self.lock();
            let result = f(&mut *state);
            (result, std::mem::take(&mut state.unmirrored))
        };
        for entry in entries {
            log::info!("{}", entry);
        }
        result
    }

    // ── Read accessors ───────────────────────────────────────────────

    pub fn list_devices(&self) -> Vec<DeviceRecord> {
        self.lock().registry.snapshot()
    }

    pub fn list_logs(&self) -> Vec<LogEntry> {
        self.lock().log.entries()
    }

    pub fn list_targets(&self) -> Vec<TargetEntry> {
        self.lock().targets.clone()
    }

    pub fn observer_location(&self) -> Option<ObserverLocation> {
        self.lock().location
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn status(&self) -> StatusReport {
        let state = self.lock();
        StatusReport {
            running: state.running,
            devices: state.registry.len(),
            targets: state.targets.len(),
            alerted: state.registry.alerted_count(),
            location: state.location,
            uptime_secs: self.started.elapsed().as_secs(),
            version: VERSION,
        }
    }

    // ── Write accessors ──────────────────────────────────────────────

    /// Empty the device registry. Targets are kept.
    pub fn clear(&self) {
        self.update(|state| {
            state.registry.clear();
            state.log("Cleared detection results");
        });
    }

    pub fn add_target(&self, target: TargetEntry) {
        let message = format!("Added target {}", target.bd_address);
        self.update(|state| {
            state.targets.push(target);
            state.log(message);
        });
    }

    pub fn set_observer_location(
        &self,
        lat: f64,
        lng: f64,
        accuracy: f64,
    ) -> Result<ObserverLocation, LocationError> {
        let location = ObserverLocation::new(lat, lng, accuracy)?;
        self.lock().location = Some(location);
        Ok(location)
    }

    pub fn set_running(&self, running: bool) {
        self.update(|state| {
            if state.running != running {
                state.running = running;
                state.log(if running { "Scanning resumed" } else { "Scanning paused" });
            }
        });
    }

    /// Append an operator log entry.
    pub fn log(&self, message: impl Into<String>) {
        self.update(|state| state.log(message));
    }

    // ── Engine operations ────────────────────────────────────────────

    /// Apply one sighting with the current observer location. Returns the
    /// alert to dispatch when this sighting turned the device into a newly
    /// matched target.
    pub fn ingest(&self, sighting: &Sighting) -> Option<Alert> {
        self.update(|state| {
            let location = state.location;
            let applied = state
                .registry
                .apply(sighting, location, &state.targets, Utc::now());

            let record = &applied.record;
            if applied.discovered {
                state.log(format!(
                    "Discovered device {} ({}) at RSSI {}",
                    record.bd_address, record.name, record.rssi
                ));
            }
            if !applied.newly_matched {
                return None;
            }
            state.log(format!(
                "Target detected: {} at RSSI {}",
                record.bd_address, record.rssi
            ));
            Some(Alert {
                bd_address: record.bd_address,
                location,
                first_seen: record.first_seen,
                last_seen: record.last_seen,
            })
        })
    }

    /// Build an operator-requested alert that bypasses the registry.
    pub fn manual_alert(&self, bd_address: BdAddress, location: Option<ObserverLocation>) -> Alert {
        let now = Utc::now();
        let location = location.or_else(|| self.observer_location());
        self.log(format!("Manual alert requested for {}", bd_address));
        Alert {
            bd_address,
            location,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Log the per-recipient outcome of a dispatch.
    pub fn record_deliveries(&self, alert: &Alert, deliveries: &[Delivery]) {
        let message = alert.message();
        self.update(|state| {
            for delivery in deliveries {
                state.log(delivery.describe(&message));
            }
        });
    }

    /// Running to paused after an infrastructure failure.
    fn pause_after_failure(&self, reason: String) {
        self.update(|state| {
            state.log(reason);
            if state.running {
                state.running = false;
                state.log("Scanning paused until resumed");
            }
        });
    }
}

/// Dispatch outside the engine lock, then log the outcomes under it.
pub fn dispatch_alert<T: NotificationTransport>(
    engine: &Engine,
    dispatcher: &AlertDispatcher<T>,
    alert: &Alert,
) -> Vec<Delivery> {
    let deliveries = dispatcher.dispatch(alert);
    engine.record_deliveries(alert, &deliveries);
    deliveries
}

// ── Engine loop ──────────────────────────────────────────────────────

/// Waits used by [`EngineLoop::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTiming {
    pub line_timeout: Duration,
    pub respawn_backoff: Duration,
    pub paused_poll: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            line_timeout: Duration::from_millis(DEFAULT_LINE_TIMEOUT_MS),
            respawn_backoff: Duration::from_millis(DEFAULT_RESPAWN_BACKOFF_MS),
            paused_poll: Duration::from_millis(DEFAULT_PAUSED_POLL_MS),
        }
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Paused; the source was not touched
    Paused,
    /// The source could not be started and the engine is now paused
    SpawnFailed,
    /// No line within the wait
    Idle,
    /// A line that does not describe a device
    Ignored,
    /// A sighting was applied; `alerted` when it triggered a dispatch
    Sighted { bd_address: BdAddress, alerted: bool },
    /// The source stream ended and will be respawned
    SourceClosed,
}

pub struct EngineLoop<S, T> {
    engine: Engine,
    source: S,
    dispatcher: Arc<AlertDispatcher<T>>,
    timing: LoopTiming,
}

impl<S: ScanSource, T: NotificationTransport> EngineLoop<S, T> {
    pub fn new(
        engine: Engine,
        source: S,
        dispatcher: Arc<AlertDispatcher<T>>,
        timing: LoopTiming,
    ) -> Self {
        Self {
            engine,
            source,
            dispatcher,
            timing,
        }
    }

    /// One iteration, without the paused or backoff sleeps.
    pub fn step(&mut self) -> Step {
        if !self.engine.is_running() {
            return Step::Paused;
        }

        match self.source.ensure_running() {
            Ok(SourceState::Running) => {}
            Ok(SourceState::Spawned) => {
                self.engine
                    .log(format!("Scan process started: {}", self.source.describe()));
            }
            Err(err) => {
                self.engine
                    .pause_after_failure(format!("Failed to start scan process: {}", err));
                return Step::SpawnFailed;
            }
        }

        let line = match self.source.next_line(self.timing.line_timeout) {
            LineRead::Line(line) => line,
            LineRead::Idle => return Step::Idle,
            LineRead::Closed => {
                self.engine.log(format!(
                    "Scan process exited; respawning in {}s",
                    self.timing.respawn_backoff.as_secs_f64()
                ));
                return Step::SourceClosed;
            }
        };

        let Some(sighting) = parse_sighting(&line) else {
            return Step::Ignored;
        };
        let alert = self.engine.ingest(&sighting);
        if let Some(alert) = &alert {
            dispatch_alert(&self.engine, &self.dispatcher, alert);
        }
        Step::Sighted {
            bd_address: sighting.identifier,
            alerted: alert.is_some(),
        }
    }

    /// Run forever.
    pub fn run(mut self) -> ! {
        log::info!("Engine loop started");
        loop {
            match self.step() {
                Step::Paused | Step::SpawnFailed => thread::sleep(self.timing.paused_poll),
                Step::SourceClosed => thread::sleep(self.timing.respawn_backoff),
                Step::Idle | Step::Ignored | Step::Sighted { .. } => {}
            }
        }
    }
}

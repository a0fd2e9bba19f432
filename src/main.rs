//! BLUEK9 daemon
//!
//! Thread-based host daemon. The engine thread owns the scan process and
//! dispatches alerts; the main thread serves NDJSON commands on stdio.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use bluek9::alert::{AlertDispatcher, LogTransport, ModemTransport, NotificationTransport};
use bluek9::config::{Config, TransportKind};
use bluek9::engine::{Engine, EngineLoop};
use bluek9::protocol::VERSION;
use bluek9::{comm, defaults, scanner};

type Dispatcher = AlertDispatcher<Box<dyn NotificationTransport>>;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();

    log::info!("BLUEK9 v{} starting", VERSION);

    // ── Engine state ─────────────────────────────────────────────────

    let engine = Engine::new(config.initial_targets());
    if let Some(loc) = config.location {
        engine
            .set_observer_location(loc.lat, loc.lng, loc.accuracy)
            .context("initial location")?;
    }
    if config.start_paused {
        engine.set_running(false);
    }
    log::info!(
        "Watch-list loaded: {} targets, {} known OUI prefixes",
        engine.list_targets().len(),
        defaults::MAC_PREFIXES.len(),
    );

    // ── Alert dispatch ───────────────────────────────────────────────

    let (recipients, dropped) = config.recipients();
    if dropped > 0 {
        log::warn!(
            "{} recipients over the limit of {} were ignored",
            dropped,
            defaults::MAX_RECIPIENTS
        );
    }
    let transport: Box<dyn NotificationTransport> = match config.transport {
        TransportKind::Log => Box::new(LogTransport),
        TransportKind::Modem => Box::new(ModemTransport::new(
            config.modem_program.as_str(),
            config.modem.as_str(),
        )),
    };
    let dispatcher: Arc<Dispatcher> = Arc::new(AlertDispatcher::new(transport, recipients));
    log::info!(
        "Alerts go to {} recipients via {:?} transport",
        dispatcher.recipients().len(),
        config.transport
    );

    // ── Engine thread ────────────────────────────────────────────────

    let source = scanner::ProcessScanSource::new(config.scan_command());
    let engine_loop = EngineLoop::new(engine.clone(), source, dispatcher.clone(), config.timing());
    let engine_thread = thread::Builder::new()
        .name("engine".into())
        .spawn(move || {
            engine_loop.run();
        })?;
    log::info!("Engine thread spawned");

    // ── Status thread ────────────────────────────────────────────────

    if let Some(interval) = config.status_interval() {
        let status_engine = engine.clone();
        thread::Builder::new()
            .name("status".into())
            .spawn(move || status_thread(status_engine, interval))?;
        log::info!("Status thread spawned");
    }

    // ── Command channel, runs on main thread ─────────────────────────

    let stdin = io::stdin();
    comm::serve(stdin.lock(), io::stdout(), &engine, &*dispatcher).context("command channel")?;
    log::info!("Command channel closed; engine keeps running");

    engine_thread
        .join()
        .map_err(|_| anyhow::anyhow!("engine thread panicked"))
}

fn status_thread(engine: Engine, interval: Duration) {
    log::info!("Status thread started");
    loop {
        thread::sleep(interval);
        let status = engine.status();
        log::info!(
            "Status: running={} devices={} targets={} alerted={} uptime={}s",
            status.running,
            status.devices,
            status.targets,
            status.alerted,
            status.uptime_secs,
        );
    }
}

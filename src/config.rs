//! Runtime configuration from the command line and `BLUEK9_*` environment
//! variables. Compile-time defaults live in [`crate::defaults`].

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::alert::Recipients;
use crate::defaults::{
    DEFAULT_ACTIVATION_COMMAND, DEFAULT_LINE_TIMEOUT_MS, DEFAULT_MODEM, DEFAULT_MODEM_PROGRAM,
    DEFAULT_PAUSED_POLL_MS, DEFAULT_RECIPIENTS, DEFAULT_RESPAWN_BACKOFF_MS, DEFAULT_SCAN_PROGRAM,
    DEFAULT_STATUS_INTERVAL_SECS,
};
use crate::engine::LoopTiming;
use crate::filter::{default_targets, TargetEntry};
use crate::protocol::ObserverLocation;
use crate::scanner::ScanCommand;

/// How alerts leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Write alerts to the log only
    Log,
    /// Send SMS through ModemManager (`mmcli`)
    Modem,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "bluek9", version, about = "Bluetooth device tracking and watch-list alerting")]
pub struct Config {
    /// Scan process to run
    #[arg(long, env = "BLUEK9_SCAN_PROGRAM", default_value = DEFAULT_SCAN_PROGRAM)]
    pub scan_program: String,

    /// Argument for the scan process (repeatable)
    #[arg(long = "scan-arg", allow_hyphen_values = true)]
    pub scan_args: Vec<String>,

    /// Written once to the scan process after it starts
    #[arg(long, env = "BLUEK9_ACTIVATION_COMMAND", default_value = DEFAULT_ACTIVATION_COMMAND)]
    pub activation_command: String,

    /// Bounded wait for the next scan line
    #[arg(long, env = "BLUEK9_LINE_TIMEOUT_MS", default_value_t = DEFAULT_LINE_TIMEOUT_MS)]
    pub line_timeout_ms: u64,

    /// Delay before respawning an exited scan process
    #[arg(long, env = "BLUEK9_RESPAWN_BACKOFF_MS", default_value_t = DEFAULT_RESPAWN_BACKOFF_MS)]
    pub respawn_backoff_ms: u64,

    /// Sleep between state checks while paused
    #[arg(long, env = "BLUEK9_PAUSED_POLL_MS", default_value_t = DEFAULT_PAUSED_POLL_MS)]
    pub paused_poll_ms: u64,

    /// Alert recipient (repeatable, at most 10 are used)
    #[arg(long = "recipient", env = "BLUEK9_RECIPIENTS", value_delimiter = ',')]
    pub recipients: Vec<String>,

    /// Watch-list entry as ADDR[,name[,manufacturer]] (repeatable)
    #[arg(long = "target", value_parser = parse_target)]
    pub targets: Vec<TargetEntry>,

    #[arg(long, env = "BLUEK9_TRANSPORT", value_enum, default_value_t = TransportKind::Log)]
    pub transport: TransportKind,

    /// ModemManager client program
    #[arg(long, env = "BLUEK9_MODEM_PROGRAM", default_value = DEFAULT_MODEM_PROGRAM)]
    pub modem_program: String,

    /// Modem index for `mmcli -m`
    #[arg(long, env = "BLUEK9_MODEM", default_value = DEFAULT_MODEM)]
    pub modem: String,

    /// Initial observer location as LAT,LNG,ACCURACY
    #[arg(long, env = "BLUEK9_LOCATION", value_parser = parse_location, allow_hyphen_values = true)]
    pub location: Option<ObserverLocation>,

    /// Start in the paused state
    #[arg(long, env = "BLUEK9_START_PAUSED")]
    pub start_paused: bool,

    /// Seconds between status log lines; 0 disables them
    #[arg(long, env = "BLUEK9_STATUS_INTERVAL_SECS", default_value_t = DEFAULT_STATUS_INTERVAL_SECS)]
    pub status_interval_secs: u64,
}

fn parse_target(spec: &str) -> Result<TargetEntry, String> {
    TargetEntry::parse_spec(spec).map_err(|e| e.to_string())
}

fn parse_location(spec: &str) -> Result<ObserverLocation, String> {
    let fields: Vec<&str> = spec.split(',').map(str::trim).collect();
    let [lat, lng, accuracy] = fields.as_slice() else {
        return Err(format!("expected LAT,LNG,ACCURACY, got {spec:?}"));
    };
    let number = |s: &str| {
        s.parse::<f64>()
            .map_err(|e| format!("invalid number {s:?}: {e}"))
    };
    ObserverLocation::new(number(*lat)?, number(*lng)?, number(*accuracy)?)
        .map_err(|e| e.to_string())
}

impl Config {
    pub fn scan_command(&self) -> ScanCommand {
        ScanCommand {
            program: self.scan_program.clone(),
            args: self.scan_args.clone(),
            activation: self.activation_command.clone(),
        }
    }

    pub fn timing(&self) -> LoopTiming {
        LoopTiming {
            line_timeout: Duration::from_millis(self.line_timeout_ms),
            respawn_backoff: Duration::from_millis(self.respawn_backoff_ms),
            paused_poll: Duration::from_millis(self.paused_poll_ms),
        }
    }

    /// Configured targets, or the compiled-in watch-list when none are given.
    pub fn initial_targets(&self) -> Vec<TargetEntry> {
        if self.targets.is_empty() {
            default_targets()
        } else {
            self.targets.clone()
        }
    }

    /// Configured recipients (or the defaults) and the number dropped by the cap.
    pub fn recipients(&self) -> (Recipients, usize) {
        if self.recipients.is_empty() {
            Recipients::new(DEFAULT_RECIPIENTS)
        } else {
            Recipients::new(&self.recipients)
        }
    }

    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }
}

//! Scan source adapter and sighting parser.
//!
//! The scan source is an external long-running process (`bluetoothctl` by
//! default) that prints one event per line once it has been told to start
//! scanning. [`ProcessScanSource`] owns that process: it spawns it, writes the
//! activation command once, and reads its stdout on a dedicated thread that
//! feeds a bounded channel. The engine loop pulls lines with a bounded wait so
//! it can notice a dead process and respawn it.
//!
//! [`parse_sighting`] turns one line into a [`Sighting`]. Most lines are
//! status chatter and yield `None`.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::defaults::{
    DEFAULT_ACTIVATION_COMMAND, DEFAULT_RSSI, DEFAULT_SCAN_PROGRAM, SCAN_LINE_BUFFER, UNKNOWN,
};
use crate::protocol::{BdAddress, DeviceType};

// ── Sighting parser ──────────────────────────────────────────────────

/// One decoded observation of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub identifier: BdAddress,
    /// Free text after the address; `"Unknown"` when there is none
    pub raw_name: String,
    /// dBm
    pub signal_strength: i16,
    pub device_class: DeviceType,
}

/// Marker printed for Low Energy devices.
pub const LE_MARKER: &str = "[LE]";

/// Terminal colour codes, readline prompt markers, carriage returns.
static ANSI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|[\x01\x02\r]").unwrap());

static ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[0-9a-f]{2}(?::[0-9a-f]{2}){5}\b").unwrap());

/// `RSSI: -55`, or the newer `RSSI: 0xffffffc9 (-55)` form. A bare hex value
/// has no usable reading.
static RSSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"RSSI:\s*(?:0x[0-9A-Fa-f]+\s*\(\s*(-?\d+)\s*\)|(-?\d+)\b)").unwrap()
});

/// The whole RSSI segment, removed from the name text.
static RSSI_SEGMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"RSSI:\s*(?:0x[0-9A-Fa-f]+(?:\s*\(\s*-?\d+\s*\))?|-?\d+)").unwrap()
});

/// Properties that carry the device's resolved name.
const NAME_PROPERTIES: [&str; 2] = ["Name:", "Alias:"];

/// Property-change chatter such as `TxPower: 12` or `ManufacturerData Key: 0x004c`.
static PROPERTY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?: [A-Za-z][A-Za-z0-9]*)?:(?:\s|$)").unwrap()
});

/// Parse one scan line. Never panics; anything that does not describe a
/// device yields `None`.
pub fn parse_sighting(line: &str) -> Option<Sighting> {
    let clean = ANSI_RE.replace_all(line, "");
    let text = clean.trim();

    // Removal notices and the local adapter's own address are not sightings
    if text.starts_with("[DEL]") {
        return None;
    }
    let found = ADDRESS_RE.find(text)?;
    if text[..found.start()].trim_end().ends_with("Controller") {
        return None;
    }
    let identifier: BdAddress = found.as_str().parse().ok()?;

    let signal_strength = RSSI_RE
        .captures(text)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .and_then(|value| value.as_str().parse::<i16>().ok())
        .unwrap_or(DEFAULT_RSSI);

    let device_class = if text.contains(LE_MARKER) {
        DeviceType::Le
    } else {
        DeviceType::ClassicLe
    };

    let rest = RSSI_SEGMENT_RE.replace_all(&text[found.end()..], "");
    let rest = rest.replace(LE_MARKER, "");
    let mut name = rest.trim();
    if let Some(value) = NAME_PROPERTIES
        .iter()
        .find_map(|key| name.strip_prefix(*key))
    {
        name = value.trim();
    } else if PROPERTY_RE.is_match(name) {
        name = "";
    }
    let raw_name = if name.is_empty() {
        UNKNOWN.to_string()
    } else {
        name.to_string()
    };

    Some(Sighting {
        identifier,
        raw_name,
        signal_strength,
        device_class,
    })
}

// ── Scan source ──────────────────────────────────────────────────────

/// Result of [`ScanSource::ensure_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// A process was already alive
    Running,
    /// A new process was started and activated
    Spawned,
}

/// Result of [`ScanSource::next_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    /// Nothing arrived within the wait
    Idle,
    /// The stream ended; the next `ensure_running` respawns
    Closed,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to start scan process `{program}`: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("failed to activate scan process `{program}`: {source}")]
    Activation { program: String, source: io::Error },
    #[error("scan process `{program}` has no {stream} pipe")]
    MissingPipe { program: String, stream: &'static str },
    #[error("failed to start scan reader thread: {0}")]
    Reader(io::Error),
}

/// A restartable source of raw scan lines.
pub trait ScanSource {
    /// Human-readable description for log lines.
    fn describe(&self) -> String;

    /// Spawn and activate the source if it is not alive.
    fn ensure_running(&mut self) -> Result<SourceState, ScanError>;

    /// Wait up to `timeout` for the next line.
    fn next_line(&mut self, timeout: Duration) -> LineRead;
}

/// Program, arguments and activation command for the scan process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCommand {
    pub program: String,
    pub args: Vec<String>,
    pub activation: String,
}

impl Default for ScanCommand {
    fn default() -> Self {
        Self {
            program: DEFAULT_SCAN_PROGRAM.to_string(),
            args: Vec::new(),
            activation: DEFAULT_ACTIVATION_COMMAND.to_string(),
        }
    }
}

/// Scan source backed by a child process.
pub struct ProcessScanSource {
    command: ScanCommand,
    child: Option<Child>,
    // Held open for the life of the process; some scanners exit on stdin EOF
    stdin: Option<ChildStdin>,
    lines: Option<Receiver<String>>,
}

impl ProcessScanSource {
    pub fn new(command: ScanCommand) -> Self {
        Self {
            command,
            child: None,
            stdin: None,
            lines: None,
        }
    }

    fn spawn(&mut self) -> Result<(), ScanError> {
        let program = self.command.program.clone();
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ScanError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stdin = child.stdin.take();
        self.child = Some(child);

        let (Some(stdout), Some(mut stdin)) = (stdout, stdin) else {
            self.stop();
            return Err(ScanError::MissingPipe {
                program,
                stream: "stdio",
            });
        };

        let (tx, rx) = mpsc::sync_channel(SCAN_LINE_BUFFER);
        if let Err(err) = spawn_reader(stdout, tx) {
            self.stop();
            return Err(ScanError::Reader(err));
        }

        let activation = format!("{}\n", self.command.activation);
        if let Err(source) = stdin
            .write_all(activation.as_bytes())
            .and_then(|()| stdin.flush())
        {
            self.stop();
            return Err(ScanError::Activation { program, source });
        }

        self.stdin = Some(stdin);
        self.lines = Some(rx);
        Ok(())
    }

    /// Drop the pipes, then kill and reap the child if it is still alive.
    fn stop(&mut self) {
        self.lines = None;
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

impl ScanSource for ProcessScanSource {
    fn describe(&self) -> String {
        let mut desc = self.command.program.clone();
        for arg in &self.command.args {
            desc.push(' ');
            desc.push_str(arg);
        }
        desc
    }

    fn ensure_running(&mut self) -> Result<SourceState, ScanError> {
        if self.lines.is_some() {
            return Ok(SourceState::Running);
        }
        self.stop();
        self.spawn()?;
        Ok(SourceState::Spawned)
    }

    fn next_line(&mut self, timeout: Duration) -> LineRead {
        let Some(lines) = &self.lines else {
            return LineRead::Closed;
        };
        match lines.recv_timeout(timeout) {
            Ok(line) => LineRead::Line(line),
            Err(RecvTimeoutError::Timeout) => LineRead::Idle,
            Err(RecvTimeoutError::Disconnected) => {
                self.stop();
                LineRead::Closed
            }
        }
    }
}

impl Drop for ProcessScanSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forward stdout lines into the channel until EOF or the receiver goes away.
fn spawn_reader(stdout: ChildStdout, tx: SyncSender<String>) -> io::Result<()> {
    thread::Builder::new()
        .name("scan-reader".into())
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        log::warn!("Scan output read failed: {}", err);
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(s: &str) -> BdAddress {
        s.parse().unwrap()
    }

    // ── parse_sighting: scenarios ───────────────────────────────────

    #[test]
    fn parse_full_le_line() {
        let s = parse_sighting("Device AA:BB:CC:DD:EE:FF TestSensor [LE] RSSI: -55").unwrap();
        assert_eq!(s.identifier, addr("AA:BB:CC:DD:EE:FF"));
        assert_eq!(s.raw_name, "TestSensor");
        assert_eq!(s.signal_strength, -55);
        assert_eq!(s.device_class, DeviceType::Le);
    }

    #[test]
    fn parse_controller_chatter_is_not_sighting() {
        assert_eq!(parse_sighting("[CHG] Controller state on"), None);
        assert_eq!(
            parse_sighting("[CHG] Controller 00:1A:7D:DA:71:13 Discovering: yes"),
            None
        );
    }

    #[test]
    fn parse_new_device_line() {
        let s = parse_sighting("[NEW] Device 58:8e:81:aa:bb:cc Pixel Buds").unwrap();
        assert_eq!(s.identifier.to_string(), "58:8E:81:AA:BB:CC");
        assert_eq!(s.raw_name, "Pixel Buds");
        assert_eq!(s.signal_strength, -90);
        assert_eq!(s.device_class, DeviceType::ClassicLe);
    }

    #[test]
    fn parse_rssi_only_change() {
        let s = parse_sighting("[CHG] Device 11:22:33:44:55:66 RSSI: -71").unwrap();
        assert_eq!(s.raw_name, "Unknown");
        assert_eq!(s.signal_strength, -71);
    }

    #[test]
    fn parse_rssi_hex_form() {
        let s = parse_sighting("[CHG] Device 11:22:33:44:55:66 RSSI: 0xffffffc9 (-55)").unwrap();
        assert_eq!(s.signal_strength, -55);
        assert_eq!(s.raw_name, "Unknown");
    }

    #[test]
    fn parse_property_change_has_unknown_name() {
        let s = parse_sighting("[CHG] Device 11:22:33:44:55:66 TxPower: 12").unwrap();
        assert_eq!(s.raw_name, "Unknown");
        let s = parse_sighting("[CHG] Device 11:22:33:44:55:66 ManufacturerData Key: 0x004c")
            .unwrap();
        assert_eq!(s.raw_name, "Unknown");
    }

    #[test]
    fn parse_name_and_alias_properties_carry_the_name() {
        let s = parse_sighting("[CHG] Device 11:22:33:44:55:66 Name: Pixel Buds").unwrap();
        assert_eq!(s.raw_name, "Pixel Buds");
        let s = parse_sighting("[CHG] Device 11:22:33:44:55:66 Alias: Kitchen Speaker").unwrap();
        assert_eq!(s.raw_name, "Kitchen Speaker");
        let s = parse_sighting("[CHG] Device 11:22:33:44:55:66 Name:").unwrap();
        assert_eq!(s.raw_name, "Unknown");
    }

    #[test]
    fn parse_bare_hex_rssi_uses_default() {
        let s = parse_sighting("[CHG] Device 11:22:33:44:55:66 RSSI: 0xffffffc9").unwrap();
        assert_eq!(s.signal_strength, DEFAULT_RSSI);
        assert_eq!(s.raw_name, "Unknown");
        let s = parse_sighting("Device 11:22:33:44:55:66 Phone RSSI: 0xffffffc9").unwrap();
        assert_eq!(s.signal_strength, DEFAULT_RSSI);
        assert_eq!(s.raw_name, "Phone");
    }

    #[test]
    fn parse_del_is_not_sighting() {
        assert_eq!(parse_sighting("[DEL] Device 11:22:33:44:55:66 Old Phone"), None);
    }

    #[test]
    fn parse_strips_terminal_codes() {
        let line = "\x01\x1b[0;92m\x02[NEW]\x01\x1b[0m\x02 Device AA:BB:CC:DD:EE:01 Watch\r";
        let s = parse_sighting(line).unwrap();
        assert_eq!(s.identifier, addr("AA:BB:CC:DD:EE:01"));
        assert_eq!(s.raw_name, "Watch");
    }

    #[test]
    fn parse_out_of_range_rssi_uses_default() {
        let s = parse_sighting("Device AA:BB:CC:DD:EE:FF x RSSI: -99999999").unwrap();
        assert_eq!(s.signal_strength, DEFAULT_RSSI);
    }

    #[test]
    fn parse_no_address() {
        assert_eq!(parse_sighting(""), None);
        assert_eq!(parse_sighting("Agent registered"), None);
        assert_eq!(parse_sighting("Device AA:BB:CC:DD:EE RSSI: -40"), None);
    }

    // ── parse_sighting: properties ──────────────────────────────────

    proptest! {
        #[test]
        fn parse_is_total_and_deterministic(line in "\\PC{0,80}") {
            let first = parse_sighting(&line);
            let second = parse_sighting(&line);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn parse_recovers_generated_fields(
            octets in any::<[u8; 6]>(),
            name in "[A-Za-z][A-Za-z0-9]{0,11}",
            rssi in -127i16..=20,
            le in any::<bool>(),
        ) {
            let address = BdAddress::new(octets);
            let marker = if le { " [LE]" } else { "" };
            let line = format!("[NEW] Device {address} {name}{marker} RSSI: {rssi}");
            let s = parse_sighting(&line).unwrap();
            prop_assert_eq!(s.identifier, address);
            prop_assert_eq!(s.raw_name, name);
            prop_assert_eq!(s.signal_strength, rssi);
            let expected = if le { DeviceType::Le } else { DeviceType::ClassicLe };
            prop_assert_eq!(s.device_class, expected);
        }
    }

    // ── ProcessScanSource ───────────────────────────────────────────

    #[test]
    fn describe_includes_args() {
        let source = ProcessScanSource::new(ScanCommand {
            program: "btmon".into(),
            args: vec!["-t".into()],
            activation: String::new(),
        });
        assert_eq!(source.describe(), "btmon -t");
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let mut source = ProcessScanSource::new(ScanCommand {
            program: "/nonexistent/bluek9-scanner".into(),
            ..ScanCommand::default()
        });
        assert!(matches!(source.ensure_running(), Err(ScanError::Spawn { .. })));
        assert_eq!(source.next_line(Duration::from_millis(10)), LineRead::Closed);
    }

    #[cfg(unix)]
    #[test]
    fn activation_command_is_written_once() {
        let mut source = ProcessScanSource::new(ScanCommand {
            program: "cat".into(),
            args: Vec::new(),
            activation: "scan on".into(),
        });
        assert_eq!(source.ensure_running().unwrap(), SourceState::Spawned);
        assert_eq!(
            source.next_line(Duration::from_secs(5)),
            LineRead::Line("scan on".into())
        );
        assert_eq!(source.ensure_running().unwrap(), SourceState::Running);
        assert_eq!(source.next_line(Duration::from_millis(50)), LineRead::Idle);
    }

    #[cfg(unix)]
    #[test]
    fn exited_process_reports_closed_then_respawns() {
        let mut source = ProcessScanSource::new(ScanCommand {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                "read cmd; echo \"got $cmd\"; echo '[NEW] Device AA:BB:CC:DD:EE:FF Tag'".into(),
            ],
            activation: "scan on".into(),
        });
        assert_eq!(source.ensure_running().unwrap(), SourceState::Spawned);
        let timeout = Duration::from_secs(5);
        assert_eq!(source.next_line(timeout), LineRead::Line("got scan on".into()));
        assert_eq!(
            source.next_line(timeout),
            LineRead::Line("[NEW] Device AA:BB:CC:DD:EE:FF Tag".into())
        );
        assert_eq!(source.next_line(timeout), LineRead::Closed);
        assert_eq!(source.ensure_running().unwrap(), SourceState::Spawned);
    }
}

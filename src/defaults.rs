//! Compiled-in defaults: watch-list seed, alert recipients, timing, and the
//! vendor prefix table used to label manufacturers.

/// Watch-list seeded at startup when no targets are configured:
/// (address, name, manufacturer).
pub static DEFAULT_TARGETS: &[(&str, &str, &str)] = &[("AA:BB:CC:DD:EE:FF", "Test Target", "Acme")];

/// Alert recipients used when none are configured.
pub static DEFAULT_RECIPIENTS: &[&str] = &["+15551234567"];

/// Upper bound on alert recipients.
pub const MAX_RECIPIENTS: usize = 10;

/// Number of log entries retained; older entries are dropped.
pub const LOG_CAPACITY: usize = 500;

/// Signal strength assumed when a scan line carries no RSSI (dBm).
pub const DEFAULT_RSSI: i16 = -90;

/// Placeholder for missing names and manufacturers.
pub const UNKNOWN: &str = "Unknown";

// ── Scan source ──────────────────────────────────────────────────────

pub const DEFAULT_SCAN_PROGRAM: &str = "bluetoothctl";

/// Written once to the scan process after it starts.
pub const DEFAULT_ACTIVATION_COMMAND: &str = "scan on";

/// Bounded wait for the next scan line before liveness is re-checked.
pub const DEFAULT_LINE_TIMEOUT_MS: u64 = 1000;

/// Delay before respawning a scan process that exited.
pub const DEFAULT_RESPAWN_BACKOFF_MS: u64 = 5000;

/// Sleep between state checks while paused.
pub const DEFAULT_PAUSED_POLL_MS: u64 = 500;

/// Lines buffered between the reader thread and the engine loop.
pub const SCAN_LINE_BUFFER: usize = 256;

// ── Alert transport ──────────────────────────────────────────────────

/// ModemManager command-line client.
pub const DEFAULT_MODEM_PROGRAM: &str = "mmcli";

/// Modem index passed to `mmcli -m`.
pub const DEFAULT_MODEM: &str = "0";

/// Interval for the periodic status log line.
pub const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;

// ── Manufacturer labels ──────────────────────────────────────────────

/// Known vendor prefixes (3-byte OUI, vendor name).
pub static MAC_PREFIXES: &[([u8; 3], &str)] = &[
    // === Apple ===
    ([0x00, 0x03, 0x93], "Apple"),
    ([0x00, 0x1C, 0xB3], "Apple"),
    ([0xF0, 0x18, 0x98], "Apple"),
    // === Samsung ===
    ([0x00, 0x12, 0xFB], "Samsung"),
    ([0x8C, 0x71, 0xF8], "Samsung"),
    // === Sony ===
    ([0x00, 0x13, 0xA9], "Sony"),
    // === Raspberry Pi ===
    ([0xB8, 0x27, 0xEB], "Raspberry Pi"),
    ([0xDC, 0xA6, 0x32], "Raspberry Pi"),
    // === Silicon Labs ===
    ([0x58, 0x8E, 0x81], "Silicon Labs"),
    ([0x90, 0x35, 0xEA], "Silicon Labs"),
];

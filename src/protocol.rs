//! Wire types shared by the engine and its external callers.
//!
//! Everything here serializes to JSON with the field names the web layer and
//! the NDJSON control channel expect. Timestamps are ISO-8601 UTC strings with
//! a trailing `Z`.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::engine::StatusReport;
use crate::eventlog::LogEntry;
use crate::filter::TargetEntry;
use crate::registry::DeviceRecord;

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ── Device address ─────────────────────────────────────────────────────

/// A 6-byte Bluetooth device address.
///
/// Parsing accepts either case; formatting is always the canonical uppercase
/// colon-hex form (`AA:BB:CC:DD:EE:FF`), so two addresses compare equal
/// exactly when their textual forms match case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddress([u8; 6]);

/// Length of a textual address ("AA:BB:CC:DD:EE:FF")
pub const ADDRESS_LEN: usize = 17;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid device address {0:?}, expected AA:BB:CC:DD:EE:FF")]
pub struct AddressError(pub String);

impl BdAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Vendor prefix (first three octets).
    pub fn oui(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }
}

impl fmt::Display for BdAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for BdAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressError(s.to_string());
        if s.len() != ADDRESS_LEN {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl Serialize for BdAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BdAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Timestamps ─────────────────────────────────────────────────────────

/// Render a timestamp as ISO-8601 UTC with a trailing `Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `serialize_with` adapter for [`format_timestamp`].
pub fn serialize_timestamp<S: Serializer>(
    ts: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_timestamp(ts))
}

// ── Device class ───────────────────────────────────────────────────────

/// Bluetooth device class tag as reported by the scan source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "LE")]
    Le,
    Classic,
    #[serde(rename = "Classic/LE")]
    ClassicLe,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Le => "LE",
            DeviceType::Classic => "Classic",
            DeviceType::ClassicLe => "Classic/LE",
            DeviceType::Unknown => "Unknown",
        }
    }
}

// ── Observer location ──────────────────────────────────────────────────

/// Position of the scanning system itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObserverLocation {
    pub lat: f64,
    pub lng: f64,
    /// Accuracy radius in metres
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum LocationError {
    #[error("latitude {0} outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} outside [-180, 180]")]
    Longitude(f64),
    #[error("accuracy {0} must be a non-negative number of metres")]
    Accuracy(f64),
}

impl ObserverLocation {
    /// Build a validated location. NaN coordinates are rejected.
    pub fn new(lat: f64, lng: f64, accuracy: f64) -> Result<Self, LocationError> {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(LocationError::Latitude(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(LocationError::Longitude(lng));
        }
        if !accuracy.is_finite() || accuracy < 0.0 {
            return Err(LocationError::Accuracy(accuracy));
        }
        Ok(Self { lat, lng, accuracy })
    }

    /// Re-check a location that arrived through deserialization.
    pub fn validated(self) -> Result<Self, LocationError> {
        Self::new(self.lat, self.lng, self.accuracy)
    }
}

// ── Control channel ────────────────────────────────────────────────────

/// Commands accepted on the NDJSON control channel, tagged by `"cmd"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum HostCommand {
    ListDevices,
    ListLogs,
    ListTargets,
    Status,
    /// Empty the device registry (targets are kept)
    Clear,
    AddTarget {
        bd_address: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        manufacturer: Option<String>,
    },
    SetLocation {
        lat: f64,
        lng: f64,
        accuracy: f64,
    },
    /// Resume scanning
    Start,
    /// Pause scanning
    Stop,
    /// Send an alert for an arbitrary address, bypassing the registry
    SimulateAlert {
        bd_address: String,
        #[serde(default)]
        location: Option<ObserverLocation>,
    },
}

/// One reply line on the control channel.
#[derive(Debug, Serialize)]
pub struct HostReply {
    pub ok: bool,
    #[serde(flatten)]
    pub body: ReplyBody,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ReplyBody {
    Devices { devices: Vec<DeviceRecord> },
    Logs { logs: Vec<LogEntry> },
    Targets { targets: Vec<TargetEntry> },
    Status { status: StatusReport },
    Error { error: String },
    Empty {},
}

impl HostReply {
    pub fn ok(body: ReplyBody) -> Self {
        Self { ok: true, body }
    }

    pub fn done() -> Self {
        Self::ok(ReplyBody::Empty {})
    }

    pub fn error(error: impl fmt::Display) -> Self {
        Self {
            ok: false,
            body: ReplyBody::Error {
                error: error.to_string(),
            },
        }
    }
}

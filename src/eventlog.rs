//! Append-only operator log, capped at [`LOG_CAPACITY`] entries.
//!
//! The ring is a fixed-capacity `heapless::Deque`; once full, appending drops
//! the oldest entry. The owner mirrors appended entries to the process
//! logger, outside any lock it holds.

use core::fmt;

use chrono::{DateTime, Utc};
use heapless::Deque;
use serde::Serialize;

use crate::defaults::LOG_CAPACITY;
use crate::protocol::{format_timestamp, serialize_timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", format_timestamp(&self.timestamp), self.message)
    }
}

pub struct EventLog {
    entries: Deque<LogEntry, LOG_CAPACITY>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            entries: Deque::new(),
        }
    }

    /// Append an entry and return a copy of it for mirroring.
    pub fn append(&mut self, timestamp: DateTime<Utc>, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            timestamp,
            message: message.into(),
        };
        if self.entries.is_full() {
            self.entries.pop_front();
        }
        // Cannot fail: a slot was just freed if the ring was full
        let _ = self.entries.push_back(entry.clone());
        entry
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn starts_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert!(log.entries().is_empty());
    }

    #[test]
    fn append_keeps_order() {
        let mut log = EventLog::new();
        let appended = log.append(ts(0), "first");
        log.append(ts(1), "second");
        assert_eq!(appended.message, "first");
        assert_eq!(appended.timestamp, ts(0));
        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[1].message, "second");
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut log = EventLog::new();
        for i in 0..=LOG_CAPACITY {
            log.append(ts(i as i64), format!("entry {i}"));
        }
        assert_eq!(log.len(), LOG_CAPACITY);
        let entries = log.entries();
        assert_eq!(entries.first().unwrap().message, "entry 1");
        assert_eq!(
            entries.last().unwrap().message,
            format!("entry {LOG_CAPACITY}")
        );
        assert!(!entries.iter().any(|e| e.message == "entry 0"));
    }

    #[test]
    fn display_is_timestamp_then_message() {
        let entry = LogEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            message: "Cleared detection results".into(),
        };
        assert_eq!(
            entry.to_string(),
            "2024-01-02T03:04:05.000000Z Cleared detection results"
        );
    }

    #[test]
    fn serializes_with_iso_timestamp() {
        let entry = LogEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            message: "hello".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"timestamp":"2024-01-02T03:04:05.000000Z","message":"hello"}"#
        );
    }
}

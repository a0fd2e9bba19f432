//! Alert dispatch to configured recipients.
//!
//! The dispatcher formats one message per alert and hands it to a
//! [`NotificationTransport`] once per recipient. Failures are collected per
//! recipient; one failed send never stops delivery to the rest. Deduplication
//! is not done here: the registry's has-alerted flag decides when to call in.

use std::process::{Command, Output};

use chrono::{DateTime, Utc};
use heapless::Vec as BoundedVec;
use thiserror::Error;

use crate::defaults::{DEFAULT_MODEM, DEFAULT_MODEM_PROGRAM, MAX_RECIPIENTS};
use crate::protocol::{format_timestamp, BdAddress, ObserverLocation};

/// A device that just became a matched target.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub bd_address: BdAddress,
    pub location: Option<ObserverLocation>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Alert {
    /// Operator-facing alert text.
    pub fn message(&self) -> String {
        let position = match &self.location {
            Some(loc) => format!("({:.4},{:.4})", loc.lat, loc.lng),
            None => "(unknown)".to_string(),
        };
        format!(
            "BLUEK9 Alert: Target {} detected. System @{} First: {} Last: {}",
            self.bd_address,
            position,
            format_timestamp(&self.first_seen),
            format_timestamp(&self.last_seen),
        )
    }
}

// ── Transport ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("`{program} {step}` exited with {status}: {stderr}")]
    Failed {
        program: String,
        step: &'static str,
        status: String,
        stderr: String,
    },
    #[error("could not find the created message in modem output: {0:?}")]
    UnexpectedOutput(String),
    #[error("{0}")]
    Other(String),
}

/// Delivers one message to one recipient.
pub trait NotificationTransport: Send + Sync {
    fn send(&self, message: &str, recipient: &str) -> Result<(), TransportError>;
}

impl<T: NotificationTransport + ?Sized> NotificationTransport for Box<T> {
    fn send(&self, message: &str, recipient: &str) -> Result<(), TransportError> {
        (**self).send(message, recipient)
    }
}

/// Writes alerts to the process logger instead of sending them anywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

impl NotificationTransport for LogTransport {
    fn send(&self, message: &str, recipient: &str) -> Result<(), TransportError> {
        log::warn!("ALERT for {}: {}", recipient, message);
        Ok(())
    }
}

/// Sends SMS through ModemManager's `mmcli`.
///
/// Arguments are passed as an argv vector, never through a shell. Creating the
/// message prints its D-Bus path, which is then used to send it.
#[derive(Debug, Clone)]
pub struct ModemTransport {
    program: String,
    modem: String,
}

/// Prefix of the D-Bus object path `mmcli` prints for a created SMS.
const SMS_PATH_PREFIX: &str = "/org/freedesktop/ModemManager1/SMS/";

impl ModemTransport {
    pub fn new(program: impl Into<String>, modem: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            modem: modem.into(),
        }
    }

    fn run(&self, step: &'static str, args: &[String]) -> Result<Output, TransportError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| TransportError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(TransportError::Failed {
                program: self.program.clone(),
                step,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl Default for ModemTransport {
    fn default() -> Self {
        Self::new(DEFAULT_MODEM_PROGRAM, DEFAULT_MODEM)
    }
}

/// `mmcli` splits its key-value list on commas and quotes with `'`.
fn sms_field(value: &str) -> String {
    value.replace(['\'', ','], " ")
}

/// Extract the SMS object path from `mmcli --messaging-create-sms` output.
pub fn parse_created_sms(output: &str) -> Option<&str> {
    output
        .split_whitespace()
        .find(|token| token.starts_with(SMS_PATH_PREFIX))
}

impl NotificationTransport for ModemTransport {
    fn send(&self, message: &str, recipient: &str) -> Result<(), TransportError> {
        let create = self.run(
            "--messaging-create-sms",
            &[
                "-m".to_string(),
                self.modem.clone(),
                format!(
                    "--messaging-create-sms=text='{}',number='{}'",
                    sms_field(message),
                    sms_field(recipient)
                ),
            ],
        )?;
        let stdout = String::from_utf8_lossy(&create.stdout);
        let path = parse_created_sms(&stdout)
            .ok_or_else(|| TransportError::UnexpectedOutput(stdout.trim().to_string()))?;

        self.run(
            "--send",
            &["-s".to_string(), path.to_string(), "--send".to_string()],
        )?;
        Ok(())
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

/// Recipient list capped at [`MAX_RECIPIENTS`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients(BoundedVec<String, MAX_RECIPIENTS>);

impl Recipients {
    /// Keep the first [`MAX_RECIPIENTS`] non-blank entries. Returns the list
    /// and how many entries did not fit.
    pub fn new<I, S>(recipients: I) -> (Self, usize)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = BoundedVec::new();
        let mut dropped = 0;
        for recipient in recipients {
            let recipient = recipient.as_ref().trim();
            if recipient.is_empty() {
                continue;
            }
            if list.push(recipient.to_string()).is_err() {
                dropped += 1;
            }
        }
        (Self(list), dropped)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Result of sending to one recipient.
#[derive(Debug)]
pub struct Delivery {
    pub recipient: String,
    pub outcome: Result<(), TransportError>,
}

impl Delivery {
    /// Log line for this delivery.
    pub fn describe(&self, message: &str) -> String {
        match &self.outcome {
            Ok(()) => format!("SMS queued for {}: {}", self.recipient, message),
            Err(err) => format!("Failed to send SMS to {}: {}", self.recipient, err),
        }
    }
}

pub struct AlertDispatcher<T> {
    transport: T,
    recipients: Recipients,
}

impl<T: NotificationTransport> AlertDispatcher<T> {
    pub fn new(transport: T, recipients: Recipients) -> Self {
        Self {
            transport,
            recipients,
        }
    }

    pub fn recipients(&self) -> &Recipients {
        &self.recipients
    }

    /// Send `alert` to every recipient. Never short-circuits on failure.
    pub fn dispatch(&self, alert: &Alert) -> Vec<Delivery> {
        let message = alert.message();
        self.recipients
            .iter()
            .map(|recipient| Delivery {
                recipient: recipient.to_string(),
                outcome: self.transport.send(&message, recipient),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Records every send; fails for recipients listed in `failing`.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
        failing: Vec<String>,
    }

    impl NotificationTransport for RecordingTransport {
        fn send(&self, message: &str, recipient: &str) -> Result<(), TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push((message.to_string(), recipient.to_string()));
            if self.failing.iter().any(|r| r == recipient) {
                return Err(TransportError::Other("modem offline".into()));
            }
            Ok(())
        }
    }

    fn alert(location: Option<ObserverLocation>) -> Alert {
        Alert {
            bd_address: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            location,
            first_seen: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            last_seen: Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap(),
        }
    }

    // ── Message format ──────────────────────────────────────────────

    #[test]
    fn message_with_location() {
        let loc = ObserverLocation::new(37.774929, -122.419416, 30.0).unwrap();
        assert_eq!(
            alert(Some(loc)).message(),
            "BLUEK9 Alert: Target AA:BB:CC:DD:EE:FF detected. System @(37.7749,-122.4194) \
             First: 2024-03-01T10:00:00.000000Z Last: 2024-03-01T10:05:00.000000Z"
        );
    }

    #[test]
    fn message_without_location() {
        let msg = alert(None).message();
        assert!(msg.contains("System @(unknown)"), "{msg}");
    }

    // ── Recipients ──────────────────────────────────────────────────

    #[test]
    fn recipients_capped_at_ten() {
        let numbers: Vec<String> = (0..12).map(|i| format!("+1555000{i:04}")).collect();
        let (recipients, dropped) = Recipients::new(&numbers);
        assert_eq!(recipients.len(), MAX_RECIPIENTS);
        assert_eq!(dropped, 2);
        assert_eq!(recipients.iter().next(), Some("+15550000000"));
    }

    #[test]
    fn recipients_skip_blank() {
        let (recipients, dropped) = Recipients::new(["", "  ", "+15551234567"]);
        assert_eq!(recipients.len(), 1);
        assert_eq!(dropped, 0);
    }

    // ── Dispatch ────────────────────────────────────────────────────

    #[test]
    fn dispatch_sends_once_per_recipient() {
        let (recipients, _) = Recipients::new(["+1", "+2", "+3"]);
        let dispatcher = AlertDispatcher::new(RecordingTransport::default(), recipients);
        assert_eq!(dispatcher.recipients().len(), 3);
        let deliveries = dispatcher.dispatch(&alert(None));

        assert_eq!(deliveries.len(), 3);
        assert!(deliveries.iter().all(|d| d.outcome.is_ok()));
        let sent = dispatcher.transport.sent.lock().unwrap();
        let to: Vec<&str> = sent.iter().map(|(_, r)| r.as_str()).collect();
        assert_eq!(to, ["+1", "+2", "+3"]);
        assert!(sent.iter().all(|(m, _)| m.starts_with("BLUEK9 Alert:")));
    }

    #[test]
    fn failing_recipient_does_not_block_others() {
        let (recipients, _) = Recipients::new(["+1", "+2", "+3"]);
        let transport = RecordingTransport {
            failing: vec!["+1".into()],
            ..Default::default()
        };
        let dispatcher = AlertDispatcher::new(transport, recipients);
        let deliveries = dispatcher.dispatch(&alert(None));

        assert_eq!(deliveries.len(), 3);
        assert!(deliveries[0].outcome.is_err());
        assert!(deliveries[1].outcome.is_ok());
        assert!(deliveries[2].outcome.is_ok());
        assert_eq!(dispatcher.transport.sent.lock().unwrap().len(), 3);
    }

    #[test]
    fn no_recipients_no_sends() {
        let dispatcher = AlertDispatcher::new(RecordingTransport::default(), Recipients::default());
        assert!(dispatcher.dispatch(&alert(None)).is_empty());
    }

    #[test]
    fn delivery_log_lines() {
        let ok = Delivery {
            recipient: "+1".into(),
            outcome: Ok(()),
        };
        assert_eq!(ok.describe("hi"), "SMS queued for +1: hi");
        let failed = Delivery {
            recipient: "+2".into(),
            outcome: Err(TransportError::Other("modem offline".into())),
        };
        assert_eq!(failed.describe("hi"), "Failed to send SMS to +2: modem offline");
    }

    // ── ModemTransport ──────────────────────────────────────────────

    #[test]
    fn created_sms_path_parsed() {
        let out = "Successfully created new SMS: /org/freedesktop/ModemManager1/SMS/3 (unknown)\n";
        assert_eq!(
            parse_created_sms(out),
            Some("/org/freedesktop/ModemManager1/SMS/3")
        );
        assert_eq!(parse_created_sms("error: couldn't create SMS"), None);
    }

    #[test]
    fn sms_fields_cannot_break_out_of_quotes() {
        assert_eq!(sms_field("it's, fine"), "it s  fine");
    }

    #[test]
    fn missing_modem_program_is_spawn_error() {
        let transport = ModemTransport::new("/nonexistent/bluek9-mmcli", "0");
        assert!(matches!(
            transport.send("hello", "+1"),
            Err(TransportError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn modem_failure_reports_step() {
        // `false` ignores its arguments and exits 1
        let transport = ModemTransport::new("false", "0");
        match transport.send("hello", "+1") {
            Err(TransportError::Failed { step, .. }) => assert_eq!(step, "--messaging-create-sms"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn boxed_transport_delegates() {
        let boxed: Box<dyn NotificationTransport> = Box::new(LogTransport);
        assert!(boxed.send("msg", "+1").is_ok());
    }
}

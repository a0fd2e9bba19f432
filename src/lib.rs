//! BLUEK9 library: Bluetooth device tracking and watch-list alerting.
//!
//! A scan process (normally `bluetoothctl`) streams text lines. Each line
//! that describes a device becomes a [`scanner::Sighting`], which the
//! [`engine::Engine`] folds into the [`registry::DeviceRegistry`]. When a
//! watch-listed address is seen for the first time, an [`alert::Alert`] is
//! dispatched to every recipient. An NDJSON [`comm`] channel exposes the
//! device list, the event log and the watch-list to outside callers.
//!
//! Everything here is testable on the host with `cargo test`; the binary is
//! a thin consumer that wires configuration, threads and stdio together.

pub mod alert;
pub mod comm;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod eventlog;
pub mod filter;
pub mod protocol;
pub mod registry;
pub mod scanner;

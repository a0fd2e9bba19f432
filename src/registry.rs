//! Device registry: one record per distinct device address.
//!
//! [`DeviceRegistry::apply`] upserts a sighting and reports whether the
//! device has just become an alertable target. The registry itself holds no
//! lock; the engine owns it behind its single mutex, which is what makes the
//! has-alerted check-and-set atomic.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::defaults::UNKNOWN;
use crate::filter::{is_target, lookup_manufacturer, TargetEntry};
use crate::protocol::{serialize_timestamp, BdAddress, DeviceType, ObserverLocation};
use crate::scanner::Sighting;

/// Per-device state, serialized in the wire form the web layer reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub bd_address: BdAddress,
    pub name: String,
    pub manufacturer: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub first_seen: DateTime<Utc>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub last_seen: DateTime<Utc>,
    pub rssi: i16,
    /// Observer position at first sighting; never reassigned once set
    pub emitter_location: Option<ObserverLocation>,
    /// Observer position at the latest sighting
    pub system_location: Option<ObserverLocation>,
    pub device_type: DeviceType,
    pub is_target: bool,
    #[serde(skip)]
    pub has_alerted: bool,
}

impl DeviceRecord {
    fn new(sighting: &Sighting, location: Option<ObserverLocation>, now: DateTime<Utc>) -> Self {
        Self {
            bd_address: sighting.identifier,
            name: sighting.raw_name.clone(),
            manufacturer: lookup_manufacturer(&sighting.identifier).to_string(),
            first_seen: now,
            last_seen: now,
            rssi: sighting.signal_strength,
            emitter_location: location,
            system_location: location,
            device_type: sighting.device_class,
            is_target: false,
            has_alerted: false,
        }
    }
}

/// Outcome of [`DeviceRegistry::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// Copy of the record after the update
    pub record: DeviceRecord,
    /// The address had not been seen before
    pub discovered: bool,
    /// The device is a target and this call claimed its one alert
    pub newly_matched: bool,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<BdAddress, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a sighting observed at `now` from `location`.
    pub fn apply(
        &mut self,
        sighting: &Sighting,
        location: Option<ObserverLocation>,
        targets: &[TargetEntry],
        now: DateTime<Utc>,
    ) -> Applied {
        let mut discovered = false;
        let record = self.devices.entry(sighting.identifier).or_insert_with(|| {
            discovered = true;
            DeviceRecord::new(sighting, location, now)
        });

        record.last_seen = now.max(record.first_seen);
        if sighting.raw_name != UNKNOWN || record.name.is_empty() {
            record.name = sighting.raw_name.clone();
        }
        record.rssi = sighting.signal_strength;
        record.device_type = sighting.device_class;
        record.system_location = location;
        if record.emitter_location.is_none() {
            record.emitter_location = location;
        }

        record.is_target = is_target(&record.bd_address, targets);
        let newly_matched = record.is_target && !record.has_alerted;
        if newly_matched {
            record.has_alerted = true;
        }

        Applied {
            record: record.clone(),
            discovered,
            newly_matched,
        }
    }

    /// Copies of all records, ordered by first sighting.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.devices.values().cloned().collect();
        records.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.bd_address.cmp(&b.bd_address))
        });
        records
    }

    pub fn get(&self, addr: &BdAddress) -> Option<&DeviceRecord> {
        self.devices.get(addr)
    }

    /// Remove every record. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.devices.len();
        self.devices.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn alerted_count(&self) -> usize {
        self.devices.values().filter(|r| r.has_alerted).count()
    }
}

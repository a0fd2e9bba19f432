//! Target matching against the operator watch-list.
//!
//! Matching is identifier-only. Addresses are stored in canonical form, so
//! comparison is case-insensitive with respect to how either side was typed.
//! Watch-lists are operator-sized, so a linear scan per sighting is fine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults::{DEFAULT_TARGETS, MAC_PREFIXES, UNKNOWN};
use crate::protocol::{AddressError, BdAddress};

/// A watch-list entry supplied by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub bd_address: BdAddress,
    pub name: String,
    pub manufacturer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("target entry is missing a device address")]
    MissingAddress,
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
}

impl TargetEntry {
    /// Validate and build an entry. Blank metadata becomes `"Unknown"`.
    pub fn new(bd_address: &str, name: &str, manufacturer: &str) -> Result<Self, TargetError> {
        let bd_address = bd_address.trim();
        if bd_address.is_empty() {
            return Err(TargetError::MissingAddress);
        }
        Ok(Self {
            bd_address: bd_address.parse()?,
            name: label_or_unknown(name),
            manufacturer: label_or_unknown(manufacturer),
        })
    }

    /// Parse `ADDR[,name[,manufacturer]]`, the command-line form.
    pub fn parse_spec(spec: &str) -> Result<Self, TargetError> {
        let mut fields = spec.splitn(3, ',');
        let addr = fields.next().unwrap_or("");
        let name = fields.next().unwrap_or("");
        let manufacturer = fields.next().unwrap_or("");
        Self::new(addr, name, manufacturer)
    }
}

fn label_or_unknown(label: &str) -> String {
    let label = label.trim();
    if label.is_empty() {
        UNKNOWN.to_string()
    } else {
        label.to_string()
    }
}

/// The compiled-in watch-list.
pub fn default_targets() -> Vec<TargetEntry> {
    DEFAULT_TARGETS
        .iter()
        .filter_map(|&(addr, name, mfr)| TargetEntry::new(addr, name, mfr).ok())
        .collect()
}

/// First watch-list entry whose address matches, if any.
pub fn matching_target<'a>(addr: &BdAddress, targets: &'a [TargetEntry]) -> Option<&'a TargetEntry> {
    targets.iter().find(|t| t.bd_address == *addr)
}

/// Whether `addr` is on the watch-list.
pub fn is_target(addr: &BdAddress, targets: &[TargetEntry]) -> bool {
    matching_target(addr, targets).is_some()
}

/// Manufacturer label for an address, from its vendor prefix.
pub fn lookup_manufacturer(addr: &BdAddress) -> &'static str {
    let oui = addr.oui();
    MAC_PREFIXES
        .iter()
        .find(|(prefix, _)| *prefix == oui)
        .map(|&(_, vendor)| vendor)
        .unwrap_or(UNKNOWN)
}

//! Attribute-key codec for packed event items.
//!
//! Each event is stored as one item attribute named `_{version}`. The
//! shard index groups versions into contiguous ranges of
//! `events_per_item`, independent of write order.

use crate::error::ValidationError;

const PREFIX: char = '_';

/// Build the attribute key for a version.
pub fn key(version: u64) -> String {
    format!("{}{}", PREFIX, version)
}

/// True when the key is exactly the prefix followed by a decimal version.
pub fn is_event_key(key: &str) -> bool {
    match key.strip_prefix(PREFIX) {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Decode the version from an attribute key.
pub fn version_from_key(key: &str) -> Result<u64, ValidationError> {
    let digits = key
        .strip_prefix(PREFIX)
        .ok_or_else(|| ValidationError::InvalidKey(key.to_string()))?;
    digits
        .parse()
        .map_err(|_| ValidationError::InvalidKey(key.to_string()))
}

/// Shard holding a version when packing `events_per_item` records per item.
pub fn shard_index(version: u64, events_per_item: u64) -> u64 {
    version / events_per_item
}

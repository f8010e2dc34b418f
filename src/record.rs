//! Core event record types.
//!
//! Payloads are opaque bytes to this crate: serialization of domain events
//! is the caller's concern.

use serde::{Deserialize, Serialize};

/// A single event in an aggregate's history.
///
/// `version` is positive and, by convention, contiguous from 1 upward
/// within an aggregate. The `(aggregate, version)` pair is immutable once
/// written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Position of this event within the aggregate's history.
    pub version: u64,
    /// Opaque event payload.
    pub data: Vec<u8>,
}

impl Record {
    /// Create a record from a version and payload.
    pub fn new(version: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            data: data.into(),
        }
    }
}

/// Ascending, version-unique sequence of records for one aggregate.
pub type History = Vec<Record>;

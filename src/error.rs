//! Error taxonomy shared across the crate.
//!
//! Each subsystem surfaces its own enum so callers can match on what they
//! can act on: a `StoreError::Conflict` means reload-and-retry, a
//! `SinkError` propagates to the delivery mechanism's own redrive.

use std::fmt;
use std::time::Duration;

/// Malformed input: attribute keys, stream ARNs, tag values, or change
/// notifications missing required attributes.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid event key: {0}")]
    InvalidKey(String),

    #[error("attribute {0} does not hold a binary payload")]
    NotBinary(String),

    #[error("invalid event source arn: {0}")]
    InvalidEventSource(String),

    #[error("invalid value for tag {key}: {value}")]
    InvalidTag { key: String, value: String },

    #[error("change notification has no {0} attribute")]
    MissingHashKey(String),
}

/// Errors from event store save/load operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic-lock violation: a stored payload differs from the
    /// proposed payload at an existing version. Callers should reload and
    /// retry; the store never retries internally.
    #[error("version conflict for aggregate {aggregate_id}: stored payload differs from proposed")]
    Conflict { aggregate_id: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("dynamodb {operation} failed for table {table}: {message}")]
    Table {
        operation: &'static str,
        table: String,
        message: String,
    },
}

/// The downstream destination kind a sink delivers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// SQS queue sender.
    Queue,
    /// SNS topic publisher.
    Topic,
    /// Firehose batch-object uploader.
    DeliveryStream,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Queue => f.write_str("sqs queue"),
            SinkKind::Topic => f.write_str("sns topic"),
            SinkKind::DeliveryStream => f.write_str("firehose delivery stream"),
        }
    }
}

/// Errors from sink resolution and delivery.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Destination creation or describe failed while resolving or lazily
    /// provisioning a sink.
    #[error("unable to provision {kind} {destination}: {message}")]
    Provisioning {
        kind: SinkKind,
        destination: String,
        message: String,
    },

    /// Outbound send/publish/batch call failed. Never retried here; the
    /// invoking delivery mechanism's redrive governs retry.
    #[error("unable to deliver to {kind} {destination}: {message}")]
    Dispatch {
        kind: SinkKind,
        destination: String,
        message: String,
    },

    /// The bounded provisioning wait was exhausted before the destination
    /// became active.
    #[error("delivery stream {stream} did not become active within {waited:?}")]
    ActivationTimeout { stream: String, waited: Duration },

    #[error("unable to list tags for {table_arn}: {message}")]
    ListTags { table_arn: String, message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Errors from stream batch processing. Any variant aborts the remainder
/// of the batch being routed.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

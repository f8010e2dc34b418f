//! Event-sourced persistence on DynamoDB with tag-driven fan-out.
//!
//! Aggregate histories are stored as numbered binary attributes packed
//! across items, appended with optimistic concurrency. The table's
//! change-capture stream feeds a router that fans newly appended records
//! out to SQS queues, SNS topics, and Firehose delivery streams declared
//! through resource tags.

pub mod changes;
pub mod error;
pub mod producer;
pub mod record;
pub mod router;
pub mod store;
pub mod tags;
pub mod watcher;

pub use error::{RouterError, SinkError, SinkKind, StoreError, ValidationError};
pub use record::{History, Record};
pub use router::{ChangeNotification, Router};
pub use store::{Store, StoreConfig};

//! Fan-out of appended events to downstream sinks.
//!
//! This module contains:
//! - `Sink` trait: one downstream delivery target
//! - `SinkFactory` trait: resolves zero or more sinks from a table's tags
//! - `SinkRegistry`: ordered factory list owned by the caller
//! - `Dispatcher`: ordered composite of sinks, fail-fast
//! - `TableTags` trait + `DispatcherCache`: per-table dispatcher resolution
//! - Implementations: SQS, SNS, Firehose, mock

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{SinkError, SinkKind};
use crate::record::Record;
use crate::tags::Tag;

pub mod firehose;
pub mod mock;
pub mod sns;
pub mod sqs;

pub use firehose::{FirehoseFactory, FirehoseSink, UploaderConfig};
pub use mock::{MockSink, MockSinkFactory, StaticTableTags};
pub use sns::{SnsFactory, SnsSink};
pub use sqs::{SqsFactory, SqsSink};

/// Result type for sink operations.
pub type Result<T> = std::result::Result<T, SinkError>;

/// One downstream delivery target for an aggregate's new records.
///
/// Sinks operate purely on the records they are given and persist no
/// acknowledgment state; redelivery of a failed batch is the caller's
/// redrive concern.
#[async_trait]
pub trait Sink: Send + Sync + std::fmt::Debug {
    /// The destination kind, for error reporting.
    fn kind(&self) -> SinkKind;

    /// The destination identity (queue URL, topic ARN, stream name).
    fn destination(&self) -> &str;

    /// Deliver an ordered batch of records for one aggregate.
    async fn send(&self, aggregate_id: &str, records: &[Record]) -> Result<()>;
}

/// Resolves sinks from a table's tags.
///
/// A factory returning an empty vec contributes nothing (the relevant tag
/// is absent); a malformed tag value is a `Validation` error.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn make(&self, table_arn: &str, tags: &[Tag]) -> Result<Vec<Arc<dyn Sink>>>;
}

/// Ordered, caller-owned list of sink factories.
///
/// An explicit value rather than a process-global list, so tests and
/// callers can hold isolated registries.
#[derive(Default)]
pub struct SinkRegistry {
    factories: Vec<Box<dyn SinkFactory>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a factory. Factories run in registration order.
    pub fn register(mut self, factory: impl SinkFactory + 'static) -> Self {
        self.factories.push(Box::new(factory));
        self
    }

    /// Run every factory against the table's tags and compose the results
    /// into one dispatcher.
    pub async fn make_dispatcher(&self, table_arn: &str, tags: &[Tag]) -> Result<Dispatcher> {
        let mut sinks = Vec::new();
        for factory in &self.factories {
            sinks.extend(factory.make(table_arn, tags).await?);
        }

        debug!(table_arn = %table_arn, sinks = sinks.len(), "Composed dispatcher");
        Ok(Dispatcher { sinks })
    }
}

/// Ordered composite of sinks for one table.
#[derive(Default)]
pub struct Dispatcher {
    sinks: Vec<Arc<dyn Sink>>,
}

impl Dispatcher {
    /// Invoke each sink in registration order.
    ///
    /// The first failing sink aborts the call; later sinks are not
    /// invoked, and side effects of earlier sinks are not rolled back
    /// (at-least-once delivery, not exactly-once).
    pub async fn send(&self, aggregate_id: &str, records: &[Record]) -> Result<()> {
        for sink in &self.sinks {
            sink.send(aggregate_id, records).await?;
        }
        Ok(())
    }

    /// Number of composed sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

/// Source of a table's resource tags.
#[async_trait]
pub trait TableTags: Send + Sync {
    async fn list_tags(&self, table_arn: &str) -> Result<Vec<Tag>>;
}

/// Tag source backed by the DynamoDB resource tagging API.
pub struct DynamoTableTags {
    client: aws_sdk_dynamodb::Client,
}

impl DynamoTableTags {
    pub fn new(client: aws_sdk_dynamodb::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TableTags for DynamoTableTags {
    async fn list_tags(&self, table_arn: &str) -> Result<Vec<Tag>> {
        let mut tags = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_tags_of_resource()
                .resource_arn(table_arn)
                .set_next_token(token.take())
                .send()
                .await
                .map_err(|e| SinkError::ListTags {
                    table_arn: table_arn.to_string(),
                    message: e.into_service_error().to_string(),
                })?;

            tags.extend(
                output
                    .tags()
                    .iter()
                    .map(|tag| Tag::new(tag.key(), tag.value())),
            );

            token = output.next_token().map(|t| t.to_string());
            if token.is_none() {
                break;
            }
        }

        Ok(tags)
    }
}

/// Resolves and caches one dispatcher per table.
///
/// The mutex guards only the cache lookup/insert; tag listing and factory
/// calls run outside it, so concurrent resolution of distinct tables is
/// never serialized by the cache.
pub struct DispatcherCache {
    tags: Arc<dyn TableTags>,
    registry: SinkRegistry,
    dispatchers: Mutex<HashMap<String, Arc<Dispatcher>>>,
}

impl DispatcherCache {
    pub fn new(tags: Arc<dyn TableTags>, registry: SinkRegistry) -> Self {
        Self {
            tags,
            registry,
            dispatchers: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the dispatcher for a table, building and caching it on
    /// first use.
    pub async fn resolve(&self, table_arn: &str) -> Result<Arc<Dispatcher>> {
        {
            let dispatchers = self.dispatchers.lock().await;
            if let Some(dispatcher) = dispatchers.get(table_arn) {
                return Ok(Arc::clone(dispatcher));
            }
        }

        let tags = self.tags.list_tags(table_arn).await?;
        let dispatcher = Arc::new(self.registry.make_dispatcher(table_arn, &tags).await?);

        info!(table_arn = %table_arn, sinks = dispatcher.len(), "Resolved dispatcher");

        let mut dispatchers = self.dispatchers.lock().await;
        Ok(Arc::clone(
            dispatchers
                .entry(table_arn.to_string())
                .or_insert(dispatcher),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockSink, MockSinkFactory, StaticTableTags};
    use super::*;
    use crate::tags;

    fn records() -> Vec<Record> {
        vec![Record::new(1, b"a".to_vec()), Record::new(2, b"b".to_vec())]
    }

    #[tokio::test]
    async fn dispatcher_invokes_sinks_in_registration_order() {
        let first = Arc::new(MockSink::new("first"));
        let second = Arc::new(MockSink::new("second"));

        let dispatcher = Dispatcher {
            sinks: vec![first.clone(), second.clone()],
        };
        dispatcher.send("abc", &records()).await.unwrap();

        let first_calls = first.calls().await;
        let second_calls = second.calls().await;
        assert_eq!(first_calls.len(), 1);
        assert_eq!(second_calls.len(), 1);
        assert_eq!(first_calls[0].0, "abc");
        assert_eq!(first_calls[0].1, records());
    }

    #[tokio::test]
    async fn dispatcher_aborts_on_first_failure() {
        let first = Arc::new(MockSink::new("first"));
        let second = Arc::new(MockSink::failing("second"));
        let third = Arc::new(MockSink::new("third"));

        let dispatcher = Dispatcher {
            sinks: vec![first.clone(), second.clone(), third.clone()],
        };

        let err = dispatcher.send("abc", &records()).await.unwrap_err();
        assert!(matches!(err, SinkError::Dispatch { .. }));
        assert_eq!(first.calls().await.len(), 1);
        assert_eq!(second.calls().await.len(), 1);
        assert_eq!(third.calls().await.len(), 0);
    }

    #[tokio::test]
    async fn registry_concatenates_factory_output_in_order() {
        let registry = SinkRegistry::new()
            .register(MockSinkFactory::new(vec!["a", "b"]))
            .register(MockSinkFactory::new(vec![]))
            .register(MockSinkFactory::new(vec!["c"]));

        let dispatcher = registry
            .make_dispatcher("arn:aws:dynamodb:us-west-2:1:table/t", &[])
            .await
            .unwrap();

        assert_eq!(dispatcher.len(), 3);
    }

    #[tokio::test]
    async fn cache_resolves_once_per_table() {
        let tags_source = Arc::new(StaticTableTags::new(vec![Tag::new(tags::CORE, "")]));
        let cache = DispatcherCache::new(
            tags_source.clone(),
            SinkRegistry::new().register(MockSinkFactory::new(vec!["a"])),
        );

        let arn = "arn:aws:dynamodb:us-west-2:1:table/t";
        let first = cache.resolve(arn).await.unwrap();
        let second = cache.resolve(arn).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(tags_source.lookups().await, 1);
    }

    #[tokio::test]
    async fn cache_keys_by_table_arn() {
        let tags_source = Arc::new(StaticTableTags::new(vec![]));
        let cache = DispatcherCache::new(
            tags_source.clone(),
            SinkRegistry::new().register(MockSinkFactory::new(vec!["a"])),
        );

        cache
            .resolve("arn:aws:dynamodb:us-west-2:1:table/one")
            .await
            .unwrap();
        cache
            .resolve("arn:aws:dynamodb:us-west-2:1:table/two")
            .await
            .unwrap();

        assert_eq!(tags_source.lookups().await, 2);
    }
}

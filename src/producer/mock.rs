//! In-memory sink, factory, and tag-source implementations for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Result, Sink, SinkFactory, TableTags};
use crate::error::{SinkError, SinkKind};
use crate::record::Record;
use crate::tags::Tag;

/// Sink that records every call and optionally fails.
#[derive(Debug)]
pub struct MockSink {
    destination: String,
    fail: bool,
    calls: Mutex<Vec<(String, Vec<Record>)>>,
}

impl MockSink {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A sink whose every send fails with a dispatch error.
    pub fn failing(destination: impl Into<String>) -> Self {
        Self {
            fail: true,
            ..Self::new(destination)
        }
    }

    /// The `(aggregate_id, records)` pairs this sink has received.
    pub async fn calls(&self) -> Vec<(String, Vec<Record>)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Sink for MockSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Queue
    }

    fn destination(&self) -> &str {
        &self.destination
    }

    async fn send(&self, aggregate_id: &str, records: &[Record]) -> Result<()> {
        self.calls
            .lock()
            .await
            .push((aggregate_id.to_string(), records.to_vec()));

        if self.fail {
            return Err(SinkError::Dispatch {
                kind: SinkKind::Queue,
                destination: self.destination.clone(),
                message: "mock failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Factory returning a fixed set of mock sinks regardless of tags.
pub struct MockSinkFactory {
    sinks: Vec<Arc<MockSink>>,
}

impl MockSinkFactory {
    pub fn new(destinations: Vec<&str>) -> Self {
        Self {
            sinks: destinations
                .into_iter()
                .map(|d| Arc::new(MockSink::new(d)))
                .collect(),
        }
    }

    pub fn sinks(&self) -> &[Arc<MockSink>] {
        &self.sinks
    }
}

#[async_trait]
impl SinkFactory for MockSinkFactory {
    async fn make(&self, _table_arn: &str, _tags: &[Tag]) -> Result<Vec<Arc<dyn Sink>>> {
        Ok(self
            .sinks
            .iter()
            .map(|sink| Arc::clone(sink) as Arc<dyn Sink>)
            .collect())
    }
}

/// Tag source returning a fixed tag list and counting lookups.
pub struct StaticTableTags {
    tags: Vec<Tag>,
    lookups: Mutex<usize>,
}

impl StaticTableTags {
    pub fn new(tags: Vec<Tag>) -> Self {
        Self {
            tags,
            lookups: Mutex::new(0),
        }
    }

    /// How many times tags were listed.
    pub async fn lookups(&self) -> usize {
        *self.lookups.lock().await
    }
}

#[async_trait]
impl TableTags for StaticTableTags {
    async fn list_tags(&self, _table_arn: &str) -> Result<Vec<Tag>> {
        *self.lookups.lock().await += 1;
        Ok(self.tags.clone())
    }
}

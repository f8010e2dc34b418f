//! SQS queue sink.
//!
//! One sink per queue name in the table's queue tag. Records are sent in
//! batches of at most ten, base64-encoded. FIFO queues additionally get a
//! fresh deduplication id per record and the aggregate id as the message
//! group, so per-aggregate ordering holds.

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_sqs::types::SendMessageBatchRequestEntry;
use aws_sdk_sqs::Client;
use base64::prelude::*;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Result, Sink, SinkFactory};
use crate::error::{SinkError, SinkKind};
use crate::record::Record;
use crate::tags::{self, Tag};

/// Most records per SendMessageBatch call.
const MAX_BATCH: usize = 10;

/// Resolves one [`SqsSink`] per queue named in the queue tag.
pub struct SqsFactory {
    client: Client,
}

impl SqsFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SinkFactory for SqsFactory {
    async fn make(&self, table_arn: &str, table_tags: &[Tag]) -> Result<Vec<Arc<dyn Sink>>> {
        let Some(value) = tags::find_value(table_tags, tags::SQS) else {
            return Ok(Vec::new());
        };

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        for name in tags::split_names(value) {
            info!(queue = %name, table_arn = %table_arn, "Creating queue if not exists");

            let output = self
                .client
                .create_queue()
                .queue_name(name)
                .send()
                .await
                .map_err(|e| SinkError::Provisioning {
                    kind: SinkKind::Queue,
                    destination: name.to_string(),
                    message: e.into_service_error().to_string(),
                })?;

            let queue_url = output
                .queue_url()
                .ok_or_else(|| SinkError::Provisioning {
                    kind: SinkKind::Queue,
                    destination: name.to_string(),
                    message: "CreateQueue returned no queue url".to_string(),
                })?
                .to_string();

            sinks.push(Arc::new(SqsSink {
                client: self.client.clone(),
                queue_url,
            }));
        }

        Ok(sinks)
    }
}

/// Sends records to one SQS queue.
#[derive(Debug)]
pub struct SqsSink {
    client: Client,
    queue_url: String,
}

impl SqsSink {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    fn is_fifo(&self) -> bool {
        self.queue_url.ends_with(".fifo")
    }
}

#[async_trait]
impl Sink for SqsSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Queue
    }

    fn destination(&self) -> &str {
        &self.queue_url
    }

    async fn send(&self, aggregate_id: &str, records: &[Record]) -> Result<()> {
        for chunk in records.chunks(MAX_BATCH) {
            let entries = batch_entries(aggregate_id, chunk, self.is_fifo())?;

            self.client
                .send_message_batch()
                .queue_url(&self.queue_url)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| SinkError::Dispatch {
                    kind: SinkKind::Queue,
                    destination: self.queue_url.clone(),
                    message: e.into_service_error().to_string(),
                })?;

            debug!(
                queue_url = %self.queue_url,
                aggregate_id = %aggregate_id,
                count = chunk.len(),
                "Sent message batch"
            );
        }

        Ok(())
    }
}

/// Build the batch entries for one chunk of at most [`MAX_BATCH`] records.
/// Entry ids are synthetic, 1-based within the chunk.
fn batch_entries(
    aggregate_id: &str,
    chunk: &[Record],
    fifo: bool,
) -> Result<Vec<SendMessageBatchRequestEntry>> {
    let mut entries = Vec::with_capacity(chunk.len());

    for (index, record) in chunk.iter().enumerate() {
        let mut builder = SendMessageBatchRequestEntry::builder()
            .id((index + 1).to_string())
            .message_body(BASE64_STANDARD.encode(&record.data));

        if fifo {
            builder = builder
                .message_deduplication_id(Uuid::new_v4().simple().to_string())
                .message_group_id(aggregate_id);
        }

        entries.push(builder.build().map_err(|e| SinkError::Dispatch {
            kind: SinkKind::Queue,
            destination: aggregate_id.to_string(),
            message: e.to_string(),
        })?);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> SqsFactory {
        let conf = aws_sdk_sqs::Config::builder()
            .behavior_version(aws_sdk_sqs::config::BehaviorVersion::latest())
            .build();
        SqsFactory::new(Client::from_conf(conf))
    }

    fn records(count: usize) -> Vec<Record> {
        (1..=count as u64)
            .map(|version| Record::new(version, version.to_be_bytes().to_vec()))
            .collect()
    }

    #[tokio::test]
    async fn absent_tag_yields_no_sinks() {
        let sinks = factory()
            .make("arn:aws:dynamodb:us-west-2:1:table/t", &[])
            .await
            .unwrap();
        assert!(sinks.is_empty());
    }

    #[tokio::test]
    async fn blank_queue_names_yield_no_sinks() {
        let table_tags = vec![Tag::new(tags::SQS, " , ,")];
        let sinks = factory()
            .make("arn:aws:dynamodb:us-west-2:1:table/t", &table_tags)
            .await
            .unwrap();
        assert!(sinks.is_empty());
    }

    #[test]
    fn chunks_respect_batch_limit() {
        let all = records(25);
        let sizes: Vec<usize> = all.chunks(MAX_BATCH).map(<[Record]>::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn entries_carry_base64_bodies_and_one_based_ids() {
        let chunk = vec![Record::new(1, b"a".to_vec()), Record::new(2, b"b".to_vec())];
        let entries = batch_entries("abc", &chunk, false).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id(), "1");
        assert_eq!(entries[1].id(), "2");
        assert_eq!(entries[0].message_body(), BASE64_STANDARD.encode(b"a"));
        assert!(entries[0].message_deduplication_id().is_none());
        assert!(entries[0].message_group_id().is_none());
    }

    #[test]
    fn fifo_entries_get_group_and_fresh_dedup_ids() {
        let chunk = records(2);
        let entries = batch_entries("abc", &chunk, true).unwrap();

        assert_eq!(entries[0].message_group_id(), Some("abc"));
        assert_eq!(entries[1].message_group_id(), Some("abc"));

        let first = entries[0].message_deduplication_id().unwrap();
        let second = entries[1].message_deduplication_id().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn fifo_detection_by_url_suffix() {
        let conf = aws_sdk_sqs::Config::builder()
            .behavior_version(aws_sdk_sqs::config::BehaviorVersion::latest())
            .build();
        let client = Client::from_conf(conf);

        let plain = SqsSink::new(client.clone(), "https://sqs.us-west-2.amazonaws.com/1/orders");
        let fifo = SqsSink::new(client, "https://sqs.us-west-2.amazonaws.com/1/orders.fifo");

        assert!(!plain.is_fifo());
        assert!(fifo.is_fifo());
    }
}

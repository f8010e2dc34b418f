//! SNS topic sink.
//!
//! One sink per topic name in the table's topic tag. SNS has no batch
//! publish here: one network call per record, base64-encoded.

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_sns::Client;
use base64::prelude::*;
use tracing::{debug, info};

use super::{Result, Sink, SinkFactory};
use crate::error::{SinkError, SinkKind};
use crate::record::Record;
use crate::tags::{self, Tag};

/// Resolves one [`SnsSink`] per topic named in the topic tag.
pub struct SnsFactory {
    client: Client,
}

impl SnsFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SinkFactory for SnsFactory {
    async fn make(&self, table_arn: &str, table_tags: &[Tag]) -> Result<Vec<Arc<dyn Sink>>> {
        let Some(value) = tags::find_value(table_tags, tags::SNS) else {
            return Ok(Vec::new());
        };

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        for name in tags::split_names(value) {
            info!(topic = %name, table_arn = %table_arn, "Creating topic if not exists");

            let output = self
                .client
                .create_topic()
                .name(name)
                .send()
                .await
                .map_err(|e| SinkError::Provisioning {
                    kind: SinkKind::Topic,
                    destination: name.to_string(),
                    message: e.into_service_error().to_string(),
                })?;

            let topic_arn = output
                .topic_arn()
                .ok_or_else(|| SinkError::Provisioning {
                    kind: SinkKind::Topic,
                    destination: name.to_string(),
                    message: "CreateTopic returned no topic arn".to_string(),
                })?
                .to_string();

            sinks.push(Arc::new(SnsSink {
                client: self.client.clone(),
                topic_arn,
            }));
        }

        Ok(sinks)
    }
}

/// Publishes records to one SNS topic.
#[derive(Debug)]
pub struct SnsSink {
    client: Client,
    topic_arn: String,
}

impl SnsSink {
    pub fn new(client: Client, topic_arn: impl Into<String>) -> Self {
        Self {
            client,
            topic_arn: topic_arn.into(),
        }
    }
}

#[async_trait]
impl Sink for SnsSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Topic
    }

    fn destination(&self) -> &str {
        &self.topic_arn
    }

    async fn send(&self, aggregate_id: &str, records: &[Record]) -> Result<()> {
        for record in records {
            self.client
                .publish()
                .topic_arn(&self.topic_arn)
                .message(BASE64_STANDARD.encode(&record.data))
                .send()
                .await
                .map_err(|e| SinkError::Dispatch {
                    kind: SinkKind::Topic,
                    destination: self.topic_arn.clone(),
                    message: e.into_service_error().to_string(),
                })?;

            debug!(
                topic_arn = %self.topic_arn,
                aggregate_id = %aggregate_id,
                version = record.version,
                "Published record"
            );
        }

        Ok(())
    }
}

//! Firehose batch-object sink.
//!
//! Archives records through a Kinesis Firehose delivery stream into an S3
//! bucket, newline-delimited base64. The delivery stream is provisioned
//! lazily on first use: create if absent, then poll until active, bounded
//! by the configured activation timeout. Once a stream has been seen
//! active, the sink skips re-provisioning for its lifetime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_firehose::primitives::Blob;
use aws_sdk_firehose::types::{
    DeliveryStreamStatus, DeliveryStreamType, EncryptionConfiguration,
    ExtendedS3DestinationConfiguration, KmsEncryptionConfig, Record as FirehoseRecord, Tag,
};
use aws_sdk_firehose::Client;
use base64::prelude::*;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Result, Sink, SinkFactory};
use crate::error::{SinkError, SinkKind, ValidationError};
use crate::record::Record;
use crate::tags;

/// Most records per PutRecordBatch call.
const MAX_BATCH: usize = 100;

/// Provisioning configuration for the uploader.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// IAM role the delivery stream assumes to write the bucket.
    pub role_arn: String,
    /// KMS key for the stream's S3 encryption.
    pub key_arn: String,
    /// Seconds between activation polls (default: 5).
    pub poll_interval_secs: u64,
    /// Bound on the activation wait (default: 300).
    pub activation_timeout_secs: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            role_arn: String::new(),
            key_arn: String::new(),
            poll_interval_secs: 5,
            activation_timeout_secs: 300,
        }
    }
}

impl UploaderConfig {
    pub fn new(role_arn: impl Into<String>, key_arn: impl Into<String>) -> Self {
        Self {
            role_arn: role_arn.into(),
            key_arn: key_arn.into(),
            ..Self::default()
        }
    }

    /// Set the activation poll interval, floored at one second.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs().max(1);
        self
    }

    /// Set the activation wait bound.
    pub fn with_activation_timeout(mut self, timeout: Duration) -> Self {
        self.activation_timeout_secs = timeout.as_secs();
        self
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }
}

/// Resolves one [`FirehoseSink`] from the `{stream},{bucket}` tag.
pub struct FirehoseFactory {
    client: Client,
    config: UploaderConfig,
}

impl FirehoseFactory {
    pub fn new(client: Client, config: UploaderConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl SinkFactory for FirehoseFactory {
    async fn make(&self, table_arn: &str, table_tags: &[tags::Tag]) -> Result<Vec<Arc<dyn Sink>>> {
        let Some(value) = tags::find_value(table_tags, tags::FIREHOSE) else {
            return Ok(Vec::new());
        };

        let parts: Vec<&str> = value.split(tags::SEPARATOR).map(str::trim).collect();
        let &[stream_name, bucket] = parts.as_slice() else {
            return Err(ValidationError::InvalidTag {
                key: tags::FIREHOSE.to_string(),
                value: value.to_string(),
            }
            .into());
        };
        if stream_name.is_empty() || bucket.is_empty() {
            return Err(ValidationError::InvalidTag {
                key: tags::FIREHOSE.to_string(),
                value: value.to_string(),
            }
            .into());
        }

        let table_name = table_arn.rsplit('/').next().unwrap_or(table_arn);

        Ok(vec![Arc::new(FirehoseSink::new(
            self.client.clone(),
            table_name,
            stream_name,
            bucket,
            self.config.clone(),
        ))])
    }
}

/// Uploads record batches through one delivery stream.
#[derive(Debug)]
pub struct FirehoseSink {
    client: Client,
    table_name: String,
    stream_name: String,
    bucket: String,
    config: UploaderConfig,
    /// True once the stream has been observed active. Guards only the
    /// flag; provisioning network calls run outside the lock.
    active: Mutex<bool>,
}

impl FirehoseSink {
    pub fn new(
        client: Client,
        table_name: impl Into<String>,
        stream_name: impl Into<String>,
        bucket: impl Into<String>,
        config: UploaderConfig,
    ) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            stream_name: stream_name.into(),
            bucket: bucket.into(),
            config,
            active: Mutex::new(false),
        }
    }

    fn provisioning_error(&self, message: impl ToString) -> SinkError {
        SinkError::Provisioning {
            kind: SinkKind::DeliveryStream,
            destination: self.stream_name.clone(),
            message: message.to_string(),
        }
    }

    async fn ensure_active(&self) -> Result<()> {
        if *self.active.lock().await {
            return Ok(());
        }

        self.create_stream_if_not_exists().await?;
        self.wait_for_active().await?;

        *self.active.lock().await = true;
        Ok(())
    }

    async fn create_stream_if_not_exists(&self) -> Result<()> {
        if self
            .client
            .describe_delivery_stream()
            .delivery_stream_name(&self.stream_name)
            .send()
            .await
            .is_ok()
        {
            debug!(stream = %self.stream_name, "Found existing delivery stream");
            return Ok(());
        }

        let mut prefix = self.table_name.clone();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }

        info!(
            stream = %self.stream_name,
            bucket = %self.bucket,
            "Creating delivery stream"
        );

        let s3_config = ExtendedS3DestinationConfiguration::builder()
            .bucket_arn(format!("arn:aws:s3:::{}", self.bucket))
            .role_arn(&self.config.role_arn)
            .prefix(prefix)
            .encryption_configuration(
                EncryptionConfiguration::builder()
                    .kms_encryption_config(
                        KmsEncryptionConfig::builder()
                            .awskms_key_arn(&self.config.key_arn)
                            .build()
                            .map_err(|e| self.provisioning_error(e))?,
                    )
                    .build(),
            )
            .build()
            .map_err(|e| self.provisioning_error(e))?;

        self.client
            .create_delivery_stream()
            .delivery_stream_name(&self.stream_name)
            .delivery_stream_type(DeliveryStreamType::DirectPut)
            .extended_s3_destination_configuration(s3_config)
            .tags(
                Tag::builder()
                    .key(tags::CORE)
                    .value("")
                    .build()
                    .map_err(|e| self.provisioning_error(e))?,
            )
            .send()
            .await
            .map_err(|e| self.provisioning_error(e.into_service_error()))?;

        Ok(())
    }

    /// Poll until the stream reports ACTIVE, bounded by the configured
    /// activation timeout. Dropping the future cancels the wait.
    async fn wait_for_active(&self) -> Result<()> {
        let started = Instant::now();

        loop {
            let output = self
                .client
                .describe_delivery_stream()
                .delivery_stream_name(&self.stream_name)
                .send()
                .await
                .map_err(|e| self.provisioning_error(e.into_service_error()))?;

            let status = output
                .delivery_stream_description()
                .map(|d| d.delivery_stream_status().clone());

            if matches!(status, Some(DeliveryStreamStatus::Active)) {
                return Ok(());
            }

            if started.elapsed() >= self.config.activation_timeout() {
                return Err(SinkError::ActivationTimeout {
                    stream: self.stream_name.clone(),
                    waited: started.elapsed(),
                });
            }

            info!(stream = %self.stream_name, "Waiting for delivery stream to become active");
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}

#[async_trait]
impl Sink for FirehoseSink {
    fn kind(&self) -> SinkKind {
        SinkKind::DeliveryStream
    }

    fn destination(&self) -> &str {
        &self.stream_name
    }

    async fn send(&self, aggregate_id: &str, records: &[Record]) -> Result<()> {
        self.ensure_active().await?;

        for chunk in records.chunks(MAX_BATCH) {
            let mut batch = Vec::with_capacity(chunk.len());
            for record in chunk {
                batch.push(
                    FirehoseRecord::builder()
                        .data(Blob::new(encode_payload(&record.data)))
                        .build()
                        .map_err(|e| SinkError::Dispatch {
                            kind: SinkKind::DeliveryStream,
                            destination: self.stream_name.clone(),
                            message: e.to_string(),
                        })?,
                );
            }

            self.client
                .put_record_batch()
                .delivery_stream_name(&self.stream_name)
                .set_records(Some(batch))
                .send()
                .await
                .map_err(|e| SinkError::Dispatch {
                    kind: SinkKind::DeliveryStream,
                    destination: self.stream_name.clone(),
                    message: e.into_service_error().to_string(),
                })?;

            debug!(
                stream = %self.stream_name,
                aggregate_id = %aggregate_id,
                count = chunk.len(),
                "Put record batch"
            );
        }

        Ok(())
    }
}

/// Base64-encode a payload with a trailing line break, so archived
/// objects are newline-delimited.
fn encode_payload(data: &[u8]) -> Vec<u8> {
    let mut encoded = BASE64_STANDARD.encode(data).into_bytes();
    encoded.push(b'\n');
    encoded
}

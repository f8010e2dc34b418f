//! Table provisioning for event-sourced tables.
//!
//! Creates the table with the change-capture stream enabled (new and old
//! images, which the change extractor requires) and applies the fan-out
//! wiring tags idempotently.

use std::time::Duration;

use aws_sdk_dynamodb::types::{
    AttributeDefinition, BillingMode, KeySchemaElement, KeyType, PointInTimeRecoverySpecification,
    ProvisionedThroughput, ScalarAttributeType, StreamSpecification, StreamViewType, TableStatus,
    Tag,
};
use aws_sdk_dynamodb::Client;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{HASH_KEY, RANGE_KEY};
use crate::tags;

/// Interval between readiness polls.
const READINESS_POLL: Duration = Duration::from_secs(5);

/// Upper bound on readiness polls before giving up.
const READINESS_ATTEMPTS: usize = 60;

/// Options for [`create_table_if_not_exists`].
#[derive(Debug, Clone, Default)]
pub struct CreateTableOptions {
    /// Provisioned (read, write) capacity. Pay-per-request when not set.
    provisioned: Option<(i64, i64)>,
    point_in_time_recovery: bool,
    /// Compatibility with the amazon/dynamodb-local image, which supports
    /// neither tagging nor pay-per-request billing.
    local: bool,
    queue_names: Vec<String>,
    topic_names: Vec<String>,
    firehose: Option<(String, String)>,
}

impl CreateTableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use provisioned throughput instead of pay-per-request.
    pub fn with_provisioned_throughput(mut self, read: i64, write: i64) -> Self {
        self.provisioned = Some((read, write));
        self
    }

    /// Enable point-in-time recovery after creation.
    pub fn with_point_in_time_recovery(mut self) -> Self {
        self.point_in_time_recovery = true;
        self
    }

    /// Target a local dynamodb-local endpoint: skip tagging and force
    /// provisioned billing.
    pub fn with_local_endpoint(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Deliver events to these SQS queues.
    pub fn with_sqs(mut self, queue_names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.queue_names.extend(queue_names.into_iter().map(Into::into));
        self
    }

    /// Publish events to these SNS topics.
    pub fn with_sns(mut self, topic_names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.topic_names.extend(topic_names.into_iter().map(Into::into));
        self
    }

    /// Archive events through a Firehose delivery stream into a bucket.
    pub fn with_firehose(mut self, stream_name: impl Into<String>, bucket: impl Into<String>) -> Self {
        self.firehose = Some((stream_name.into(), bucket.into()));
        self
    }

    fn billing_mode(&self) -> BillingMode {
        if self.local || self.provisioned.is_some() {
            BillingMode::Provisioned
        } else {
            BillingMode::PayPerRequest
        }
    }

    fn throughput(&self) -> Option<(i64, i64)> {
        match (self.local, self.provisioned) {
            (_, Some(capacity)) => Some(capacity),
            (true, None) => Some((5, 5)),
            (false, None) => None,
        }
    }
}

/// Build the wiring tags implied by the options: the marker tag plus one
/// value-bearing tag per configured sink kind.
fn wiring_tags(options: &CreateTableOptions) -> Vec<(String, String)> {
    let mut pairs = vec![(tags::CORE.to_string(), String::new())];

    if !options.queue_names.is_empty() {
        pairs.push((tags::SQS.to_string(), options.queue_names.join(tags::SEPARATOR)));
    }
    if !options.topic_names.is_empty() {
        pairs.push((tags::SNS.to_string(), options.topic_names.join(tags::SEPARATOR)));
    }
    if let Some((stream, bucket)) = &options.firehose {
        pairs.push((
            tags::FIREHOSE.to_string(),
            format!("{stream}{}{bucket}", tags::SEPARATOR),
        ));
    }

    pairs
}

fn table_error(table: &str, operation: &'static str, message: impl ToString) -> StoreError {
    StoreError::Table {
        operation,
        table: table.to_string(),
        message: message.to_string(),
    }
}

/// Create an event-sourced table if it does not exist, wait for it to
/// become active, and apply any missing wiring tags.
pub async fn create_table_if_not_exists(
    client: &Client,
    table: &str,
    options: &CreateTableOptions,
) -> Result<(), StoreError> {
    let table_arn = create_table(client, table, options).await?;
    wait_for_table_active(client, table).await?;

    if !options.local {
        ensure_tags(client, table, &table_arn, options).await?;
    }

    if options.point_in_time_recovery {
        enable_point_in_time_recovery(client, table).await?;
    }

    Ok(())
}

/// Create the table, tolerating an existing one. Returns the table ARN.
async fn create_table(
    client: &Client,
    table: &str,
    options: &CreateTableOptions,
) -> Result<String, StoreError> {
    let build_err = |e: aws_sdk_dynamodb::error::BuildError| table_error(table, "CreateTable", e);

    let mut request = client
        .create_table()
        .table_name(table)
        .billing_mode(options.billing_mode())
        .attribute_definitions(
            AttributeDefinition::builder()
                .attribute_name(HASH_KEY)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(build_err)?,
        )
        .attribute_definitions(
            AttributeDefinition::builder()
                .attribute_name(RANGE_KEY)
                .attribute_type(ScalarAttributeType::N)
                .build()
                .map_err(build_err)?,
        )
        .key_schema(
            KeySchemaElement::builder()
                .attribute_name(HASH_KEY)
                .key_type(KeyType::Hash)
                .build()
                .map_err(build_err)?,
        )
        .key_schema(
            KeySchemaElement::builder()
                .attribute_name(RANGE_KEY)
                .key_type(KeyType::Range)
                .build()
                .map_err(build_err)?,
        )
        .stream_specification(
            StreamSpecification::builder()
                .stream_enabled(true)
                .stream_view_type(StreamViewType::NewAndOldImages)
                .build()
                .map_err(build_err)?,
        );

    if let Some((read, write)) = options.throughput() {
        request = request.provisioned_throughput(
            ProvisionedThroughput::builder()
                .read_capacity_units(read)
                .write_capacity_units(write)
                .build()
                .map_err(build_err)?,
        );
    }

    match request.send().await {
        Ok(output) => {
            info!(table = %table, "Created event-sourced table");
            if let Some(arn) = output.table_description().and_then(|t| t.table_arn()) {
                return Ok(arn.to_string());
            }
        }
        Err(err) => {
            let service = err.into_service_error();
            if !service.is_resource_in_use_exception() {
                return Err(table_error(table, "CreateTable", service));
            }
            debug!(table = %table, "Table already exists");
        }
    }

    let output = client
        .describe_table()
        .table_name(table)
        .send()
        .await
        .map_err(|e| table_error(table, "DescribeTable", e.into_service_error()))?;

    output
        .table()
        .and_then(|t| t.table_arn())
        .map(|arn| arn.to_string())
        .ok_or_else(|| table_error(table, "DescribeTable", "no table arn in description"))
}

/// Poll until the table reports ACTIVE, bounded.
async fn wait_for_table_active(client: &Client, table: &str) -> Result<(), StoreError> {
    for _ in 0..READINESS_ATTEMPTS {
        let output = client
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| table_error(table, "DescribeTable", e.into_service_error()))?;

        if let Some(TableStatus::Active) = output.table().and_then(|t| t.table_status()) {
            return Ok(());
        }

        info!(table = %table, "Waiting for table to become active");
        tokio::time::sleep(READINESS_POLL).await;
    }

    Err(table_error(
        table,
        "DescribeTable",
        "table did not become active",
    ))
}

/// Apply wiring tags that are not yet present on the table.
async fn ensure_tags(
    client: &Client,
    table: &str,
    table_arn: &str,
    options: &CreateTableOptions,
) -> Result<(), StoreError> {
    let mut current = Vec::new();
    let mut token: Option<String> = None;

    loop {
        let output = client
            .list_tags_of_resource()
            .resource_arn(table_arn)
            .set_next_token(token.take())
            .send()
            .await
            .map_err(|e| table_error(table, "ListTagsOfResource", e.into_service_error()))?;

        current.extend(output.tags().iter().map(|tag| tag.key().to_string()));

        token = output.next_token().map(|t| t.to_string());
        if token.is_none() {
            break;
        }
    }

    let mut missing = Vec::new();
    for (tag_key, value) in wiring_tags(options) {
        if current.iter().any(|existing| *existing == tag_key) {
            continue;
        }
        missing.push(
            Tag::builder()
                .key(&tag_key)
                .value(value)
                .build()
                .map_err(|e| table_error(table, "TagResource", e))?,
        );
    }

    if missing.is_empty() {
        return Ok(());
    }

    info!(table = %table, count = missing.len(), "Tagging event-sourced table");
    client
        .tag_resource()
        .resource_arn(table_arn)
        .set_tags(Some(missing))
        .send()
        .await
        .map_err(|e| table_error(table, "TagResource", e.into_service_error()))?;

    Ok(())
}

/// Enable point-in-time recovery, waiting out the window where continuous
/// backups are not yet available on a fresh table.
async fn enable_point_in_time_recovery(client: &Client, table: &str) -> Result<(), StoreError> {
    let output = client
        .describe_continuous_backups()
        .table_name(table)
        .send()
        .await
        .map_err(|e| table_error(table, "DescribeContinuousBackups", e.into_service_error()))?;

    let already_enabled = output
        .continuous_backups_description()
        .and_then(|d| d.point_in_time_recovery_description())
        .and_then(|d| d.point_in_time_recovery_status())
        .map(|status| {
            matches!(
                status,
                aws_sdk_dynamodb::types::PointInTimeRecoveryStatus::Enabled
            )
        })
        .unwrap_or(false);

    if already_enabled {
        return Ok(());
    }

    let spec = PointInTimeRecoverySpecification::builder()
        .point_in_time_recovery_enabled(true)
        .build()
        .map_err(|e| table_error(table, "UpdateContinuousBackups", e))?;

    for _ in 0..READINESS_ATTEMPTS {
        match client
            .update_continuous_backups()
            .table_name(table)
            .point_in_time_recovery_specification(spec.clone())
            .send()
            .await
        {
            Ok(_) => {
                info!(table = %table, "Enabled point-in-time recovery");
                return Ok(());
            }
            Err(err) => {
                let service = err.into_service_error();
                if !service.is_continuous_backups_unavailable_exception() {
                    return Err(table_error(table, "UpdateContinuousBackups", service));
                }
                info!(table = %table, "Waiting for continuous backups to become available");
                tokio::time::sleep(READINESS_POLL).await;
            }
        }
    }

    Err(table_error(
        table,
        "UpdateContinuousBackups",
        "continuous backups did not become available",
    ))
}

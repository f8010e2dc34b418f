//! DynamoDB event store.
//!
//! Item schema:
//! - hash key `key`: aggregate id (String)
//! - range key `partition`: shard index (Number)
//! - event attributes `_{version}`: opaque payload (Binary)
//!
//! Up to `events_per_item` records are packed into one item; shard
//! membership is a pure function of version, independent of write order.

use std::collections::{BTreeMap, HashMap};

use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{AttributeValue, Select};
use aws_sdk_dynamodb::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{StoreError, ValidationError};
use crate::record::{History, Record};

pub mod infra;
pub mod key;

/// Hash key attribute name: the aggregate id.
pub const HASH_KEY: &str = "key";

/// Range key attribute name: the shard index.
pub const RANGE_KEY: &str = "partition";

/// Connection and packing configuration for [`Store`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backing table name.
    pub table: String,
    /// Records packed per physical item (default: 1).
    pub events_per_item: u64,
    /// AWS region. Uses the default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for dynamodb-local or testing).
    pub endpoint_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table: String::new(),
            events_per_item: 1,
            region: None,
            endpoint_url: None,
        }
    }
}

impl StoreConfig {
    /// Create a config for a table with default packing.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Set the number of records packed per item.
    pub fn with_events_per_item(mut self, events_per_item: u64) -> Self {
        self.events_per_item = events_per_item;
        self
    }

    /// Set the AWS region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set a custom endpoint URL (for dynamodb-local or testing).
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }
}

/// Event store over one DynamoDB table.
pub struct Store {
    client: Client,
    table: String,
    events_per_item: u64,
}

impl Store {
    /// Create a store over an existing client.
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            events_per_item: 1,
        }
    }

    /// Set the number of records packed per item. Values below 1 are
    /// clamped to 1.
    pub fn with_events_per_item(mut self, events_per_item: u64) -> Self {
        self.events_per_item = events_per_item.max(1);
        self
    }

    /// Connect using the default AWS provider chain plus any overrides in
    /// the config.
    pub async fn connect(config: &StoreConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }

        let shared = loader.load().await;

        let client = if let Some(ref endpoint) = config.endpoint_url {
            let conf = aws_sdk_dynamodb::config::Builder::from(&shared)
                .endpoint_url(endpoint)
                .build();
            Client::from_conf(conf)
        } else {
            Client::new(&shared)
        };

        info!(table = %config.table, events_per_item = config.events_per_item, "Connected to DynamoDB event store");

        Self {
            client,
            table: config.table.clone(),
            events_per_item: config.events_per_item.max(1),
        }
    }

    /// The backing table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Append records to an aggregate's history.
    ///
    /// An empty record list is a no-op success. Records are grouped by
    /// shard; each shard receives one conditional write that creates the
    /// item if absent and otherwise only accepts attributes whose stored
    /// payload is byte-equal to the proposed one (so re-saving an
    /// identical history is idempotent). A differing payload at an
    /// existing version fails the call with [`StoreError::Conflict`].
    ///
    /// Shard writes are independent: a save spanning multiple shards that
    /// conflicts on a later shard leaves earlier shards written. There is
    /// no cross-shard atomicity.
    pub async fn save(&self, aggregate_id: &str, records: &[Record]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        for (shard, group) in group_by_shard(records, self.events_per_item) {
            let (update, condition) = update_expressions(&group);

            let mut request = self
                .client
                .update_item()
                .table_name(&self.table)
                .key(HASH_KEY, AttributeValue::S(aggregate_id.to_string()))
                .key(RANGE_KEY, AttributeValue::N(shard.to_string()))
                .update_expression(update)
                .condition_expression(condition);

            for record in &group {
                let name = key::key(record.version);
                request = request
                    .expression_attribute_names(format!("#{name}"), &name)
                    .expression_attribute_values(
                        format!(":{name}"),
                        AttributeValue::B(Blob::new(record.data.clone())),
                    );
            }

            request.send().await.map_err(|err| {
                let service = err.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    StoreError::Conflict {
                        aggregate_id: aggregate_id.to_string(),
                    }
                } else {
                    StoreError::Table {
                        operation: "UpdateItem",
                        table: self.table.clone(),
                        message: service.to_string(),
                    }
                }
            })?;

            debug!(
                aggregate_id = %aggregate_id,
                shard = shard,
                count = group.len(),
                "Saved records"
            );
        }

        Ok(())
    }

    /// Load an aggregate's history in ascending version order.
    ///
    /// `from_version == 0` reads from the beginning; `limit == 0` is
    /// unbounded. An aggregate with no records yields an empty history,
    /// not an error.
    pub async fn load(
        &self,
        aggregate_id: &str,
        from_version: u64,
        limit: usize,
    ) -> Result<History, StoreError> {
        let from_shard = key::shard_index(from_version, self.events_per_item);

        let mut history = History::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let output = self
                .client
                .query()
                .table_name(&self.table)
                .select(Select::AllAttributes)
                .key_condition_expression("#key = :key AND #partition >= :partition")
                .expression_attribute_names("#key", HASH_KEY)
                .expression_attribute_names("#partition", RANGE_KEY)
                .expression_attribute_values(":key", AttributeValue::S(aggregate_id.to_string()))
                .expression_attribute_values(":partition", AttributeValue::N(from_shard.to_string()))
                .consistent_read(true)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|err| StoreError::Table {
                    operation: "Query",
                    table: self.table.clone(),
                    message: err.into_service_error().to_string(),
                })?;

            for item in output.items() {
                history.extend(decode_item(item)?);
            }

            start_key = output.last_evaluated_key().cloned();
            if start_key.is_none() {
                break;
            }
        }

        if from_version > 0 {
            history.retain(|record| record.version >= from_version);
        }
        history.sort_by_key(|record| record.version);
        if limit > 0 {
            history.truncate(limit);
        }

        debug!(
            aggregate_id = %aggregate_id,
            from_version = from_version,
            count = history.len(),
            "Loaded history"
        );

        Ok(history)
    }
}

/// Group records by target shard, ascending.
fn group_by_shard(records: &[Record], events_per_item: u64) -> BTreeMap<u64, Vec<&Record>> {
    let mut shards: BTreeMap<u64, Vec<&Record>> = BTreeMap::new();
    for record in records {
        shards
            .entry(key::shard_index(record.version, events_per_item))
            .or_default()
            .push(record);
    }
    shards
}

/// Build the SET and condition expressions for one shard's write.
///
/// Each attribute is written only when absent or already byte-equal:
/// `(attribute_not_exists(#_v) OR #_v = :_v)`.
fn update_expressions(records: &[&Record]) -> (String, String) {
    let mut sets = Vec::with_capacity(records.len());
    let mut conditions = Vec::with_capacity(records.len());

    for record in records {
        let name = key::key(record.version);
        sets.push(format!("#{name} = :{name}"));
        conditions.push(format!(
            "(attribute_not_exists(#{name}) OR #{name} = :{name})"
        ));
    }

    (format!("SET {}", sets.join(", ")), conditions.join(" AND "))
}

/// Decode one item's event attributes into records. Non-event attributes
/// (the key schema among them) are skipped.
fn decode_item(item: &HashMap<String, AttributeValue>) -> Result<Vec<Record>, ValidationError> {
    let mut records = Vec::new();

    for (name, value) in item {
        if !key::is_event_key(name) {
            continue;
        }

        let version = key::version_from_key(name)?;
        let data = value
            .as_b()
            .map_err(|_| ValidationError::NotBinary(name.clone()))?;

        records.push(Record {
            version,
            data: data.as_ref().to_vec(),
        });
    }

    Ok(records)
}

//! Tag-change watcher.
//!
//! Consumes CloudTrail tag-mutation events for tables and wires the
//! change-capture stream of any table carrying the core marker tag to the
//! routing function, by creating an event source mapping. Untag events and
//! unrelated mutations are ignored.

use aws_sdk_lambda::types::EventSourcePosition;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::tags;

/// Errors from wiring a table's stream to the routing function.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("unable to describe table {table}: {message}")]
    Describe { table: String, message: String },

    #[error("unable to attach function to stream {stream_arn}: {message}")]
    Attach { stream_arn: String, message: String },
}

/// One tag key/value pair from the event detail.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TagPair {
    pub key: String,
    pub value: String,
}

/// Request parameters of a TagResource/UntagResource call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagRequest {
    pub resource_arn: String,
    /// Keys being removed (UntagResource).
    pub tag_keys: Vec<String>,
    /// Pairs being added (TagResource).
    pub tags: Vec<TagPair>,
}

/// The detail payload of a table tag-mutation event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagChangeEvent {
    pub event_source: String,
    pub event_time: String,
    pub event_name: String,
    pub error_code: String,
    pub error_message: String,
    pub request_parameters: TagRequest,
}

/// Attaches the routing function to tagged tables' streams.
pub struct Watcher {
    dynamodb: aws_sdk_dynamodb::Client,
    lambda: aws_sdk_lambda::Client,
    function_name: String,
}

impl Watcher {
    pub fn new(
        dynamodb: aws_sdk_dynamodb::Client,
        lambda: aws_sdk_lambda::Client,
        function_name: impl Into<String>,
    ) -> Self {
        Self {
            dynamodb,
            lambda,
            function_name: function_name.into(),
        }
    }

    /// Handle one tag-mutation event. Failed API calls recorded in the
    /// event itself are skipped, not retried.
    pub async fn handle(&self, event: &TagChangeEvent) -> Result<(), WatcherError> {
        if !event.error_code.is_empty() {
            warn!(
                event_name = %event.event_name,
                error_code = %event.error_code,
                "Ignoring failed tag mutation"
            );
            return Ok(());
        }

        match event.event_name.as_str() {
            "TagResource" => self.handle_tag(&event.request_parameters).await,
            "UntagResource" => {
                // Removing the marker leaves any existing mapping in
                // place; dispatchers simply resolve to zero sinks.
                debug!(resource_arn = %event.request_parameters.resource_arn, "Ignoring untag");
                Ok(())
            }
            other => {
                debug!(event_name = %other, "Ignoring table event");
                Ok(())
            }
        }
    }

    async fn handle_tag(&self, request: &TagRequest) -> Result<(), WatcherError> {
        if !request.tags.iter().any(|tag| tag.key == tags::CORE) {
            return Ok(());
        }

        let table = table_name_from_arn(&request.resource_arn);
        let Some(stream_arn) = self.lookup_stream_arn(table).await? else {
            info!(table = %table, "Streams not enabled for table");
            return Ok(());
        };

        self.attach_function(&stream_arn).await
    }

    async fn lookup_stream_arn(&self, table: &str) -> Result<Option<String>, WatcherError> {
        let output = self
            .dynamodb
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| WatcherError::Describe {
                table: table.to_string(),
                message: e.into_service_error().to_string(),
            })?;

        Ok(output
            .table()
            .and_then(|t| t.latest_stream_arn())
            .map(|arn| arn.to_string()))
    }

    async fn attach_function(&self, stream_arn: &str) -> Result<(), WatcherError> {
        let result = self
            .lambda
            .create_event_source_mapping()
            .event_source_arn(stream_arn)
            .function_name(&self.function_name)
            .starting_position(EventSourcePosition::Latest)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(
                    stream_arn = %stream_arn,
                    function = %self.function_name,
                    "Attached function to stream"
                );
                Ok(())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                // Already mapped.
                if service_error.is_resource_conflict_exception() {
                    debug!(stream_arn = %stream_arn, "Mapping already exists");
                    return Ok(());
                }
                Err(WatcherError::Attach {
                    stream_arn: stream_arn.to_string(),
                    message: service_error.to_string(),
                })
            }
        }
    }
}

/// Last segment of a table ARN.
fn table_name_from_arn(resource_arn: &str) -> &str {
    resource_arn
        .rsplit('/')
        .next()
        .unwrap_or(resource_arn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_is_last_arn_segment() {
        assert_eq!(
            table_name_from_arn("arn:aws:dynamodb:us-west-2:1:table/orders"),
            "orders"
        );
        assert_eq!(table_name_from_arn("orders"), "orders");
    }

    #[test]
    fn decodes_tag_resource_detail() {
        let detail = r#"{
            "eventSource": "dynamodb.amazonaws.com",
            "eventTime": "2017-03-14T04:49:34Z",
            "eventName": "TagResource",
            "requestParameters": {
                "resourceArn": "arn:aws:dynamodb:us-west-2:1:table/orders",
                "tags": [{"key": "eventsource", "value": ""}]
            }
        }"#;

        let event: TagChangeEvent = serde_json::from_str(detail).unwrap();
        assert_eq!(event.event_name, "TagResource");
        assert!(event.error_code.is_empty());
        assert_eq!(
            event.request_parameters.resource_arn,
            "arn:aws:dynamodb:us-west-2:1:table/orders"
        );
        assert_eq!(
            event.request_parameters.tags,
            vec![TagPair {
                key: "eventsource".to_string(),
                value: String::new(),
            }]
        );
    }

    #[test]
    fn decodes_untag_resource_detail() {
        let detail = r#"{
            "eventSource": "dynamodb.amazonaws.com",
            "eventTime": "2017-03-14T04:49:34Z",
            "eventName": "UntagResource",
            "requestParameters": {
                "resourceArn": "arn:aws:dynamodb:us-west-2:1:table/orders",
                "tagKeys": ["eventsource"]
            }
        }"#;

        let event: TagChangeEvent = serde_json::from_str(detail).unwrap();
        assert_eq!(event.event_name, "UntagResource");
        assert_eq!(event.request_parameters.tag_keys, vec!["eventsource"]);
        assert!(event.request_parameters.tags.is_empty());
    }

    #[test]
    fn decode_tolerates_error_fields() {
        let detail = r#"{
            "eventName": "TagResource",
            "errorCode": "AccessDenied",
            "errorMessage": "nope"
        }"#;

        let event: TagChangeEvent = serde_json::from_str(detail).unwrap();
        assert_eq!(event.error_code, "AccessDenied");
    }
}

//! Table tag vocabulary driving fan-out wiring.
//!
//! A table is marked as event-sourced with [`CORE`]; each sink kind reads
//! its own value-bearing tag. List values are [`SEPARATOR`]-joined.

/// Marker tag identifying a table as event-sourced.
pub const CORE: &str = "eventsource";

/// Tag holding the comma-joined list of queue names to deliver to.
pub const SQS: &str = "eventsource:sqs";

/// Tag holding the comma-joined list of topic names to publish to.
pub const SNS: &str = "eventsource:sns";

/// Tag holding `{streamName},{bucket}` for the batch uploader.
pub const FIREHOSE: &str = "eventsource:firehose";

/// Delimiter used within tag values.
pub const SEPARATOR: &str = ",";

/// One `(key, value)` tag on the backing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Find the trimmed value of a tag by key, if present.
pub fn find_value<'a>(tags: &'a [Tag], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|tag| tag.key == key)
        .map(|tag| tag.value.trim())
}

/// Split a separator-joined tag value into trimmed, non-empty names.
pub fn split_names(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(SEPARATOR)
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

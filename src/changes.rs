//! Change extraction from table stream notifications.
//!
//! A change notification carries before/after attribute snapshots of one
//! item. A key present in the after image but not the before image is a
//! newly appended event; key presence alone determines novelty.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;

use crate::error::ValidationError;
use crate::record::Record;
use crate::store::key;

/// One item snapshot as delivered by the change-capture stream.
pub type Image = HashMap<String, AttributeValue>;

/// Extract the ordered list of newly appended records from a before/after
/// snapshot pair. Never returns an absent result: no new keys yields an
/// empty vec. A missing before image behaves as an empty key set; a
/// missing after image yields nothing to extract.
pub fn changes(
    old_image: Option<&Image>,
    new_image: Option<&Image>,
) -> Result<Vec<Record>, ValidationError> {
    let Some(new_image) = new_image else {
        return Ok(Vec::new());
    };

    let mut records = Vec::new();

    for (name, value) in new_image {
        if !key::is_event_key(name) {
            continue;
        }
        if old_image.is_some_and(|old| old.contains_key(name)) {
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

    records.sort_by_key(|record| record.version);
    Ok(records)
}

/// Extract the table name from a stream event source ARN.
///
/// `arn:aws:dynamodb:us-west-2:…:table/{name}/stream/{suffix}` -> `{name}`.
pub fn table_name(event_source_arn: &str) -> Result<&str, ValidationError> {
    let mut segments = event_source_arn.split('/');
    let _head = segments.next();
    segments
        .next()
        .ok_or_else(|| ValidationError::InvalidEventSource(event_source_arn.to_string()))
}

/// Strip the trailing `/stream/{suffix}` from a stream event source ARN,
/// leaving the table ARN. Returns the input unchanged when no stream
/// suffix is present.
pub fn table_arn(event_source_arn: &str) -> &str {
    if let Some(idx) = event_source_arn.rfind("/stream/") {
        let suffix = &event_source_arn[idx + "/stream/".len()..];
        if !suffix.is_empty() && !suffix.contains('/') {
            return &event_source_arn[..idx];
        }
    }
    event_source_arn
}

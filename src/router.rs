//! Routing of change-capture stream batches to per-table dispatchers.
//!
//! Each notification names its origin table through the event source ARN;
//! the router resolves that table's dispatcher, extracts the newly
//! appended records from the before/after images, and hands them to the
//! sinks. Batches are processed in order and abort on the first failure,
//! leaving redelivery to the stream's own retry.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::changes::{self, Image};
use crate::error::{RouterError, ValidationError};
use crate::producer::DispatcherCache;
use crate::store::HASH_KEY;

/// One item-level change as delivered by the capture stream.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    /// Stream ARN of the originating table.
    pub event_source_arn: String,
    /// Key attributes of the changed item.
    pub keys: Image,
    /// Item snapshot before the change, absent on insert.
    pub old_image: Option<Image>,
    /// Item snapshot after the change, absent on remove.
    pub new_image: Option<Image>,
}

/// Fans stream notifications out to each table's resolved sinks.
pub struct Router {
    cache: Arc<DispatcherCache>,
}

impl Router {
    pub fn new(cache: Arc<DispatcherCache>) -> Self {
        Self { cache }
    }

    /// Route a batch of notifications in order, aborting on the first
    /// failure so the stream redelivers from that point.
    pub async fn handle(&self, notifications: &[ChangeNotification]) -> Result<(), RouterError> {
        for notification in notifications {
            self.handle_one(notification).await?;
        }
        Ok(())
    }

    async fn handle_one(&self, notification: &ChangeNotification) -> Result<(), RouterError> {
        let table_arn = changes::table_arn(&notification.event_source_arn);

        let aggregate_id = notification
            .keys
            .get(HASH_KEY)
            .and_then(|value| value.as_s().ok())
            .ok_or_else(|| ValidationError::MissingHashKey(HASH_KEY.to_string()))?;

        let records = changes::changes(
            notification.old_image.as_ref(),
            notification.new_image.as_ref(),
        )?;

        if records.is_empty() {
            warn!(
                table_arn = %table_arn,
                aggregate_id = %aggregate_id,
                "Notification carried no new records"
            );
        }

        let dispatcher = self.cache.resolve(table_arn).await?;
        dispatcher.send(aggregate_id, &records).await?;

        debug!(
            table_arn = %table_arn,
            aggregate_id = %aggregate_id,
            records = records.len(),
            sinks = dispatcher.len(),
            "Routed notification"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_dynamodb::primitives::Blob;
    use aws_sdk_dynamodb::types::AttributeValue;

    use crate::producer::{MockSinkFactory, SinkRegistry, StaticTableTags};
    use crate::record::Record;
    use crate::tags::Tag;

    const STREAM_ARN: &str =
        "arn:aws:dynamodb:us-west-2:1:table/orders/stream/2017-03-14T04:49:34.930";

    fn keys(aggregate_id: &str) -> Image {
        let mut keys = Image::new();
        keys.insert(
            HASH_KEY.to_string(),
            AttributeValue::S(aggregate_id.to_string()),
        );
        keys.insert("partition".to_string(), AttributeValue::N("0".to_string()));
        keys
    }

    fn image(pairs: &[(&str, &[u8])]) -> Image {
        pairs
            .iter()
            .map(|(name, data)| {
                (
                    name.to_string(),
                    AttributeValue::B(Blob::new(data.to_vec())),
                )
            })
            .collect()
    }

    fn build_router(factory: MockSinkFactory) -> Router {
        let cache = DispatcherCache::new(
            Arc::new(StaticTableTags::new(vec![Tag::new("eventsource", "")])),
            SinkRegistry::new().register(factory),
        );
        Router::new(Arc::new(cache))
    }

    #[tokio::test]
    async fn routes_new_records_to_sinks() {
        let factory = MockSinkFactory::new(vec!["q"]);
        let sink = factory.sinks()[0].clone();
        let router = build_router(factory);

        let notification = ChangeNotification {
            event_source_arn: STREAM_ARN.to_string(),
            keys: keys("abc"),
            old_image: Some(image(&[("_1", b"a")])),
            new_image: Some(image(&[("_1", b"a"), ("_2", b"b")])),
        };

        router.handle(&[notification]).await.unwrap();

        let calls = sink.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "abc");
        assert_eq!(calls[0].1, vec![Record::new(2, b"b".to_vec())]);
    }

    #[tokio::test]
    async fn empty_extraction_still_reaches_sinks() {
        let factory = MockSinkFactory::new(vec!["q"]);
        let sink = factory.sinks()[0].clone();
        let router = build_router(factory);

        let notification = ChangeNotification {
            event_source_arn: STREAM_ARN.to_string(),
            keys: keys("abc"),
            old_image: Some(image(&[("_1", b"a")])),
            new_image: Some(image(&[("_1", b"a")])),
        };

        router.handle(&[notification]).await.unwrap();

        let calls = sink.calls().await;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.is_empty());
    }

    #[tokio::test]
    async fn missing_hash_key_is_a_validation_error() {
        let router = build_router(MockSinkFactory::new(vec!["q"]));

        let notification = ChangeNotification {
            event_source_arn: STREAM_ARN.to_string(),
            keys: Image::new(),
            old_image: None,
            new_image: Some(image(&[("_1", b"a")])),
        };

        let err = router.handle(&[notification]).await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::Validation(ValidationError::MissingHashKey(_))
        ));
    }

    #[tokio::test]
    async fn batch_aborts_on_first_failure() {
        let factory = MockSinkFactory::new(vec!["q"]);
        let sink = factory.sinks()[0].clone();
        let router = build_router(factory);

        let good = ChangeNotification {
            event_source_arn: STREAM_ARN.to_string(),
            keys: keys("abc"),
            old_image: None,
            new_image: Some(image(&[("_1", b"a")])),
        };
        let bad = ChangeNotification {
            event_source_arn: STREAM_ARN.to_string(),
            keys: Image::new(),
            old_image: None,
            new_image: Some(image(&[("_2", b"b")])),
        };
        let unreached = ChangeNotification {
            event_source_arn: STREAM_ARN.to_string(),
            keys: keys("def"),
            old_image: None,
            new_image: Some(image(&[("_1", b"c")])),
        };

        router.handle(&[good, bad, unreached]).await.unwrap_err();

        let calls = sink.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "abc");
    }
}

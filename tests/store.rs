//! Event store integration tests against dynamodb-local.
//!
//! Gated on `DYNAMODB_ENDPOINT`; each test is a no-op when the variable
//! is unset. Run with e.g.
//!
//! ```text
//! DYNAMODB_ENDPOINT=http://localhost:8000 cargo test --test store
//! ```

use aws_sdk_dynamodb::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_dynamodb::Client;
use uuid::Uuid;

use eventsource_dynamo::store::infra::{create_table_if_not_exists, CreateTableOptions};
use eventsource_dynamo::{Record, Store, StoreError};

fn endpoint() -> Option<String> {
    std::env::var("DYNAMODB_ENDPOINT").ok()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn local_client(endpoint: &str) -> Client {
    let conf = aws_sdk_dynamodb::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .endpoint_url(endpoint)
        .region(Region::new("us-west-2"))
        .credentials_provider(Credentials::new("local", "local", None, None, "static"))
        .build();
    Client::from_conf(conf)
}

async fn fresh_store(endpoint: &str, events_per_item: u64) -> Store {
    init_tracing();
    let client = local_client(endpoint);
    let table = format!("events-{}", Uuid::new_v4().simple());

    create_table_if_not_exists(
        &client,
        &table,
        &CreateTableOptions::new().with_local_endpoint(true),
    )
    .await
    .unwrap();

    Store::new(client, table).with_events_per_item(events_per_item)
}

fn history(count: u64) -> Vec<Record> {
    (1..=count)
        .map(|version| Record::new(version, format!("payload-{version}").into_bytes()))
        .collect()
}

#[tokio::test]
async fn save_load_round_trip() {
    let Some(endpoint) = endpoint() else { return };
    let store = fresh_store(&endpoint, 1).await;

    let records = history(3);
    store.save("abc", &records).await.unwrap();

    let loaded = store.load("abc", 0, 0).await.unwrap();
    assert_eq!(loaded, records);
}

#[tokio::test]
async fn missing_aggregate_yields_empty_history() {
    let Some(endpoint) = endpoint() else { return };
    let store = fresh_store(&endpoint, 1).await;

    let loaded = store.load("nope", 0, 0).await.unwrap();
    assert!(loaded.is_empty());
}

#[tokio::test]
async fn resaving_identical_history_is_idempotent() {
    let Some(endpoint) = endpoint() else { return };
    let store = fresh_store(&endpoint, 1).await;

    let records = history(2);
    store.save("abc", &records).await.unwrap();
    store.save("abc", &records).await.unwrap();

    let loaded = store.load("abc", 0, 0).await.unwrap();
    assert_eq!(loaded, records);
}

#[tokio::test]
async fn conflicting_payload_is_rejected_and_original_kept() {
    let Some(endpoint) = endpoint() else { return };
    let store = fresh_store(&endpoint, 1).await;

    let original = vec![Record::new(1, b"original".to_vec())];
    store.save("abc", &original).await.unwrap();

    let conflicting = vec![Record::new(1, b"rewritten".to_vec())];
    let err = store.save("abc", &conflicting).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));

    let loaded = store.load("abc", 0, 0).await.unwrap();
    assert_eq!(loaded, original);
}

#[tokio::test]
async fn load_honors_from_version_and_limit() {
    let Some(endpoint) = endpoint() else { return };
    let store = fresh_store(&endpoint, 1).await;

    let records = history(6);
    store.save("abc", &records).await.unwrap();

    let tail = store.load("abc", 4, 0).await.unwrap();
    assert_eq!(tail, records[3..]);

    let window = store.load("abc", 2, 3).await.unwrap();
    assert_eq!(window, records[1..4]);

    let head = store.load("abc", 0, 2).await.unwrap();
    assert_eq!(head, records[..2]);
}

#[tokio::test]
async fn packing_is_transparent_to_readers() {
    let Some(endpoint) = endpoint() else { return };
    let store = fresh_store(&endpoint, 2).await;

    let records = history(5);
    store.save("abc", &records).await.unwrap();

    let loaded = store.load("abc", 0, 0).await.unwrap();
    assert_eq!(loaded, records);

    let tail = store.load("abc", 4, 0).await.unwrap();
    assert_eq!(tail, records[3..]);
}

#[tokio::test]
async fn histories_are_isolated_per_aggregate() {
    let Some(endpoint) = endpoint() else { return };
    let store = fresh_store(&endpoint, 1).await;

    store.save("abc", &history(2)).await.unwrap();
    store.save("def", &[Record::new(1, b"other".to_vec())]).await.unwrap();

    let abc = store.load("abc", 0, 0).await.unwrap();
    let def = store.load("def", 0, 0).await.unwrap();
    assert_eq!(abc.len(), 2);
    assert_eq!(def, vec![Record::new(1, b"other".to_vec())]);
}

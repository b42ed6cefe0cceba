//! End-to-end runs of a source pipeline against a scripted MLS and the
//! in-memory destination.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resync_core::adapter::{DestinationAdapter, PlatformAdapter, Timestamps, UpstreamClient};
use resync_core::batch::{BatchId, BatchKind, BatchStore, DoneMode};
use resync_core::error::AppError;
use resync_core::indexes::Indexes;
use resync_core::metadata::Metadata;
use resync_core::models::{AuthToken, Credentials, MlsResource, MlsSource, Operation, Page, Record};
use resync_core::pipeline::SourcePipeline;
use resync_core::reconcile::{parse_timestamp, ListingRow};
use resync_core::scheduler::{fire, RunSlot};
use resync_db::{DestinationHooks, MemoryDestination};
use serde_json::{json, Value};
use tempfile::{NamedTempFile, TempDir};
use url::Url;

const METADATA: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<edmx:Edmx Version="4.0" xmlns:edmx="http://docs.oasis-open.org/odata/ns/edmx">
  <edmx:DataServices>
    <Schema Namespace="Odata.Models" xmlns="http://docs.oasis-open.org/odata/ns/edm">
      <EntityType Name="Property">
        <Key><PropertyRef Name="ListingKey"/></Key>
        <Property Name="ListingKey" Type="Edm.String" MaxLength="255" Nullable="false"/>
        <Property Name="ListPrice" Type="Edm.Decimal" Precision="14" Scale="2"/>
        <Property Name="ModificationTimestamp" Type="Edm.DateTimeOffset"/>
        <Property Name="PhotosChangeTimestamp" Type="Edm.DateTimeOffset"/>
        <Property Name="X_InternalNote" Type="Edm.String"/>
      </EntityType>
      <EntityType Name="Media">
        <Key><PropertyRef Name="MediaKey"/></Key>
        <Property Name="MediaKey" Type="Edm.String" Nullable="false"/>
        <Property Name="ListingKey" Type="Edm.String"/>
        <Property Name="MediaURL" Type="Edm.String"/>
        <Property Name="ModificationTimestamp" Type="Edm.DateTimeOffset"/>
      </EntityType>
    </Schema>
  </edmx:DataServices>
</edmx:Edmx>"#;

struct TestPlatform;

#[async_trait]
impl PlatformAdapter for TestPlatform {
    fn name(&self) -> &'static str {
        "test"
    }

    fn entity_namespace(&self) -> &str {
        "Odata.Models"
    }

    fn excludes_metadata_field(&self, field: &str) -> bool {
        field.starts_with("X_")
    }

    async fn fetch_auth(&self, _credentials: &Credentials) -> Result<AuthToken, AppError> {
        Ok(AuthToken {
            access_token: "token".into(),
            expires_at: DateTime::<Utc>::MAX_UTC,
        })
    }
}

/// In-memory MLS honouring `$top`, `$skip`, key filters and
/// `ModificationTimestamp gt` filters.
#[derive(Default)]
struct MockMls {
    listings: Mutex<Vec<Record>>,
    requests: Mutex<Vec<Url>>,
    /// Requests beyond this total fail with a network error.
    fail_after: Mutex<Option<usize>>,
    /// Added to every reported `@odata.count`.
    count_surplus: Mutex<u64>,
}

impl MockMls {
    /// Lets `n` more requests succeed, then fails every later one.
    fn fail_after(&self, n: usize) {
        let sent = self.requests.lock().unwrap().len();
        *self.fail_after.lock().unwrap() = Some(sent + n);
    }

    fn recover(&self) {
        *self.fail_after.lock().unwrap() = None;
    }

    fn overstate_count(&self, surplus: u64) {
        *self.count_surplus.lock().unwrap() = surplus;
    }

    fn set(&self, listings: Vec<Value>) {
        *self.listings.lock().unwrap() = listings
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect();
    }

    fn upsert(&self, listing: Value) {
        let record = listing.as_object().cloned().unwrap();
        let mut listings = self.listings.lock().unwrap();
        let key = record["ListingKey"].clone();
        listings.retain(|r| r["ListingKey"] != key);
        listings.push(record);
        listings.sort_by_key(|r| r["ListingKey"].as_str().unwrap().parse::<u32>().unwrap());
    }

    fn remove(&self, key: &str) {
        self.listings
            .lock()
            .unwrap()
            .retain(|r| r["ListingKey"] != json!(key));
    }

    fn filters(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|u| {
                u.query_pairs()
                    .find(|(k, _)| k == "$filter")
                    .map(|(_, v)| v.into_owned())
            })
            .collect()
    }

    fn collection(&self, resource: &str) -> Vec<Record> {
        let listings = self.listings.lock().unwrap();
        match resource {
            "Media" => listings
                .iter()
                .filter_map(|r| r.get("Media").and_then(Value::as_array))
                .flatten()
                .filter_map(|m| m.as_object().cloned())
                .collect(),
            _ => listings.clone(),
        }
    }
}

fn key_filter(filter: &str) -> Option<Vec<String>> {
    if !filter.contains(" eq '") {
        return None;
    }
    Some(
        filter
            .split("ListingKey eq '")
            .skip(1)
            .filter_map(|rest| rest.split('\'').next())
            .map(str::to_string)
            .collect(),
    )
}

fn changed_after(filter: &str) -> Option<DateTime<Utc>> {
    let rest = filter.split("ModificationTimestamp gt ").nth(1)?;
    let value = rest.split([' ', ')']).next()?;
    parse_timestamp(&json!(value))
}

#[async_trait]
impl UpstreamClient for MockMls {
    async fn fetch_page(&self, url: &Url, _token: &str) -> Result<Page, AppError> {
        let sent = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(url.clone());
            requests.len()
        };
        let limit = *self.fail_after.lock().unwrap();
        if limit.is_some_and(|limit| sent > limit) {
            return Err(AppError::NetworkError("connection reset".into()));
        }
        let resource = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .unwrap_or_default()
            .to_string();
        let param = |k: &str| {
            url.query_pairs()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.into_owned())
        };

        let mut records = self.collection(&resource);
        if let Some(filter) = param("$filter") {
            if let Some(keys) = key_filter(&filter) {
                records.retain(|r| keys.iter().any(|k| r["ListingKey"] == json!(k)));
            } else if let Some(after) = changed_after(&filter) {
                records.retain(|r| {
                    r.get("ModificationTimestamp")
                        .and_then(parse_timestamp)
                        .is_some_and(|t| t > after)
                });
            }
        }

        let total = records.len() as u64 + *self.count_surplus.lock().unwrap();
        let top = param("$top").and_then(|v| v.parse().ok()).unwrap_or(usize::MAX);
        let skip = param("$skip").and_then(|v| v.parse().ok()).unwrap_or(0);
        Ok(Page {
            value: records.into_iter().skip(skip).take(top).collect(),
            next_link: None,
            count: Some(total),
        })
    }

    async fn fetch_metadata(&self, _url: &Url, _token: &str) -> Result<String, AppError> {
        Ok(METADATA.to_string())
    }
}

/// Memory destination whose writes can be switched to fail.
struct FlakyDestination {
    inner: Arc<MemoryDestination>,
    fail_writes: AtomicBool,
}

impl FlakyDestination {
    fn new(inner: Arc<MemoryDestination>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DestinationAdapter for FlakyDestination {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn sync_structure(
        &self,
        resource: &MlsResource,
        indexes: &Indexes,
        metadata: &Metadata,
    ) -> Result<(), AppError> {
        self.inner.sync_structure(resource, indexes, metadata).await
    }

    async fn sync_data(
        &self,
        resource: &MlsResource,
        indexes: &Indexes,
        records: Vec<Record>,
        metadata: &Metadata,
    ) -> Result<usize, AppError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Generic("disk full".into()));
        }
        self.inner.sync_data(resource, indexes, records, metadata).await
    }

    async fn get_timestamps(&self, resource: &str, indexes: &Indexes) -> Result<Timestamps, AppError> {
        self.inner.get_timestamps(resource, indexes).await
    }

    async fn get_all_ids(&self, resource: &str, indexes: &Indexes) -> Result<Vec<String>, AppError> {
        self.inner.get_all_ids(resource, indexes).await
    }

    async fn get_count(&self, resource: &str) -> Result<u64, AppError> {
        self.inner.get_count(resource).await
    }

    async fn get_most_recent_timestamp(&self, resource: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        self.inner.get_most_recent_timestamp(resource).await
    }

    async fn fetch_missing_ids_data(
        &self,
        resource: &str,
        indexes: &Indexes,
    ) -> Result<Vec<ListingRow>, AppError> {
        self.inner.fetch_missing_ids_data(resource, indexes).await
    }

    async fn purge(
        &self,
        resource: &MlsResource,
        parent_key: &str,
        ids: &[String],
    ) -> Result<u64, AppError> {
        self.inner.purge(resource, parent_key, ids).await
    }

    async fn close_connection(&self) -> Result<(), AppError> {
        self.inner.close_connection().await
    }

    fn transform(&self, resource: &str, record: Record, metadata: &Metadata) -> Record {
        self.inner.transform(resource, record, metadata)
    }
}

fn listing(key: &str, minute: u32, price: u32) -> Value {
    json!({
        "ListingKey": key,
        "ListPrice": price,
        "ModificationTimestamp": format!("2024-01-01T00:{:02}:00Z", minute),
        "X_InternalNote": "not for storage",
        "Media": [
            {
                "MediaKey": format!("{}-photo", key),
                "ListingKey": key,
                "MediaURL": format!("https://photos.test/{}.jpg", key),
                "ModificationTimestamp": format!("2024-01-01T00:{:02}:00Z", minute),
            }
        ],
    })
}

struct Harness {
    mls: Arc<MockMls>,
    memory: Arc<MemoryDestination>,
    flaky: Arc<FlakyDestination>,
    store: BatchStore,
    pipeline: SourcePipeline,
    _data: TempDir,
    _metadata: NamedTempFile,
}

fn harness(top: usize) -> Harness {
    let mut metadata = NamedTempFile::new().unwrap();
    metadata.write_all(METADATA.as_bytes()).unwrap();
    let data = TempDir::new().unwrap();

    let source: MlsSource = serde_json::from_value(json!({
        "name": "testmls",
        "platform": "test",
        "metadata_path": metadata.path(),
        "resource_endpoint": "https://mls.test/odata/{resource}",
        "top": top,
        "top_for_purge": top,
        "resources": [
            {
                "name": "Property",
                "expand": [
                    { "field_name": "Media", "name": "Media", "purge_from_parent": true }
                ]
            }
        ]
    }))
    .unwrap();

    let mls = Arc::new(MockMls::default());
    let platform: Arc<dyn PlatformAdapter> = Arc::new(TestPlatform);
    let memory = Arc::new(MemoryDestination::new(
        "mem",
        DestinationHooks::default(),
        platform.clone(),
    ));
    let flaky = Arc::new(FlakyDestination::new(memory.clone()));
    let store = BatchStore::new(data.path(), DoneMode::Move);
    let pipeline = SourcePipeline::new(
        source,
        mls.clone(),
        platform,
        vec![flaky.clone() as Arc<dyn DestinationAdapter>],
        store.clone(),
    )
    .unwrap();

    Harness {
        mls,
        memory,
        flaky,
        store,
        pipeline,
        _data: data,
        _metadata: metadata,
    }
}

async fn pending_batches(h: &Harness, resource: &str, kind: BatchKind) -> usize {
    h.store.list("testmls", resource, kind).await.unwrap().len()
}

fn five_listings() -> Vec<Value> {
    (1..=5)
        .map(|i| listing(&i.to_string(), i * 5, 100_000 + i))
        .collect()
}

#[tokio::test]
async fn test_sync_pages_into_batches_and_loads_everything() {
    let h = harness(2);
    h.mls.set(five_listings());

    let stats = h.pipeline.sync().await.unwrap();
    let property = stats.resources["Property"];
    assert_eq!(property.pages_fetched, 3);
    assert_eq!(property.batches_applied, 3);
    assert_eq!(property.records_loaded, 5);

    assert_eq!(h.memory.keys("Property").await, vec!["1", "2", "3", "4", "5"]);
    assert_eq!(h.memory.keys("Media").await.len(), 5);
    assert!(h
        .store
        .list("testmls", "Property", BatchKind::Sync)
        .await
        .unwrap()
        .is_empty());
    assert!(h
        .store
        .list("testmls", "Media", BatchKind::Sync)
        .await
        .unwrap()
        .is_empty());

    let stored = h.memory.record("Property", "3").await.unwrap();
    assert_eq!(stored["ModificationTimestamp"], json!("2024-01-01T00:15:00.000Z"));
    assert!(!stored.contains_key("X_InternalNote"));
    assert!(!stored.contains_key("Media"));
    assert!(!h
        .memory
        .columns("Property")
        .await
        .contains(&"X_InternalNote".to_string()));
}

#[tokio::test]
async fn test_second_sync_only_fetches_changes() {
    let h = harness(2);
    h.mls.set(five_listings());
    h.pipeline.sync().await.unwrap();

    let stats = h.pipeline.sync().await.unwrap();
    assert_eq!(stats.resources["Property"].records_loaded, 0);
    let last = h.mls.filters().pop().unwrap();
    assert!(last.contains("ModificationTimestamp gt 2024-01-01T00:25:00.000Z"), "{last}");

    h.mls.upsert(listing("2", 40, 123_456));
    let stats = h.pipeline.sync().await.unwrap();
    assert_eq!(stats.resources["Property"].records_loaded, 1);
    let stored = h.memory.record("Property", "2").await.unwrap();
    assert_eq!(stored["ListPrice"], json!(123_456));
    assert_eq!(h.memory.keys("Property").await.len(), 5);
}

#[tokio::test]
async fn test_leftover_batches_are_reapplied_idempotently() {
    let h = harness(2);
    h.mls.set(five_listings());
    h.pipeline.sync().await.unwrap();

    // A crash after the upsert but before the batch was marked done leaves
    // the same records pending again.
    let replay = Page {
        value: five_listings()
            .into_iter()
            .take(2)
            .map(|mut v| {
                v.as_object_mut().unwrap().remove("Media");
                v.as_object().cloned().unwrap()
            })
            .collect(),
        next_link: None,
        count: None,
    };
    let old = BatchId::from_time(
        DateTime::parse_from_rfc3339("2023-12-31T23:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
    );
    h.store
        .write("testmls", "Property", BatchKind::Sync, &old, 1, &replay)
        .await
        .unwrap();

    let stats = h.pipeline.sync().await.unwrap();
    // The replayed batch; the incremental pass finds nothing new.
    assert_eq!(stats.resources["Property"].batches_applied, 1);
    assert_eq!(h.memory.keys("Property").await, vec!["1", "2", "3", "4", "5"]);
    assert!(h
        .store
        .list("testmls", "Property", BatchKind::Sync)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_purge_removes_vanished_listings_and_their_media() {
    let h = harness(2);
    h.mls.set(five_listings());
    h.pipeline.sync().await.unwrap();

    h.mls.remove("3");
    let stats = h.pipeline.purge().await.unwrap();
    assert_eq!(stats.resources["Property"].ids_purged, 1);
    assert_eq!(h.memory.keys("Property").await, vec!["1", "2", "4", "5"]);
    assert!(!h
        .memory
        .keys("Media")
        .await
        .contains(&"3-photo".to_string()));
    assert_eq!(h.memory.keys("Media").await.len(), 4);
    assert!(h
        .store
        .list("testmls", "Property", BatchKind::Purge)
        .await
        .unwrap()
        .is_empty());

    let stats = h.pipeline.purge().await.unwrap();
    assert_eq!(stats.total().ids_purged, 0);
}

#[tokio::test]
async fn test_reconcile_flags_missing_and_stale_keys_for_next_sync() {
    let h = harness(2);
    h.mls.set(five_listings());
    h.pipeline.sync().await.unwrap();

    // Key 6 predates the high-water mark, so an incremental sync never sees it.
    h.mls.upsert(listing("6", 1, 600_000));
    // Key 2 went stale at the destination.
    let mut stale = h.memory.record("Property", "2").await.unwrap();
    stale.insert("ModificationTimestamp".into(), json!("2023-06-01T00:00:00.000Z"));
    stale.insert("ListPrice".into(), json!(1));
    h.memory.insert("Property", "2", stale).await;

    let stats = h.pipeline.reconcile().await.unwrap();
    assert_eq!(stats.resources["Property"].ids_flagged, 2);
    assert_eq!(h.pipeline.pending_reconcile_ids("Property").await, vec!["2", "6"]);

    h.pipeline.sync().await.unwrap();
    assert!(h
        .mls
        .filters()
        .iter()
        .any(|f| f == "(ListingKey eq '2' or ListingKey eq '6')"));
    assert_eq!(h.memory.keys("Property").await, vec!["1", "2", "3", "4", "5", "6"]);
    assert_eq!(
        h.memory.record("Property", "2").await.unwrap()["ListPrice"],
        json!(100_002)
    );
    assert!(h.pipeline.pending_reconcile_ids("Property").await.is_empty());
}

#[tokio::test]
async fn test_snapshot_reports_counts() {
    let h = harness(10);
    h.mls.set(five_listings());
    h.pipeline.sync().await.unwrap();

    let snapshot = h.pipeline.snapshot().await.unwrap();
    let property = snapshot.iter().find(|s| s.resource == "Property").unwrap();
    assert_eq!(property.destination, "mem");
    assert_eq!(property.count, 5);
    assert_eq!(
        property.most_recent,
        parse_timestamp(&json!("2024-01-01T00:25:00Z"))
    );

    let check = h.pipeline.check().await.unwrap();
    assert_eq!(check.get("Property"), Some(&true));
    assert_eq!(check.get("Media"), Some(&true));
}

#[tokio::test]
async fn test_failed_destination_write_leaves_batches_pending() {
    let h = harness(2);
    h.mls.set(five_listings());
    h.flaky.fail_writes(true);

    let err = h.pipeline.sync().await.unwrap_err();
    assert!(err.to_string().contains("disk full"), "{err}");
    assert!(h.memory.keys("Property").await.is_empty());
    assert_eq!(pending_batches(&h, "Property", BatchKind::Sync).await, 3);
    assert_eq!(pending_batches(&h, "Media", BatchKind::Sync).await, 3);

    h.flaky.fail_writes(false);
    let stats = h.pipeline.sync().await.unwrap();
    assert_eq!(stats.resources["Property"].batches_applied, 3);
    assert_eq!(stats.resources["Property"].records_loaded, 5);
    assert_eq!(h.memory.keys("Property").await, vec!["1", "2", "3", "4", "5"]);
    assert_eq!(pending_batches(&h, "Property", BatchKind::Sync).await, 0);
    assert_eq!(pending_batches(&h, "Media", BatchKind::Sync).await, 0);
}

#[tokio::test]
async fn test_upstream_failure_mid_pagination_keeps_batches_and_flagged_keys() {
    let h = harness(2);
    h.mls.set(five_listings());
    h.pipeline.sync().await.unwrap();

    h.mls.upsert(listing("6", 1, 600_000));
    h.mls.upsert(listing("7", 2, 700_000));
    h.pipeline.reconcile().await.unwrap();
    assert_eq!(h.pipeline.pending_reconcile_ids("Property").await, vec!["6", "7"]);

    // The first page of the flagged keys arrives, the second request fails.
    h.mls.fail_after(1);
    let err = h.pipeline.sync().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(pending_batches(&h, "Property", BatchKind::Sync).await, 1);
    assert_eq!(h.pipeline.pending_reconcile_ids("Property").await, vec!["6", "7"]);
    assert_eq!(h.memory.keys("Property").await.len(), 5);

    h.mls.recover();
    h.pipeline.sync().await.unwrap();
    assert_eq!(
        h.memory.keys("Property").await,
        vec!["1", "2", "3", "4", "5", "6", "7"]
    );
    assert!(h.pipeline.pending_reconcile_ids("Property").await.is_empty());
    assert_eq!(pending_batches(&h, "Property", BatchKind::Sync).await, 0);
}

#[tokio::test]
async fn test_purge_refused_when_listing_is_short_of_count() {
    let h = harness(2);
    h.mls.set(five_listings());
    h.pipeline.sync().await.unwrap();

    h.mls.remove("3");
    h.mls.overstate_count(1);
    let err = h.pipeline.purge().await.unwrap_err();
    assert!(err.to_string().contains("refusing to purge"), "{err}");
    assert_eq!(h.memory.keys("Property").await, vec!["1", "2", "3", "4", "5"]);
    assert_eq!(h.memory.keys("Media").await.len(), 5);

    h.mls.overstate_count(0);
    let stats = h.pipeline.purge().await.unwrap();
    assert_eq!(stats.resources["Property"].ids_purged, 1);
    assert_eq!(h.memory.keys("Property").await, vec!["1", "2", "4", "5"]);
    assert_eq!(pending_batches(&h, "Property", BatchKind::Purge).await, 0);
}

#[tokio::test]
async fn test_scheduled_run_failure_is_contained() {
    let h = harness(2);
    h.mls.set(five_listings());
    let slot = RunSlot::default();

    h.mls.fail_after(0);
    assert!(fire(&h.pipeline, Operation::Sync, &slot).await.is_none());
    assert!(h.memory.keys("Property").await.is_empty());

    // The slot is free again and the next tick runs normally.
    h.mls.recover();
    let stats = fire(&h.pipeline, Operation::Sync, &slot).await.unwrap();
    assert_eq!(stats.resources["Property"].records_loaded, 5);
    assert_eq!(h.memory.keys("Property").await.len(), 5);
}

//! In-process destination, used for dry runs and tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resync_core::adapter::{DestinationAdapter, PlatformAdapter, Timestamps};
use resync_core::error::AppError;
use resync_core::fields::should_include_field;
use resync_core::indexes::{primary_key_field, timestamp_fields, Indexes};
use resync_core::metadata::Metadata;
use resync_core::models::{key_string, MlsResource, Record};
use resync_core::reconcile::{parse_timestamp, sort_keys, ListingRow};
use tokio::sync::Mutex;

use crate::hooks::DestinationHooks;

#[derive(Debug, Default)]
struct Table {
    columns: BTreeSet<String>,
    rows: HashMap<String, Record>,
}

/// Keeps every resource as a key-to-record map.
pub struct MemoryDestination {
    name: String,
    hooks: DestinationHooks,
    platform: Arc<dyn PlatformAdapter>,
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryDestination {
    pub fn new(name: impl Into<String>, hooks: DestinationHooks, platform: Arc<dyn PlatformAdapter>) -> Self {
        Self {
            name: name.into(),
            hooks,
            platform,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Stored record by primary key.
    pub async fn record(&self, resource: &str, key: &str) -> Option<Record> {
        self.tables
            .lock()
            .await
            .get(resource)
            .and_then(|t| t.rows.get(key).cloned())
    }

    /// Stored keys of a resource in key order.
    pub async fn keys(&self, resource: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .tables
            .lock()
            .await
            .get(resource)
            .map(|t| t.rows.keys().cloned().collect())
            .unwrap_or_default();
        sort_keys(&mut keys);
        keys
    }

    /// Columns declared by schema sync so far.
    pub async fn columns(&self, resource: &str) -> Vec<String> {
        self.tables
            .lock()
            .await
            .get(resource)
            .map(|t| t.columns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Writes a record directly, bypassing the loader.
    pub async fn insert(&self, resource: &str, key: &str, record: Record) {
        self.tables
            .lock()
            .await
            .entry(resource.to_string())
            .or_default()
            .rows
            .insert(key.to_string(), record);
    }
}

#[async_trait]
impl DestinationAdapter for MemoryDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sync_structure(
        &self,
        resource: &MlsResource,
        indexes: &Indexes,
        metadata: &Metadata,
    ) -> Result<(), AppError> {
        let entity = metadata
            .entity_type(self.platform.entity_namespace(), &resource.name)
            .ok_or_else(|| {
                AppError::Metadata(format!(
                    "entity type {} not found in namespace {}",
                    resource.name,
                    self.platform.entity_namespace()
                ))
            })?;
        let mut tables = self.tables.lock().await;
        let table = tables.entry(resource.name.clone()).or_default();
        for property in &entity.properties {
            if should_include_field(
                &property.name,
                indexes,
                |f| self.platform.excludes_metadata_field(f),
                resource.select.as_deref(),
            ) {
                table.columns.insert(property.name.clone());
            }
        }
        Ok(())
    }

    async fn sync_data(
        &self,
        resource: &MlsResource,
        indexes: &Indexes,
        records: Vec<Record>,
        _metadata: &Metadata,
    ) -> Result<usize, AppError> {
        let primary_key = primary_key_field(&resource.name, indexes)?;
        let mut tables = self.tables.lock().await;
        let table = tables.entry(resource.name.clone()).or_default();
        let mut written = 0;
        for record in records {
            let key = record
                .get(primary_key)
                .and_then(key_string)
                .ok_or_else(|| {
                    AppError::destination(
                        &self.name,
                        format!("{} record without {}", resource.name, primary_key),
                    )
                })?;
            table.rows.insert(key, record);
            written += 1;
        }
        Ok(written)
    }

    async fn get_timestamps(&self, resource: &str, indexes: &Indexes) -> Result<Timestamps, AppError> {
        let tables = self.tables.lock().await;
        let rows = tables.get(resource).map(|t| &t.rows);
        Ok(timestamp_fields(indexes)
            .into_iter()
            .map(|field| {
                let max = rows.and_then(|rows| {
                    rows.values()
                        .filter_map(|r| r.get(field).and_then(parse_timestamp))
                        .max()
                });
                (field.to_string(), max)
            })
            .collect())
    }

    async fn get_all_ids(&self, resource: &str, _indexes: &Indexes) -> Result<Vec<String>, AppError> {
        Ok(self.keys(resource).await)
    }

    async fn get_count(&self, resource: &str) -> Result<u64, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .get(resource)
            .map_or(0, |t| t.rows.len() as u64))
    }

    async fn get_most_recent_timestamp(&self, resource: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        Ok(self.tables.lock().await.get(resource).and_then(|t| {
            t.rows
                .values()
                .filter_map(|r| r.get("ModificationTimestamp").and_then(parse_timestamp))
                .max()
        }))
    }

    async fn fetch_missing_ids_data(
        &self,
        resource: &str,
        indexes: &Indexes,
    ) -> Result<Vec<ListingRow>, AppError> {
        let primary_key = primary_key_field(resource, indexes)?;
        let stamps = timestamp_fields(indexes);
        let tables = self.tables.lock().await;
        Ok(tables
            .get(resource)
            .map(|t| {
                t.rows
                    .values()
                    .filter_map(|r| ListingRow::from_record(r, primary_key, &stamps))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purge(
        &self,
        resource: &MlsResource,
        parent_key: &str,
        ids: &[String],
    ) -> Result<u64, AppError> {
        let mut tables = self.tables.lock().await;
        let mut deleted = 0;
        if let Some(table) = tables.get_mut(&resource.name) {
            for id in ids {
                if table.rows.remove(id).is_some() {
                    deleted += 1;
                }
            }
        }

        let doomed: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        for sub in resource.expand.iter().filter(|e| e.purge_from_parent) {
            let column = self
                .hooks
                .foreign_key_field_name(&resource.name, &sub.name, parent_key);
            if let Some(table) = tables.get_mut(&sub.name) {
                table.rows.retain(|_, r| {
                    r.get(&column)
                        .and_then(key_string)
                        .is_none_or(|k| !doomed.contains(k.as_str()))
                });
            }
        }
        Ok(deleted)
    }

    async fn close_connection(&self) -> Result<(), AppError> {
        Ok(())
    }

    fn should_sync_table_schema(&self, resource: &str) -> bool {
        self.hooks.should_sync_table_schema(resource)
    }
}

//! Applies pending batches to destinations, strictly in batch store order.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::adapter::{DestinationAdapter, PlatformAdapter};
use crate::batch::{BatchKind, BatchStore};
use crate::error::AppError;
use crate::fields::should_include_field;
use crate::indexes::IndexCatalog;
use crate::metadata::Metadata;
use crate::models::{MlsResource, MlsSource, Record};
use crate::reconcile::parse_timestamp;
use crate::sync::ResourceStats;

/// Canonicalizes values the destinations compare or type strictly:
/// `*Timestamp` strings become RFC 3339 UTC with milliseconds and `*YN` flags
/// become booleans. Unparseable values pass through untouched.
pub fn normalize_record(mut record: Record) -> Record {
    for (key, value) in record.iter_mut() {
        if value.is_null() {
            continue;
        }
        if key.ends_with("Timestamp") {
            if let Some(t) = parse_timestamp(value) {
                *value = Value::String(t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string());
            }
        } else if key.ends_with("YN") {
            if let Some(flag) = as_flag(value) {
                *value = Value::Bool(flag);
            }
        }
    }
    record
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "y" | "yes" | "1" => Some(true),
            "false" | "n" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub struct Loader<'a> {
    catalog: &'a IndexCatalog,
    store: &'a BatchStore,
    platform: &'a dyn PlatformAdapter,
    destinations: &'a [Arc<dyn DestinationAdapter>],
}

impl<'a> Loader<'a> {
    pub fn new(
        catalog: &'a IndexCatalog,
        store: &'a BatchStore,
        platform: &'a dyn PlatformAdapter,
        destinations: &'a [Arc<dyn DestinationAdapter>],
    ) -> Self {
        Self {
            catalog,
            store,
            platform,
            destinations,
        }
    }

    /// Brings every destination's schema in line with the metadata for each
    /// resource of the source. Destinations opting out are skipped.
    pub async fn sync_structure_all(
        &self,
        source: &MlsSource,
        metadata: &Metadata,
    ) -> Result<(), AppError> {
        for resource in source.flattened_resources() {
            let indexes = self.catalog.get(&resource.name)?;
            for destination in self.destinations {
                if !destination.should_sync_table_schema(&resource.name) {
                    debug!(
                        resource = %resource.name,
                        destination = destination.name(),
                        "Schema sync skipped"
                    );
                    continue;
                }
                destination
                    .sync_structure(&resource, indexes, metadata)
                    .await?;
            }
        }
        Ok(())
    }

    /// Normalizes and filters one batch worth of records for storage.
    pub fn prepare(&self, resource: &MlsResource, records: Vec<Record>) -> Result<Vec<Record>, AppError> {
        let indexes = self.catalog.get(&resource.name)?;
        let select = resource.select.as_deref();
        Ok(records
            .into_iter()
            .map(|record| {
                normalize_record(record)
                    .into_iter()
                    .filter(|(field, _)| {
                        should_include_field(
                            field,
                            indexes,
                            |f| self.platform.excludes_json_field(f),
                            select,
                        )
                    })
                    .collect()
            })
            .collect())
    }

    /// Drains every pending sync batch of `resource`.
    ///
    /// A batch is marked done only once all destinations accepted it; on the
    /// first failure the remaining batches stay pending for the next run.
    pub async fn load_resource(
        &self,
        source: &str,
        resource: &MlsResource,
        metadata: &Metadata,
    ) -> Result<ResourceStats, AppError> {
        let indexes = self.catalog.get(&resource.name)?;
        let mut stats = ResourceStats::new();
        let batches = self.store.list(source, &resource.name, BatchKind::Sync).await?;
        if batches.is_empty() {
            return Ok(stats);
        }

        for batch in batches {
            let page = self.store.read(&batch).await?;
            let records = self.prepare(resource, page.value)?;

            for destination in self.destinations {
                let rows: Vec<Record> = records
                    .iter()
                    .cloned()
                    .map(|r| destination.transform(&resource.name, r, metadata))
                    .collect();
                let written = destination
                    .sync_data(resource, indexes, rows, metadata)
                    .await
                    .inspect_err(|e| {
                        warn!(
                            resource = %resource.name,
                            batch = batch.name(),
                            destination = destination.name(),
                            error = %e,
                            "Batch failed, left pending"
                        )
                    })?;
                stats.records_loaded += written;
            }

            self.store.mark_done(&batch).await?;
            stats.batches_applied += 1;
            debug!(resource = %resource.name, batch = batch.name(), records = records.len(), "Batch applied");
        }

        info!(
            resource = %resource.name,
            batches = stats.batches_applied,
            records = stats.records_loaded,
            "Loaded resource"
        );
        Ok(stats)
    }
}

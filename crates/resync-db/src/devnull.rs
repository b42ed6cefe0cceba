//! Destination that accepts every write and stores nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resync_core::adapter::{DestinationAdapter, Timestamps};
use resync_core::error::AppError;
use resync_core::indexes::{timestamp_fields, Indexes};
use resync_core::metadata::Metadata;
use resync_core::models::{MlsResource, Record};
use resync_core::reconcile::ListingRow;

pub struct DevNullDestination {
    name: String,
}

impl DevNullDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DestinationAdapter for DevNullDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sync_structure(
        &self,
        _resource: &MlsResource,
        _indexes: &Indexes,
        _metadata: &Metadata,
    ) -> Result<(), AppError> {
        Ok(())
    }

    async fn sync_data(
        &self,
        _resource: &MlsResource,
        _indexes: &Indexes,
        records: Vec<Record>,
        _metadata: &Metadata,
    ) -> Result<usize, AppError> {
        Ok(records.len())
    }

    async fn get_timestamps(&self, _resource: &str, indexes: &Indexes) -> Result<Timestamps, AppError> {
        Ok(timestamp_fields(indexes)
            .into_iter()
            .map(|f| (f.to_string(), None))
            .collect())
    }

    async fn get_all_ids(&self, _resource: &str, _indexes: &Indexes) -> Result<Vec<String>, AppError> {
        Ok(Vec::new())
    }

    async fn get_count(&self, _resource: &str) -> Result<u64, AppError> {
        Ok(0)
    }

    async fn get_most_recent_timestamp(&self, _resource: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        Ok(None)
    }

    async fn fetch_missing_ids_data(
        &self,
        _resource: &str,
        _indexes: &Indexes,
    ) -> Result<Vec<ListingRow>, AppError> {
        Ok(Vec::new())
    }

    async fn purge(
        &self,
        _resource: &MlsResource,
        _parent_key: &str,
        _ids: &[String],
    ) -> Result<u64, AppError> {
        Ok(0)
    }

    async fn close_connection(&self) -> Result<(), AppError> {
        Ok(())
    }
}

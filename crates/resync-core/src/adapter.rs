//! Contracts between the pipeline and its collaborators: the upstream HTTP
//! client, the platform adapters, and the destination adapters.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::error::AppError;
use crate::indexes::Indexes;
use crate::metadata::Metadata;
use crate::models::{AuthToken, Credentials, MlsResource, Page, Record};
use crate::reconcile::ListingRow;

/// Latest value already stored per tracked timestamp field. `None` when the
/// destination holds no rows for the resource.
pub type Timestamps = BTreeMap<String, Option<DateTime<Utc>>>;

/// Fetches pages and documents from an OData API.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// GETs one collection page.
    async fn fetch_page(&self, url: &Url, token: &str) -> Result<Page, AppError>;

    /// GETs the raw `$metadata` XML.
    async fn fetch_metadata(&self, url: &Url, token: &str) -> Result<String, AppError>;
}

/// Upstream-platform specific behaviour.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Registry tag, e.g. `trestle`.
    fn name(&self) -> &'static str;

    /// Namespace of the metadata schema holding the entity types.
    fn entity_namespace(&self) -> &str;

    /// True when a field declared in metadata must not be stored.
    fn excludes_metadata_field(&self, field: &str) -> bool;

    /// True when a field present in fetched JSON must not be stored.
    fn excludes_json_field(&self, field: &str) -> bool {
        self.excludes_metadata_field(field)
    }

    /// Checks at startup that the secrets `fetch_auth` needs are present,
    /// without contacting the platform.
    fn check_credentials(&self, credentials: &Credentials) -> Result<(), AppError> {
        credentials.access_token().map(|_| ())
    }

    /// Obtains a bearer token and its expiry.
    async fn fetch_auth(&self, credentials: &Credentials) -> Result<AuthToken, AppError>;
}

/// Storage contract every destination backend implements.
///
/// Writes must be idempotent upserts keyed by primary key: a batch may be
/// applied again after a crash before it was marked done.
#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    /// Unique destination name from config.
    fn name(&self) -> &str;

    /// Adds tables and columns newly present in `metadata`. Never drops columns.
    async fn sync_structure(
        &self,
        resource: &MlsResource,
        indexes: &Indexes,
        metadata: &Metadata,
    ) -> Result<(), AppError>;

    /// Upserts records, returning how many were written.
    async fn sync_data(
        &self,
        resource: &MlsResource,
        indexes: &Indexes,
        records: Vec<Record>,
        metadata: &Metadata,
    ) -> Result<usize, AppError>;

    async fn get_timestamps(&self, resource: &str, indexes: &Indexes) -> Result<Timestamps, AppError>;

    /// Every stored primary key.
    async fn get_all_ids(&self, resource: &str, indexes: &Indexes) -> Result<Vec<String>, AppError>;

    async fn get_count(&self, resource: &str) -> Result<u64, AppError>;

    async fn get_most_recent_timestamp(&self, resource: &str) -> Result<Option<DateTime<Utc>>, AppError>;

    /// Primary key plus tracked timestamp values of every stored record.
    async fn fetch_missing_ids_data(
        &self,
        resource: &str,
        indexes: &Indexes,
    ) -> Result<Vec<ListingRow>, AppError>;

    /// Deletes `ids` from the resource's table. Expanded sub-resources flagged
    /// with `purge_from_parent` lose the rows referencing those ids; the
    /// parent's primary key is `parent_key`.
    async fn purge(
        &self,
        resource: &MlsResource,
        parent_key: &str,
        ids: &[String],
    ) -> Result<u64, AppError>;

    async fn close_connection(&self) -> Result<(), AppError>;

    /// Row transform applied by the loader just before `sync_data`.
    fn transform(&self, _resource: &str, record: Record, _metadata: &Metadata) -> Record {
        record
    }

    /// Opt-out of automatic schema sync for a resource.
    fn should_sync_table_schema(&self, _resource: &str) -> bool {
        true
    }
}

//! One replication pipeline per MLS source.
//!
//! A [`SourcePipeline`] owns everything a run needs: the source definition,
//! validated indexes, the upstream client, the platform adapter and the
//! destination adapters. Runs of different operations may overlap; they
//! serialize on per-resource locks wherever destinations are touched.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::adapter::{DestinationAdapter, PlatformAdapter, Timestamps, UpstreamClient};
use crate::batch::{BatchId, BatchKind, BatchStore};
use crate::collector::{Collector, Sequencer};
use crate::error::AppError;
use crate::indexes::{timestamp_fields, IndexCatalog};
use crate::loader::Loader;
use crate::metadata::Metadata;
use crate::models::{AuthToken, MlsResource, MlsSource, Operation};
use crate::purge::Purger;
use crate::reconcile::{run_diff, sort_keys, DiffRequest};
use crate::sync::RunStats;

/// Record count and freshness of one resource at one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub destination: String,
    pub resource: String,
    pub count: u64,
    pub most_recent: Option<DateTime<Utc>>,
}

pub struct SourcePipeline {
    source: MlsSource,
    catalog: IndexCatalog,
    client: Arc<dyn UpstreamClient>,
    platform: Arc<dyn PlatformAdapter>,
    destinations: Vec<Arc<dyn DestinationAdapter>>,
    store: BatchStore,
    token: Mutex<Option<AuthToken>>,
    /// Keys flagged by reconcile, consumed by the next sync.
    pending: Mutex<HashMap<String, Vec<String>>>,
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl SourcePipeline {
    /// Builds a pipeline, rejecting sources with unusable index definitions.
    pub fn new(
        source: MlsSource,
        client: Arc<dyn UpstreamClient>,
        platform: Arc<dyn PlatformAdapter>,
        destinations: Vec<Arc<dyn DestinationAdapter>>,
        store: BatchStore,
    ) -> Result<Self, AppError> {
        let catalog = IndexCatalog::for_source(&source)?;
        let locks = source
            .flattened_resources()
            .into_iter()
            .map(|r| (r.name, Arc::new(Mutex::new(()))))
            .collect();
        Ok(Self {
            source,
            catalog,
            client,
            platform,
            destinations,
            store,
            token: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            locks,
        })
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn source(&self) -> &MlsSource {
        &self.source
    }

    pub fn destinations(&self) -> &[Arc<dyn DestinationAdapter>] {
        &self.destinations
    }

    /// Runs one operation inside a span identifying the run.
    pub async fn run(&self, op: Operation) -> Result<RunStats, AppError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", source = %self.source.name, operation = %op, %run_id);
        async move {
            info!("Run started");
            let result = match op {
                Operation::Sync => self.sync().await,
                Operation::Purge => self.purge().await,
                Operation::Reconcile => self.reconcile().await,
            };
            match &result {
                Ok(stats) => {
                    let total = stats.total();
                    info!(
                        batches = total.batches_applied,
                        records = total.records_loaded,
                        purged = total.ids_purged,
                        flagged = total.ids_flagged,
                        "Run finished"
                    );
                }
                Err(e) => warn!(error = %e, "Run failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Bearer token, refreshed shortly before expiry.
    async fn token(&self) -> Result<String, AppError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.access_token.clone());
            }
        }
        debug!(platform = self.platform.name(), "Fetching auth token");
        let token = self.platform.fetch_auth(&self.source.credentials).await?;
        let access = token.access_token.clone();
        *cached = Some(token);
        Ok(access)
    }

    async fn metadata(&self, token: &str) -> Result<Metadata, AppError> {
        let xml = if let Some(path) = &self.source.metadata_path {
            tokio::fs::read_to_string(path).await?
        } else if let Some(endpoint) = &self.source.metadata_endpoint {
            let url = Url::parse(endpoint)
                .map_err(|e| AppError::InvalidUrl(format!("{}: {}", endpoint, e)))?;
            self.client.fetch_metadata(&url, token).await?
        } else {
            return Err(AppError::Config(format!(
                "source {} has neither metadata_path nor metadata_endpoint",
                self.source.name
            )));
        };
        Metadata::parse(&xml)
    }

    /// Acquires the locks of `resources`, always in flattened order so two
    /// runs can never wait on each other crosswise.
    async fn lock_resources(&self, resources: &[MlsResource]) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(resources.len());
        for resource in self.source.flattened_resources() {
            if !resources.iter().any(|r| r.name == resource.name) {
                continue;
            }
            if let Some(lock) = self.locks.get(&resource.name) {
                guards.push(lock.clone().lock_owned().await);
            }
        }
        guards
    }

    /// Lowest stored value per timestamp field across destinations, so no
    /// destination misses a change. A field any destination has no value for
    /// gets no bound.
    async fn high_water_mark(&self, resource: &str) -> Result<Timestamps, AppError> {
        let indexes = self.catalog.get(resource)?;
        let mut merged: Timestamps = timestamp_fields(indexes)
            .into_iter()
            .map(|f| (f.to_string(), None))
            .collect();
        if self.destinations.is_empty() {
            return Ok(merged);
        }

        let mut per_destination = Vec::with_capacity(self.destinations.len());
        for destination in &self.destinations {
            per_destination.push(destination.get_timestamps(resource, indexes).await?);
        }
        for (field, bound) in merged.iter_mut() {
            *bound = per_destination
                .iter()
                .map(|ts| ts.get(field).copied().flatten())
                .try_fold(None::<DateTime<Utc>>, |acc, t| {
                    let t = t?;
                    Some(Some(acc.map_or(t, |a| a.min(t))))
                })
                .flatten();
        }
        Ok(merged)
    }

    /// Resumes leftover batches, collects changes plus reconcile-flagged keys
    /// and applies them.
    pub async fn sync(&self) -> Result<RunStats, AppError> {
        let token = self.token().await?;
        let metadata = self.metadata(&token).await?;
        let flattened = self.source.flattened_resources();
        let _guards = self.lock_resources(&flattened).await;

        let loader = Loader::new(
            &self.catalog,
            &self.store,
            self.platform.as_ref(),
            &self.destinations,
        );
        loader.sync_structure_all(&self.source, &metadata).await?;

        let mut stats = RunStats::new();
        let names: Vec<&str> = flattened.iter().map(|r| r.name.as_str()).collect();
        if let Some(oldest) = self
            .store
            .oldest_batch_id(&self.source.name, &names, BatchKind::Sync)
            .await?
        {
            info!(batch_id = %oldest, "Resuming leftover sync batches");
            for resource in &flattened {
                let loaded = loader
                    .load_resource(&self.source.name, resource, &metadata)
                    .await?;
                stats.resource(&resource.name).merge(&loaded);
            }
        }

        let batch_id = BatchId::now();
        let mut seq = Sequencer::default();
        let collector = Collector::new(
            &self.source,
            &self.catalog,
            self.client.as_ref(),
            &self.store,
        );
        let mut pending = std::mem::take(&mut *self.pending.lock().await);

        for (i, resource) in self.source.resources.iter().enumerate() {
            let reconcile_ids = pending.remove(&resource.name).unwrap_or_default();
            let collected = match self.high_water_mark(&resource.name).await {
                Ok(since) => {
                    collector
                        .collect_sync(resource, &token, &batch_id, &since, &reconcile_ids, &mut seq)
                        .await
                }
                Err(e) => Err(e),
            };
            match collected {
                Ok(c) => stats.resource(&resource.name).pages_fetched += c.pages,
                Err(e) => {
                    // Flagged keys not yet fetched go back for the next run.
                    let mut restore = self.pending.lock().await;
                    queue_keys(&mut restore, &resource.name, reconcile_ids);
                    for later in &self.source.resources[i + 1..] {
                        if let Some(ids) = pending.remove(&later.name) {
                            queue_keys(&mut restore, &later.name, ids);
                        }
                    }
                    return Err(e);
                }
            }
        }

        for resource in &flattened {
            let loaded = loader
                .load_resource(&self.source.name, resource, &metadata)
                .await?;
            stats.resource(&resource.name).merge(&loaded);
        }
        Ok(stats)
    }

    /// Replaces each resource's upstream id listing and deletes what vanished.
    pub async fn purge(&self) -> Result<RunStats, AppError> {
        let token = self.token().await?;
        let top_level: HashSet<&str> = self
            .source
            .resources
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        let collector = Collector::new(
            &self.source,
            &self.catalog,
            self.client.as_ref(),
            &self.store,
        );
        let purger = Purger::new(&self.catalog, &self.store, &self.destinations);
        let batch_id = BatchId::now();
        let mut seq = Sequencer::default();
        let mut stats = RunStats::new();

        for resource in self.source.flattened_resources() {
            let is_expanded = !top_level.contains(resource.name.as_str());
            let _guard = self.lock_resources(std::slice::from_ref(&resource)).await;

            purger.discard_stale(&self.source.name, &resource.name).await?;
            let collected = collector
                .collect_purge(&resource, is_expanded, &token, &batch_id, &mut seq)
                .await?;
            let batches = self
                .store
                .list(&self.source.name, &resource.name, BatchKind::Purge)
                .await?;
            let upstream = purger.upstream_ids(&resource.name, &batches).await?;

            if let Some(expected) = collected.expected {
                if (collected.records as u64) < expected {
                    return Err(AppError::ClientError(format!(
                        "{}: purge listing returned {} of {} ids, refusing to purge",
                        resource.name, collected.records, expected
                    )));
                }
            }

            let deleted = purger.apply(&resource, &upstream).await?;
            for batch in &batches {
                self.store.mark_done(batch).await?;
            }
            let entry = stats.resource(&resource.name);
            entry.pages_fetched += collected.pages;
            entry.ids_purged += deleted;
        }
        Ok(stats)
    }

    /// Diffs upstream against each destination and queues the missing or
    /// stale keys for the next sync.
    pub async fn reconcile(&self) -> Result<RunStats, AppError> {
        let token = self.token().await?;
        let collector = Collector::new(
            &self.source,
            &self.catalog,
            self.client.as_ref(),
            &self.store,
        );
        let mut stats = RunStats::new();

        for resource in &self.source.resources {
            let indexes = self.catalog.get(&resource.name)?;
            let listing = collector.fetch_listing(resource, &token).await?;

            let mut flagged = Vec::new();
            {
                let _guard = self.lock_resources(std::slice::from_ref(resource)).await;
                for destination in &self.destinations {
                    let stored = destination
                        .fetch_missing_ids_data(&resource.name, indexes)
                        .await?;
                    let ids = run_diff(DiffRequest {
                        source: listing.clone(),
                        destination: stored,
                    })
                    .await?;
                    debug!(
                        resource = %resource.name,
                        destination = destination.name(),
                        flagged = ids.len(),
                        "Reconciled destination"
                    );
                    flagged.extend(ids);
                }
            }

            let mut pending = self.pending.lock().await;
            let queued = queue_keys(&mut pending, &resource.name, flagged);
            stats.resource(&resource.name).ids_flagged = queued;
            if queued > 0 {
                info!(resource = %resource.name, flagged = queued, "Queued keys for next sync");
            }
        }
        Ok(stats)
    }

    /// Keys reconcile flagged for `resource` that no sync has fetched yet.
    pub async fn pending_reconcile_ids(&self, resource: &str) -> Vec<String> {
        self.pending
            .lock()
            .await
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Counts and freshness for every destination and resource.
    pub async fn snapshot(&self) -> Result<Vec<ResourceSnapshot>, AppError> {
        let mut out = Vec::new();
        for destination in &self.destinations {
            for resource in self.source.flattened_resources() {
                out.push(ResourceSnapshot {
                    destination: destination.name().to_string(),
                    resource: resource.name.clone(),
                    count: destination.get_count(&resource.name).await?,
                    most_recent: destination.get_most_recent_timestamp(&resource.name).await?,
                });
            }
        }
        Ok(out)
    }

    /// Authenticates, loads metadata and reports, per resource, whether the
    /// metadata declares its entity type.
    pub async fn check(&self) -> Result<BTreeMap<String, bool>, AppError> {
        let token = self.token().await?;
        let metadata = self.metadata(&token).await?;
        let namespace = self.platform.entity_namespace();
        let mut found = BTreeMap::new();
        for resource in self.source.flattened_resources() {
            let present = metadata.entity_type(namespace, &resource.name).is_some();
            if !present {
                warn!(
                    source = %self.source.name,
                    resource = %resource.name,
                    namespace,
                    "Resource missing from metadata"
                );
            }
            found.insert(resource.name, present);
        }
        Ok(found)
    }

    pub async fn close(&self) -> Result<(), AppError> {
        for destination in &self.destinations {
            destination.close_connection().await?;
        }
        Ok(())
    }
}

/// Merges `ids` into the queue of `resource`, keeping it sorted and unique.
/// Returns the queue length.
fn queue_keys(pending: &mut HashMap<String, Vec<String>>, resource: &str, ids: Vec<String>) -> usize {
    let queue = pending.entry(resource.to_string()).or_default();
    queue.extend(ids);
    sort_keys(queue);
    queue.dedup();
    queue.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_queue_keys_merges_with_existing() {
        let mut pending = HashMap::new();
        pending.insert("Property".to_string(), keys(&["7", "2"]));

        let len = queue_keys(&mut pending, "Property", keys(&["2", "10", "1a"]));

        assert_eq!(len, 4);
        assert_eq!(pending["Property"], keys(&["2", "7", "10", "1a"]));
    }

    #[test]
    fn test_queue_keys_creates_missing_queue() {
        let mut pending = HashMap::new();
        assert_eq!(queue_keys(&mut pending, "Media", Vec::new()), 0);
        assert!(pending["Media"].is_empty());
    }
}

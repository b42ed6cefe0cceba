//! Deletes destination rows whose keys disappeared upstream.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::adapter::DestinationAdapter;
use crate::batch::{BatchFile, BatchKind, BatchStore};
use crate::error::AppError;
use crate::indexes::IndexCatalog;
use crate::models::{key_string, MlsResource};
use crate::reconcile::sort_keys;

/// Destination keys absent from the upstream listing, ascending.
pub fn ids_to_purge(upstream: &HashSet<String>, destination: Vec<String>) -> Vec<String> {
    let mut ids: Vec<String> = destination
        .into_iter()
        .filter(|id| !upstream.contains(id))
        .collect();
    sort_keys(&mut ids);
    ids.dedup();
    ids
}

pub struct Purger<'a> {
    catalog: &'a IndexCatalog,
    store: &'a BatchStore,
    destinations: &'a [Arc<dyn DestinationAdapter>],
}

impl<'a> Purger<'a> {
    pub fn new(
        catalog: &'a IndexCatalog,
        store: &'a BatchStore,
        destinations: &'a [Arc<dyn DestinationAdapter>],
    ) -> Self {
        Self {
            catalog,
            store,
            destinations,
        }
    }

    /// Drops purge batches left behind by an interrupted run. A partial
    /// listing would make every missing key look deleted.
    pub async fn discard_stale(&self, source: &str, resource: &str) -> Result<usize, AppError> {
        let stale = self.store.list(source, resource, BatchKind::Purge).await?;
        for batch in &stale {
            self.store.mark_done(batch).await?;
        }
        if !stale.is_empty() {
            warn!(resource, discarded = stale.len(), "Discarded interrupted purge listing");
        }
        Ok(stale.len())
    }

    /// Reads the upstream key set back from this run's purge batches.
    pub async fn upstream_ids(
        &self,
        resource: &str,
        batches: &[BatchFile],
    ) -> Result<HashSet<String>, AppError> {
        let primary_key = self.catalog.primary_key(resource)?;
        let mut ids = HashSet::new();
        for batch in batches {
            let page = self.store.read(batch).await?;
            ids.extend(
                page.value
                    .iter()
                    .filter_map(|r| r.get(primary_key).and_then(key_string)),
            );
        }
        Ok(ids)
    }

    /// Deletes, at every destination, the rows missing from `upstream`.
    /// Returns the number of deleted rows summed over destinations.
    pub async fn apply(
        &self,
        resource: &MlsResource,
        upstream: &HashSet<String>,
    ) -> Result<u64, AppError> {
        let indexes = self.catalog.get(&resource.name)?;
        let primary_key = self.catalog.primary_key(&resource.name)?;
        let mut total = 0;
        for destination in self.destinations {
            let stored = destination.get_all_ids(&resource.name, indexes).await?;
            let doomed = ids_to_purge(upstream, stored);
            if doomed.is_empty() {
                continue;
            }
            let deleted = destination.purge(resource, primary_key, &doomed).await?;
            info!(
                resource = %resource.name,
                destination = destination.name(),
                deleted,
                "Purged records missing upstream"
            );
            total += deleted;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_to_purge() {
        let upstream: HashSet<String> = ["1", "3"].iter().map(|s| s.to_string()).collect();
        let stored = vec!["10".to_string(), "3".into(), "2".into(), "1".into(), "2".into()];
        assert_eq!(ids_to_purge(&upstream, stored), vec!["2", "10"]);
    }

    #[test]
    fn test_nothing_to_purge() {
        let upstream: HashSet<String> = ["1"].iter().map(|s| s.to_string()).collect();
        assert!(ids_to_purge(&upstream, vec!["1".into()]).is_empty());
        assert!(ids_to_purge(&upstream, Vec::new()).is_empty());
    }
}

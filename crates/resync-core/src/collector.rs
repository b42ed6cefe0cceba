//! Turns one fetch request into an OData pagination loop, persisting every
//! page as a batch before asking for the next one.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::adapter::{Timestamps, UpstreamClient};
use crate::batch::{BatchId, BatchKind, BatchStore};
use crate::error::AppError;
use crate::indexes::{primary_key_field, timestamp_fields, IndexCatalog};
use crate::models::{and_filter, set_query_param, MlsResource, MlsSource, Page, Record};
use crate::reconcile::ListingRow;

/// Walks a paged collection with `$top`/`$skip`, switching to server-issued
/// next links as soon as the server provides one.
pub struct Paginator<'a> {
    client: &'a dyn UpstreamClient,
    token: &'a str,
    base: Url,
    top: usize,
    skip: usize,
    next: Option<Url>,
    server_driven: bool,
}

impl<'a> Paginator<'a> {
    pub fn new(client: &'a dyn UpstreamClient, token: &'a str, base: Url, top: usize) -> Self {
        let mut first = base.clone();
        set_query_param(&mut first, "$top", &top.to_string());
        Self {
            client,
            token,
            base,
            top,
            skip: 0,
            next: Some(first),
            server_driven: false,
        }
    }

    /// Fetches the next page, `None` once the collection is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Page>, AppError> {
        let Some(url) = self.next.take() else {
            return Ok(None);
        };
        debug!(url = %url, "Fetching page");
        let page = self.client.fetch_page(&url, self.token).await?;

        self.next = if let Some(link) = &page.next_link {
            self.server_driven = true;
            Some(
                url.join(link)
                    .map_err(|e| AppError::InvalidUrl(format!("{}: {}", link, e)))?,
            )
        } else if self.server_driven || page.value.len() < self.top {
            None
        } else {
            self.skip += page.value.len();
            let mut next = self.base.clone();
            set_query_param(&mut next, "$top", &self.top.to_string());
            set_query_param(&mut next, "$skip", &self.skip.to_string());
            Some(next)
        };
        Ok(Some(page))
    }
}

/// Hands out per-directory sequence numbers for one run, so resources that
/// share a batch directory never reuse a file name.
#[derive(Debug, Default)]
pub struct Sequencer {
    counters: HashMap<String, u64>,
}

impl Sequencer {
    pub fn next(&mut self, resource: &str) -> u64 {
        let counter = self.counters.entry(resource.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

/// Counts of one collection pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    pub pages: usize,
    pub records: usize,
    /// `@odata.count` reported with the first page, if any.
    pub expected: Option<u64>,
}

pub struct Collector<'a> {
    source: &'a MlsSource,
    catalog: &'a IndexCatalog,
    client: &'a dyn UpstreamClient,
    store: &'a BatchStore,
}

impl<'a> Collector<'a> {
    pub fn new(
        source: &'a MlsSource,
        catalog: &'a IndexCatalog,
        client: &'a dyn UpstreamClient,
        store: &'a BatchStore,
    ) -> Self {
        Self {
            source,
            catalog,
            client,
            store,
        }
    }

    /// Fetches records changed since the high-water mark, plus the records
    /// named by `reconcile_ids` regardless of their timestamps.
    pub async fn collect_sync(
        &self,
        resource: &MlsResource,
        token: &str,
        batch_id: &BatchId,
        since: &Timestamps,
        reconcile_ids: &[String],
        seq: &mut Sequencer,
    ) -> Result<CollectStats, AppError> {
        let indexes = self.catalog.get(&resource.name)?;
        let primary_key = primary_key_field(&resource.name, indexes)?;
        let base = self.sync_base_url(resource)?;
        let mut stats = CollectStats::default();

        let chunk_size = self.source.reconcile_chunk_size.max(1);
        for chunk in reconcile_ids.chunks(chunk_size) {
            let Some(filter) = self.source.reconcile_filter(primary_key, chunk) else {
                continue;
            };
            let mut url = base.clone();
            and_filter(&mut url, &filter);
            self.page_into_batches(resource, url, token, batch_id, seq, &mut stats)
                .await?;
        }

        let mut url = base;
        if let Some(clause) = changed_since_clause(since) {
            and_filter(&mut url, &clause);
        }
        self.page_into_batches(resource, url, token, batch_id, seq, &mut stats)
            .await?;

        info!(
            resource = %resource.name,
            pages = stats.pages,
            records = stats.records,
            reconciled = reconcile_ids.len(),
            "Collected sync batches"
        );
        Ok(stats)
    }

    /// Writes the complete current-id listing of a resource as purge batches.
    pub async fn collect_purge(
        &self,
        resource: &MlsResource,
        is_expanded: bool,
        token: &str,
        batch_id: &BatchId,
        seq: &mut Sequencer,
    ) -> Result<CollectStats, AppError> {
        let indexes = self.catalog.get(&resource.name)?;
        let primary_key = primary_key_field(&resource.name, indexes)?;
        let mut url = self.source.purge_endpoint(resource, is_expanded)?;
        set_query_param(&mut url, "$select", primary_key);
        if self.source.use_order_by {
            set_query_param(&mut url, "$orderby", &format!("{} asc", primary_key));
        }

        let mut stats = CollectStats::default();
        let mut pages = Paginator::new(self.client, token, url, self.source.top_for_purge);
        while let Some(page) = pages.next_page().await? {
            if stats.pages == 0 {
                stats.expected = page.count;
            }
            stats.pages += 1;
            stats.records += page.value.len();
            let ids = Page {
                value: page
                    .value
                    .into_iter()
                    .filter_map(|r| {
                        let key = r.get(primary_key)?.clone();
                        let mut slim = Record::new();
                        slim.insert(primary_key.to_string(), key);
                        Some(slim)
                    })
                    .collect(),
                next_link: None,
                count: page.count,
            };
            self.store
                .write(
                    &self.source.name,
                    &resource.name,
                    BatchKind::Purge,
                    batch_id,
                    seq.next(&resource.name),
                    &ids,
                )
                .await?;
        }
        info!(resource = %resource.name, ids = stats.records, "Collected purge listing");
        Ok(stats)
    }

    /// Fetches the full (key, tracked timestamps) listing without persisting
    /// it, for reconciliation.
    pub async fn fetch_listing(
        &self,
        resource: &MlsResource,
        token: &str,
    ) -> Result<Vec<ListingRow>, AppError> {
        let indexes = self.catalog.get(&resource.name)?;
        let primary_key = primary_key_field(&resource.name, indexes)?;
        let stamps = timestamp_fields(indexes);

        let mut url = self.source.purge_endpoint(resource, false)?;
        let mut select = vec![primary_key];
        select.extend(stamps.iter().copied());
        set_query_param(&mut url, "$select", &select.join(","));
        if self.source.use_order_by {
            set_query_param(&mut url, "$orderby", &format!("{} asc", primary_key));
        }

        let mut rows = Vec::new();
        let mut pages = Paginator::new(self.client, token, url, self.source.top_for_purge);
        while let Some(page) = pages.next_page().await? {
            rows.extend(
                page.value
                    .iter()
                    .filter_map(|r| ListingRow::from_record(r, primary_key, &stamps)),
            );
        }
        debug!(resource = %resource.name, rows = rows.len(), "Fetched upstream listing");
        Ok(rows)
    }

    fn sync_base_url(&self, resource: &MlsResource) -> Result<Url, AppError> {
        let indexes = self.catalog.get(&resource.name)?;
        let mut url = self.source.replication_endpoint(resource)?;

        if let Some(select) = resource.select.as_ref().filter(|s| !s.is_empty()) {
            let mut fields: Vec<&str> = select.iter().map(String::as_str).collect();
            for index in indexes.values() {
                for field in &index.fields {
                    if !fields.contains(&field.as_str()) {
                        fields.push(field.as_str());
                    }
                }
            }
            set_query_param(&mut url, "$select", &fields.join(","));
        }
        if !resource.expand.is_empty() {
            let expand: Vec<&str> = resource
                .expand
                .iter()
                .map(|e| e.field_name.as_str())
                .collect();
            set_query_param(&mut url, "$expand", &expand.join(","));
        }
        if self.source.use_order_by {
            let stamps = timestamp_fields(indexes);
            let primary_key = primary_key_field(&resource.name, indexes)?;
            let order = match stamps.first() {
                Some(ts) => format!("{} asc,{} asc", ts, primary_key),
                None => format!("{} asc", primary_key),
            };
            set_query_param(&mut url, "$orderby", &order);
        }
        Ok(url)
    }

    async fn page_into_batches(
        &self,
        resource: &MlsResource,
        url: Url,
        token: &str,
        batch_id: &BatchId,
        seq: &mut Sequencer,
        stats: &mut CollectStats,
    ) -> Result<(), AppError> {
        let mut pages = Paginator::new(self.client, token, url, self.source.top);
        while let Some(mut page) = pages.next_page().await? {
            stats.pages += 1;
            stats.records += page.value.len();
            if page.value.is_empty() {
                continue;
            }

            // Expanded values travel as batches of their own resource.
            for expanded in &resource.expand {
                let children = extract_expanded(&mut page.value, &expanded.field_name);
                if children.is_empty() {
                    continue;
                }
                let child_page = Page {
                    value: children,
                    next_link: None,
                    count: None,
                };
                self.store
                    .write(
                        &self.source.name,
                        &expanded.name,
                        BatchKind::Sync,
                        batch_id,
                        seq.next(&expanded.name),
                        &child_page,
                    )
                    .await?;
            }

            page.next_link = None;
            self.store
                .write(
                    &self.source.name,
                    &resource.name,
                    BatchKind::Sync,
                    batch_id,
                    seq.next(&resource.name),
                    &page,
                )
                .await?;
        }
        Ok(())
    }
}

/// OData clause selecting records changed after the high-water mark. `None`
/// when nothing has been stored yet, which means a full fetch.
pub fn changed_since_clause(since: &Timestamps) -> Option<String> {
    let parts: Vec<String> = since
        .iter()
        .filter_map(|(field, value)| {
            value.map(|t| format!("{} gt {}", field, t.format("%Y-%m-%dT%H:%M:%S%.3fZ")))
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" or "))
    }
}

/// Removes `field` from every parent record and returns the embedded values.
fn extract_expanded(records: &mut [Record], field: &str) -> Vec<Record> {
    let mut out = Vec::new();
    for record in records.iter_mut() {
        match record.remove(field) {
            Some(Value::Array(items)) => {
                out.extend(items.into_iter().filter_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                }));
            }
            Some(Value::Object(map)) => out.push(map),
            _ => {}
        }
    }
    out
}

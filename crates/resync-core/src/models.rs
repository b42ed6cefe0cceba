//! Source, resource and destination definitions as declared in `sources.toml`.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::AppError;
use crate::indexes::Indexes;

/// One upstream record, keyed by RESO field name.
pub type Record = serde_json::Map<String, Value>;

/// Placeholder substituted into endpoint templates.
const RESOURCE_PLACEHOLDER: &str = "{resource}";

/// Placeholder substituted into the reconcile filter template.
pub const RECONCILE_PLACEHOLDER: &str = "PLACEHOLDER";

/// The three scheduled pipeline operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Sync,
    Purge,
    Reconcile,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Sync, Operation::Purge, Operation::Reconcile];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Sync => "sync",
            Operation::Purge => "purge",
            Operation::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upstream entity (Property, Media, Member, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlsResource {
    /// Case-sensitive resource name as published by the MLS.
    pub name: String,
    /// Explicit `$select` list. Indexed fields are always fetched regardless.
    #[serde(default)]
    pub select: Option<Vec<String>>,
    /// Base `$filter` applied to resource and replication requests.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub expand: Vec<ExpandedResource>,
    /// Overrides the built-in index catalog for this resource.
    #[serde(default)]
    pub indexes: Option<Indexes>,
}

impl MlsResource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            select: None,
            filter: None,
            expand: Vec::new(),
            indexes: None,
        }
    }
}

/// A sub-resource fetched through `$expand` on its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedResource {
    /// Navigation property on the parent record, e.g. `BuyerAgent`.
    pub field_name: String,
    /// Resource type of the expanded values, e.g. `Member`.
    pub name: String,
    /// Delete rows referencing purged parents.
    #[serde(default)]
    pub purge_from_parent: bool,
    #[serde(default)]
    pub select: Option<Vec<String>>,
    #[serde(default)]
    pub expand: Vec<ExpandedResource>,
    #[serde(default)]
    pub indexes: Option<Indexes>,
}

impl ExpandedResource {
    pub fn as_resource(&self) -> MlsResource {
        MlsResource {
            name: self.name.clone(),
            select: self.select.clone(),
            filter: None,
            expand: self.expand.clone(),
            indexes: self.indexes.clone(),
        }
    }
}

/// Flattens the resource tree into a list unique by name, parents first.
///
/// The walk recurses through nested `expand` lists, but the pipeline only ever
/// extracts expanded values one level below a top-level resource. Entries keep
/// their own `expand` list so callers can look one level down.
pub fn flatten_resources(resources: &[MlsResource]) -> Vec<MlsResource> {
    fn walk(resources: Vec<MlsResource>, out: &mut Vec<MlsResource>) {
        for resource in resources {
            let nested: Vec<MlsResource> =
                resource.expand.iter().map(ExpandedResource::as_resource).collect();
            if !out.iter().any(|r| r.name == resource.name) {
                out.push(resource);
            }
            walk(nested, out);
        }
    }

    let mut out = Vec::new();
    walk(resources.to_vec(), &mut out);
    out
}

/// Credentials, referenced by environment variable name so secrets stay out of
/// the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    pub access_token_env: Option<String>,
    pub client_id_env: Option<String>,
    pub client_secret_env: Option<String>,
    pub token_endpoint: Option<String>,
    pub scope: Option<String>,
}

impl Credentials {
    pub fn access_token(&self) -> Result<String, AppError> {
        read_env("access_token_env", self.access_token_env.as_deref())
    }

    pub fn client_id(&self) -> Result<String, AppError> {
        read_env("client_id_env", self.client_id_env.as_deref())
    }

    pub fn client_secret(&self) -> Result<String, AppError> {
        read_env("client_secret_env", self.client_secret_env.as_deref())
    }
}

fn read_env(key: &str, var: Option<&str>) -> Result<String, AppError> {
    let var = var.ok_or_else(|| AppError::Config(format!("credentials.{} is not set", key)))?;
    std::env::var(var)
        .map_err(|_| AppError::Config(format!("environment variable {} is not set", var)))
}

/// A bearer token together with the expiry the platform reported.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    /// Tokens are refreshed a minute before they actually expire.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(60) < self.expires_at
    }
}

/// Schedule for one operation of one source.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationSchedule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cron_strings: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CronConfig {
    pub sync: Option<OperationSchedule>,
    pub purge: Option<OperationSchedule>,
    pub reconcile: Option<OperationSchedule>,
}

impl CronConfig {
    /// Cron expressions to fire `op` on, empty when the operation is disabled.
    pub fn cron_strings(&self, op: Operation) -> &[String] {
        let schedule = match op {
            Operation::Sync => self.sync.as_ref(),
            Operation::Purge => self.purge.as_ref(),
            Operation::Reconcile => self.reconcile.as_ref(),
        };
        match schedule {
            Some(s) if s.enabled => &s.cron_strings,
            _ => &[],
        }
    }
}

/// `{type, name, config}` block describing one destination.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// Unique among the destinations of a source.
    pub name: String,
    #[serde(default)]
    pub config: DestinationOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationOptions {
    pub connection_string: Option<String>,
    pub connection_string_env: Option<String>,
    /// Prepended to every table name, e.g. `ure_` gives `ure_Property`.
    pub table_prefix: Option<String>,
    pub field_prefix: Option<String>,
    /// Resources whose tables are managed by hand.
    #[serde(default)]
    pub skip_schema_sync: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyOverride>,
}

impl DestinationOptions {
    pub fn connection_string(&self) -> Result<String, AppError> {
        if let Some(s) = &self.connection_string {
            return Ok(s.clone());
        }
        read_env(
            "connection_string_env",
            self.connection_string_env.as_deref(),
        )
    }
}

/// Column holding the parent key in a sub-resource table, when it differs
/// from the parent's primary key name.
#[derive(Debug, Clone, Deserialize)]
pub struct ForeignKeyOverride {
    pub parent: String,
    pub resource: String,
    pub field: String,
    pub column: String,
}

/// One MLS connection with everything needed to replicate it.
#[derive(Debug, Clone, Deserialize)]
pub struct MlsSource {
    pub name: String,
    /// Platform adapter tag, e.g. `trestle`.
    pub platform: String,
    #[serde(default)]
    pub credentials: Credentials,
    pub metadata_endpoint: Option<String>,
    /// Local copy of the metadata document, handy while testing a config.
    pub metadata_path: Option<PathBuf>,
    /// Template with a `{resource}` placeholder.
    pub resource_endpoint: String,
    pub replication_endpoint: Option<String>,
    pub purge_endpoint: Option<String>,
    #[serde(default = "default_top")]
    pub top: usize,
    #[serde(default = "default_top")]
    pub top_for_purge: usize,
    #[serde(default)]
    pub use_order_by: bool,
    #[serde(default = "default_reconcile_template")]
    pub reconcile_filter_template: String,
    #[serde(default = "default_reconcile_separator")]
    pub reconcile_filter_separator: String,
    #[serde(default = "default_reconcile_id_template")]
    pub reconcile_id_template: String,
    /// Ids per reconcile request, keeps URLs under server limits.
    #[serde(default = "default_reconcile_chunk_size")]
    pub reconcile_chunk_size: usize,
    pub resources: Vec<MlsResource>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    #[serde(default)]
    pub cron: CronConfig,
}

fn default_true() -> bool {
    true
}

fn default_top() -> usize {
    200
}

fn default_reconcile_template() -> String {
    format!("({})", RECONCILE_PLACEHOLDER)
}

fn default_reconcile_separator() -> String {
    " or ".to_string()
}

fn default_reconcile_id_template() -> String {
    "{separator}{key} eq '{id}'".to_string()
}

fn default_reconcile_chunk_size() -> usize {
    50
}

impl MlsSource {
    /// All resources, top-level and expanded, unique by name.
    pub fn flattened_resources(&self) -> Vec<MlsResource> {
        flatten_resources(&self.resources)
    }

    /// Endpoint for non-replication reads such as upstream record counts.
    pub fn resource_endpoint(&self, resource: &MlsResource) -> Result<Url, AppError> {
        build_endpoint(&self.resource_endpoint, resource, true)
    }

    pub fn replication_endpoint(&self, resource: &MlsResource) -> Result<Url, AppError> {
        let template = self
            .replication_endpoint
            .as_deref()
            .unwrap_or(&self.resource_endpoint);
        build_endpoint(template, resource, true)
    }

    /// Endpoint listing current ids. Expanded resources are listed without the
    /// parent's base filter.
    pub fn purge_endpoint(&self, resource: &MlsResource, is_expanded: bool) -> Result<Url, AppError> {
        let template = self
            .purge_endpoint
            .as_deref()
            .unwrap_or(&self.resource_endpoint);
        let mut url = build_endpoint(template, resource, !is_expanded)?;
        set_query_param(&mut url, "$count", "true");
        Ok(url)
    }

    /// Builds the filter fragment selecting `ids` by primary key.
    ///
    /// Returns `None` for an empty id list.
    pub fn reconcile_filter(&self, primary_key: &str, ids: &[String]) -> Option<String> {
        if ids.is_empty() {
            return None;
        }
        let joined: String = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let separator = if i == 0 {
                    ""
                } else {
                    self.reconcile_filter_separator.as_str()
                };
                self.reconcile_id_template
                    .replace("{separator}", separator)
                    .replace("{key}", primary_key)
                    .replace("{id}", &id.replace('\'', "''"))
            })
            .collect();
        Some(
            self.reconcile_filter_template
                .replace(RECONCILE_PLACEHOLDER, &joined),
        )
    }
}

fn build_endpoint(template: &str, resource: &MlsResource, with_filter: bool) -> Result<Url, AppError> {
    let raw = template.replace(RESOURCE_PLACEHOLDER, &resource.name);
    let mut url = Url::parse(&raw).map_err(|e| AppError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if with_filter {
        if let Some(filter) = &resource.filter {
            and_filter(&mut url, filter);
        }
    }
    Ok(url)
}

/// Sets `key` on the query string, replacing any existing value.
pub fn set_query_param(url: &mut Url, key: &str, value: &str) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (k, v) in &kept {
        pairs.append_pair(k, v);
    }
    pairs.append_pair(key, value);
}

/// ANDs `clause` onto the `$filter` already present in `url`, if any.
pub fn and_filter(url: &mut Url, clause: &str) {
    let existing = url
        .query_pairs()
        .find(|(k, _)| k == "$filter")
        .map(|(_, v)| v.into_owned());
    let combined = match existing {
        Some(existing) if !existing.trim().is_empty() => {
            format!("({}) and ({})", existing, clause)
        }
        _ => clause.to_string(),
    };
    set_query_param(url, "$filter", &combined);
}

/// One page of an OData collection response, also the on-disk batch format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub value: Vec<Record>,
    #[serde(
        rename = "@odata.nextLink",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_link: Option<String>,
    #[serde(
        rename = "@odata.count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub count: Option<u64>,
}

/// Renders a primary key value as the string used for comparison and filters.
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> MlsSource {
        toml::from_str(
            r#"
            name = "ure"
            platform = "utahRealEstate"
            resource_endpoint = "https://resoapi.example.com/reso/odata/{resource}"

            [[resources]]
            name = "Property"
            filter = "StandardStatus eq 'Active'"

            [[resources.expand]]
            field_name = "Media"
            name = "Media"
            purge_from_parent = true
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_source_defaults() {
        let source = source();
        assert_eq!(source.top, 200);
        assert_eq!(source.top_for_purge, 200);
        assert!(!source.use_order_by);
        assert_eq!(source.reconcile_filter_separator, " or ");
        assert!(source.cron.cron_strings(Operation::Sync).is_empty());
    }

    #[test]
    fn test_replication_endpoint_carries_base_filter() {
        let source = source();
        let url = source.replication_endpoint(&source.resources[0]).unwrap();
        assert_eq!(url.path(), "/reso/odata/Property");
        let filter: Vec<_> = url.query_pairs().filter(|(k, _)| k == "$filter").collect();
        assert_eq!(filter.len(), 1);
        assert_eq!(filter[0].1, "StandardStatus eq 'Active'");
    }

    #[test]
    fn test_purge_endpoint_for_expanded_resource_has_no_filter() {
        let source = source();
        let media = source.resources[0].expand[0].as_resource();
        let url = source.purge_endpoint(&media, true).unwrap();
        assert!(url.query_pairs().all(|(k, _)| k != "$filter"));
        assert!(url.query_pairs().any(|(k, v)| k == "$count" && v == "true"));
    }

    #[test]
    fn test_and_filter_wraps_both_sides() {
        let mut url = Url::parse("https://x.test/Property?$filter=A%20eq%201").unwrap();
        and_filter(&mut url, "B eq 2");
        let filter = url
            .query_pairs()
            .find(|(k, _)| k == "$filter")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(filter, "(A eq 1) and (B eq 2)");
    }

    #[test]
    fn test_reconcile_filter() {
        let source = source();
        let filter = source
            .reconcile_filter("ListingKey", &["2".to_string(), "3".to_string()])
            .unwrap();
        assert_eq!(filter, "(ListingKey eq '2' or ListingKey eq '3')");
        assert!(source.reconcile_filter("ListingKey", &[]).is_none());
    }

    #[test]
    fn test_reconcile_filter_escapes_quotes() {
        let source = source();
        let filter = source
            .reconcile_filter("ListingKey", &["O'Neil".to_string()])
            .unwrap();
        assert_eq!(filter, "(ListingKey eq 'O''Neil')");
    }

    #[test]
    fn test_flatten_resources_unique_by_name() {
        let mut property = MlsResource::new("Property");
        property.expand = vec![
            ExpandedResource {
                field_name: "ListAgent".into(),
                name: "Member".into(),
                purge_from_parent: false,
                select: None,
                expand: vec![ExpandedResource {
                    field_name: "Office".into(),
                    name: "Office".into(),
                    purge_from_parent: false,
                    select: None,
                    expand: vec![],
                    indexes: None,
                }],
                indexes: None,
            },
            ExpandedResource {
                field_name: "BuyerAgent".into(),
                name: "Member".into(),
                purge_from_parent: false,
                select: None,
                expand: vec![],
                indexes: None,
            },
        ];
        let flat = flatten_resources(&[property, MlsResource::new("Member")]);
        let names: Vec<_> = flat.iter().map(|r| r.name.as_str()).collect();
        // Nested expansion is still flattened even though the collector only
        // extracts one level below a top-level resource.
        assert_eq!(names, vec!["Property", "Member", "Office"]);
        assert_eq!(flat[1].expand.len(), 1);
    }

    #[test]
    fn test_page_deserialization() {
        let json = r#"{
            "@odata.count": 3,
            "@odata.nextLink": "https://x.test/Property?$skip=2",
            "value": [{"ListingKey": "1"}, {"ListingKey": 2}]
        }"#;
        let page: Page = serde_json::from_str(json).unwrap();
        assert_eq!(page.count, Some(3));
        assert_eq!(page.value.len(), 2);
        assert_eq!(key_string(&page.value[1]["ListingKey"]).unwrap(), "2");
    }

    #[test]
    fn test_auth_token_freshness() {
        let now = Utc::now();
        let token = AuthToken {
            access_token: "t".into(),
            expires_at: now + Duration::seconds(30),
        };
        assert!(!token.is_fresh(now));
        let token = AuthToken {
            access_token: "t".into(),
            expires_at: now + Duration::hours(1),
        };
        assert!(token.is_fresh(now));
    }
}

//! PostgreSQL destination.
//!
//! Each resource maps to one table keyed by its primary key. Schema sync only
//! ever adds tables and columns; upserts go through `jsonb_populate_recordset`
//! so a whole batch is written in one statement.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resync_core::adapter::{DestinationAdapter, PlatformAdapter, Timestamps};
use resync_core::config::DbConfig;
use resync_core::error::AppError;
use resync_core::fields::should_include_field;
use resync_core::indexes::{primary_key_field, timestamp_fields, Indexes};
use resync_core::metadata::Metadata;
use resync_core::models::{key_string, DestinationOptions, MlsResource, Record};
use resync_core::reconcile::{sort_keys, ListingRow};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::hooks::{quote_ident, DestinationHooks};
use crate::types::{column_type, platform_data_adapter, PlatformDataAdapter};

/// Timestamp column read by `get_most_recent_timestamp`.
const MOST_RECENT_FIELD: &str = "ModificationTimestamp";

/// Destination backed by a PostgreSQL schema.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use resync_core::config::DbConfig;
/// use resync_core::models::DestinationOptions;
/// use resync_db::PostgresDestination;
///
/// # async fn example(platform: Arc<dyn resync_core::PlatformAdapter>) -> Result<(), Box<dyn std::error::Error>> {
/// let options = DestinationOptions {
///     connection_string: Some("postgresql://localhost/mls".to_string()),
///     ..Default::default()
/// };
/// let pg = PostgresDestination::connect("pg1", &options, &DbConfig::default(), platform).await?;
/// # Ok(())
/// # }
/// ```
pub struct PostgresDestination {
    name: String,
    pool: PgPool,
    hooks: DestinationHooks,
    platform: Arc<dyn PlatformAdapter>,
    types: Arc<dyn PlatformDataAdapter>,
}

impl PostgresDestination {
    pub fn new(
        name: impl Into<String>,
        pool: PgPool,
        hooks: DestinationHooks,
        platform: Arc<dyn PlatformAdapter>,
    ) -> Self {
        let types = platform_data_adapter(platform.entity_namespace());
        Self {
            name: name.into(),
            pool,
            hooks,
            platform,
            types,
        }
    }

    /// Opens a connection pool using the destination's connection string.
    pub async fn connect(
        name: &str,
        options: &DestinationOptions,
        db: &DbConfig,
        platform: Arc<dyn PlatformAdapter>,
    ) -> Result<Self, AppError> {
        let url = options.connection_string()?;
        let pool = PgPoolOptions::new()
            .max_connections(db.max_connections)
            .acquire_timeout(db.acquire_timeout)
            .connect(&url)
            .await
            .map_err(AppError::DatabaseError)?;
        info!(destination = name, "Connected to PostgreSQL");
        Ok(Self::new(
            name,
            pool,
            DestinationHooks::from_options(options),
            platform,
        ))
    }

    fn table(&self, resource: &str) -> String {
        quote_ident(&self.hooks.table_name(resource))
    }

    fn column(&self, resource: &str, field: &str) -> String {
        quote_ident(&self.hooks.field_name(resource, field))
    }

    /// Column names of a table, `None` when the table does not exist.
    async fn existing_columns(&self, resource: &str) -> Result<Option<HashSet<String>>, AppError> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            "#,
        )
        .bind(self.hooks.table_name(resource))
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        if names.is_empty() {
            Ok(None)
        } else {
            Ok(Some(names.into_iter().collect()))
        }
    }
}

#[async_trait]
impl DestinationAdapter for PostgresDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sync_structure(
        &self,
        resource: &MlsResource,
        indexes: &Indexes,
        metadata: &Metadata,
    ) -> Result<(), AppError> {
        let namespace = self.platform.entity_namespace();
        let entity = metadata
            .entity_type(namespace, &resource.name)
            .ok_or_else(|| {
                AppError::Metadata(format!(
                    "entity type {} not found in namespace {}",
                    resource.name, namespace
                ))
            })?;
        let primary_key = primary_key_field(&resource.name, indexes)?;

        // Map every type before touching the schema.
        let mut columns = Vec::new();
        for property in &entity.properties {
            if !should_include_field(
                &property.name,
                indexes,
                |f| self.platform.excludes_metadata_field(f),
                resource.select.as_deref(),
            ) {
                continue;
            }
            let sql_type = column_type(&resource.name, property, self.types.as_ref())?;
            columns.push((
                self.hooks.field_name(&resource.name, &property.name),
                sql_type,
                property.nullable,
            ));
        }

        let table = self.table(&resource.name);
        match self.existing_columns(&resource.name).await? {
            None => {
                let mut defs: Vec<String> = columns
                    .iter()
                    .map(|(name, t, nullable)| {
                        let null = if *nullable { "" } else { " NOT NULL" };
                        format!("{} {}{}", quote_ident(name), t, null)
                    })
                    .collect();
                defs.push(format!(
                    "PRIMARY KEY ({})",
                    self.column(&resource.name, primary_key)
                ));
                let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", table, defs.join(", "));
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(AppError::DatabaseError)?;

                for (index_name, index) in indexes.iter().filter(|(_, i)| !i.is_primary) {
                    let fields: Vec<String> = index
                        .fields
                        .iter()
                        .map(|f| self.column(&resource.name, f))
                        .collect();
                    let sql = format!(
                        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                        quote_ident(&format!(
                            "{}_{}",
                            self.hooks.table_name(&resource.name),
                            index_name
                        )),
                        table,
                        fields.join(", ")
                    );
                    sqlx::query(&sql)
                        .execute(&self.pool)
                        .await
                        .map_err(AppError::DatabaseError)?;
                }
                info!(destination = %self.name, resource = %resource.name, columns = columns.len(), "Created table");
            }
            Some(existing) => {
                let mut added = 0;
                for (name, t, _) in columns.iter().filter(|(n, _, _)| !existing.contains(n)) {
                    // Added columns stay nullable: existing rows have no value.
                    let sql = format!(
                        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                        table,
                        quote_ident(name),
                        t
                    );
                    sqlx::query(&sql)
                        .execute(&self.pool)
                        .await
                        .map_err(AppError::DatabaseError)?;
                    added += 1;
                }
                if added > 0 {
                    info!(destination = %self.name, resource = %resource.name, added, "Added columns");
                }
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
        if records.is_empty() {
            return Ok(0);
        }
        let primary_key = primary_key_field(&resource.name, indexes)?;
        let existing = self
            .existing_columns(&resource.name)
            .await?
            .ok_or_else(|| {
                AppError::destination(
                    &self.name,
                    format!("table {} does not exist", self.hooks.table_name(&resource.name)),
                )
            })?;

        // A statement may not touch the same row twice: the last version of
        // a key within the batch wins.
        let mut position: HashMap<String, usize> = HashMap::new();
        let mut rows: Vec<Record> = Vec::with_capacity(records.len());
        for record in records {
            let Some(key) = record.get(primary_key).and_then(key_string) else {
                return Err(AppError::destination(
                    &self.name,
                    format!("{} record without {}", resource.name, primary_key),
                ));
            };
            let renamed: Record = record
                .into_iter()
                .map(|(k, v)| (self.hooks.field_name(&resource.name, &k), v))
                .filter(|(k, _)| existing.contains(k))
                .collect();
            match position.get(&key) {
                Some(&i) => rows[i] = renamed,
                None => {
                    position.insert(key, rows.len());
                    rows.push(renamed);
                }
            }
        }

        let mut columns: Vec<&String> = existing
            .iter()
            .filter(|c| rows.iter().any(|r| r.contains_key(*c)))
            .collect();
        columns.sort();
        let pk_column = self.hooks.field_name(&resource.name, primary_key);
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| ***c != pk_column)
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
            .collect();
        let on_conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let table = self.table(&resource.name);
        let sql = format!(
            "INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_recordset(NULL::{table}, $1) ON CONFLICT ({pk}) {on_conflict}",
            table = table,
            cols = column_list,
            pk = quote_ident(&pk_column),
            on_conflict = on_conflict,
        );

        let written = rows.len();
        let payload: Vec<Value> = rows.into_iter().map(Value::Object).collect();
        sqlx::query(&sql)
            .bind(Json(payload))
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        debug!(destination = %self.name, resource = %resource.name, rows = written, "Upserted batch");
        Ok(written)
    }

    async fn get_timestamps(&self, resource: &str, indexes: &Indexes) -> Result<Timestamps, AppError> {
        let table = self.table(resource);
        let mut out = Timestamps::new();
        for field in timestamp_fields(indexes) {
            let sql = format!("SELECT MAX({}) FROM {}", self.column(resource, field), table);
            let max: Option<DateTime<Utc>> = sqlx::query_scalar(&sql)
                .fetch_one(&self.pool)
                .await
                .map_err(AppError::DatabaseError)?;
            out.insert(field.to_string(), max);
        }
        Ok(out)
    }

    async fn get_all_ids(&self, resource: &str, indexes: &Indexes) -> Result<Vec<String>, AppError> {
        let primary_key = primary_key_field(resource, indexes)?;
        let sql = format!(
            "SELECT {}::text FROM {}",
            self.column(resource, primary_key),
            self.table(resource)
        );
        let mut ids: Vec<String> = sqlx::query_scalar(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        // Database collation must not decide the order.
        sort_keys(&mut ids);
        Ok(ids)
    }

    async fn get_count(&self, resource: &str) -> Result<u64, AppError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table(resource));
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(count.max(0) as u64)
    }

    async fn get_most_recent_timestamp(&self, resource: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        let column = self.hooks.field_name(resource, MOST_RECENT_FIELD);
        let has_column = self
            .existing_columns(resource)
            .await?
            .is_some_and(|c| c.contains(&column));
        if !has_column {
            return Ok(None);
        }
        let sql = format!("SELECT MAX({}) FROM {}", quote_ident(&column), self.table(resource));
        let max: Option<DateTime<Utc>> = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(max)
    }

    async fn fetch_missing_ids_data(
        &self,
        resource: &str,
        indexes: &Indexes,
    ) -> Result<Vec<ListingRow>, AppError> {
        let primary_key = primary_key_field(resource, indexes)?;
        let stamps = timestamp_fields(indexes);
        let mut select = vec![format!("{}::text", self.column(resource, primary_key))];
        select.extend(stamps.iter().map(|f| self.column(resource, f)));
        let sql = format!("SELECT {} FROM {}", select.join(", "), self.table(resource));

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get(0).map_err(AppError::DatabaseError)?;
            let mut timestamps = Vec::with_capacity(stamps.len());
            for i in 0..stamps.len() {
                let t: Option<DateTime<Utc>> = row.try_get(i + 1).map_err(AppError::DatabaseError)?;
                timestamps.push(t);
            }
            out.push(ListingRow { key, timestamps });
        }
        Ok(out)
    }

    async fn purge(
        &self,
        resource: &MlsResource,
        parent_key: &str,
        ids: &[String],
    ) -> Result<u64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;

        let sql = format!(
            "DELETE FROM {} WHERE {}::text = ANY($1)",
            self.table(&resource.name),
            self.column(&resource.name, parent_key)
        );
        let deleted = sqlx::query(&sql)
            .bind(ids)
            .execute(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?
            .rows_affected();

        for sub in resource.expand.iter().filter(|e| e.purge_from_parent) {
            let fk = self
                .hooks
                .foreign_key_field_name(&resource.name, &sub.name, parent_key);
            let sql = format!(
                "DELETE FROM {} WHERE {}::text = ANY($1)",
                self.table(&sub.name),
                quote_ident(&fk)
            );
            let cascaded = sqlx::query(&sql)
                .bind(ids)
                .execute(&mut *tx)
                .await
                .map_err(AppError::DatabaseError)?
                .rows_affected();
            debug!(destination = %self.name, resource = %sub.name, cascaded, "Purged child rows");
        }

        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(deleted)
    }

    async fn close_connection(&self) -> Result<(), AppError> {
        self.pool.close().await;
        Ok(())
    }

    fn should_sync_table_schema(&self, resource: &str) -> bool {
        self.hooks.should_sync_table_schema(resource)
    }
}

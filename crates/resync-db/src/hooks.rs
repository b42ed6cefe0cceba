//! Declarative naming hooks shared by the destination adapters.

use std::collections::HashSet;

use resync_core::models::{DestinationOptions, ForeignKeyOverride};

/// Table and column naming for one destination.
#[derive(Debug, Clone, Default)]
pub struct DestinationHooks {
    table_prefix: String,
    field_prefix: String,
    skip_schema_sync: HashSet<String>,
    foreign_keys: Vec<ForeignKeyOverride>,
}

impl DestinationHooks {
    pub fn from_options(options: &DestinationOptions) -> Self {
        Self {
            table_prefix: options.table_prefix.clone().unwrap_or_default(),
            field_prefix: options.field_prefix.clone().unwrap_or_default(),
            skip_schema_sync: options.skip_schema_sync.iter().cloned().collect(),
            foreign_keys: options.foreign_keys.clone(),
        }
    }

    pub fn table_name(&self, resource: &str) -> String {
        format!("{}{}", self.table_prefix, resource)
    }

    pub fn field_name(&self, _resource: &str, field: &str) -> String {
        format!("{}{}", self.field_prefix, field)
    }

    /// Column of `resource` holding the parent's key `field`.
    pub fn foreign_key_field_name(&self, parent: &str, resource: &str, field: &str) -> String {
        self.foreign_keys
            .iter()
            .find(|fk| fk.parent == parent && fk.resource == resource && fk.field == field)
            .map(|fk| fk.column.clone())
            .unwrap_or_else(|| self.field_name(resource, field))
    }

    pub fn should_sync_table_schema(&self, resource: &str) -> bool {
        !self.skip_schema_sync.contains(resource)
    }
}

/// Double-quotes a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

//! Index definitions: one primary key plus the update-timestamp fields used to
//! bound incremental fetches and detect drift.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{MlsResource, MlsSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub fields: Vec<String>,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub is_update_timestamp: bool,
}

/// Indexes of one resource keyed by index name.
pub type Indexes = BTreeMap<String, Index>;

/// Returns the single primary key field of a resource.
///
/// Exactly one primary index with exactly one field is required; anything else
/// is a configuration error.
pub fn primary_key_field<'a>(resource: &str, indexes: &'a Indexes) -> Result<&'a str, AppError> {
    let primaries: Vec<(&String, &Index)> = indexes.iter().filter(|(_, v)| v.is_primary).collect();
    if primaries.len() != 1 {
        let names: Vec<&str> = primaries.iter().map(|(k, _)| k.as_str()).collect();
        return Err(AppError::Config(format!(
            "{}: expected exactly 1 key, got {} ({})",
            resource,
            primaries.len(),
            names.join(", ")
        )));
    }
    let fields = &primaries[0].1.fields;
    if fields.len() != 1 {
        return Err(AppError::Config(format!(
            "{}: expected exactly 1 field, got {} ({})",
            resource,
            fields.len(),
            fields.join(", ")
        )));
    }
    Ok(&fields[0])
}

/// Fields of every update-timestamp index, in index-name order.
pub fn timestamp_fields(indexes: &Indexes) -> Vec<&str> {
    indexes
        .iter()
        .filter(|(_, v)| v.is_update_timestamp)
        .flat_map(|(_, v)| v.fields.iter().map(String::as_str))
        .collect()
}

/// True when `field` belongs to any index.
pub fn is_indexed(field: &str, indexes: &Indexes) -> bool {
    indexes.values().any(|i| i.fields.iter().any(|f| f == field))
}

fn key(field: &str) -> (String, Index) {
    (
        field.to_string(),
        Index {
            fields: vec![field.to_string()],
            is_primary: true,
            is_update_timestamp: false,
        },
    )
}

fn stamp(field: &str) -> (String, Index) {
    (
        field.to_string(),
        Index {
            fields: vec![field.to_string()],
            is_primary: false,
            is_update_timestamp: true,
        },
    )
}

/// Built-in indexes for the standard RESO resources.
pub fn default_indexes(resource: &str) -> Option<Indexes> {
    let entries = match resource {
        "Property" => vec![
            key("ListingKey"),
            stamp("ModificationTimestamp"),
            stamp("PhotosChangeTimestamp"),
        ],
        "Media" => vec![key("MediaKey"), stamp("ModificationTimestamp")],
        "Member" => vec![key("MemberKey"), stamp("ModificationTimestamp")],
        "Office" => vec![key("OfficeKey"), stamp("ModificationTimestamp")],
        "OpenHouse" => vec![key("OpenHouseKey"), stamp("ModificationTimestamp")],
        "PropertyRooms" => vec![key("RoomKey"), stamp("ModificationTimestamp")],
        "PropertyUnitTypes" => vec![key("UnitTypeKey"), stamp("ModificationTimestamp")],
        "Teams" => vec![key("TeamKey"), stamp("ModificationTimestamp")],
        _ => return None,
    };
    Some(entries.into_iter().collect())
}

/// Validated indexes for every resource of a source.
#[derive(Debug, Clone, Default)]
pub struct IndexCatalog {
    by_resource: HashMap<String, Indexes>,
}

impl IndexCatalog {
    /// Resolves per-resource overrides, falling back to the built-in catalog, and
    /// checks each resource has a usable primary key.
    pub fn for_source(source: &MlsSource) -> Result<Self, AppError> {
        let mut by_resource = HashMap::new();
        for resource in source.flattened_resources() {
            let indexes = Self::resolve(&resource)?;
            primary_key_field(&resource.name, &indexes)?;
            by_resource.insert(resource.name.clone(), indexes);
        }
        Ok(Self { by_resource })
    }

    fn resolve(resource: &MlsResource) -> Result<Indexes, AppError> {
        match &resource.indexes {
            Some(indexes) => Ok(indexes.clone()),
            None => default_indexes(&resource.name).ok_or_else(|| {
                AppError::Config(format!(
                    "no index definition for resource {}; declare `indexes` in its config",
                    resource.name
                ))
            }),
        }
    }

    pub fn get(&self, resource: &str) -> Result<&Indexes, AppError> {
        self.by_resource
            .get(resource)
            .ok_or_else(|| AppError::Config(format!("unknown resource {}", resource)))
    }

    pub fn primary_key(&self, resource: &str) -> Result<&str, AppError> {
        primary_key_field(resource, self.get(resource)?)
    }
}

//! Mapping of upstream metadata types to PostgreSQL column types.

use std::fmt;
use std::sync::Arc;

use resync_core::error::AppError;
use resync_core::metadata::Property;

/// Largest declared precision still stored in single precision.
const SINGLE_PRECISION_MAX: u32 = 23;

/// Longest declared string kept in a bounded column.
const VARCHAR_MAX: u32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Real,
    DoublePrecision,
    Numeric {
        precision: Option<u32>,
        scale: Option<u32>,
    },
    Boolean,
    Date,
    Integer,
    BigInt,
    Timestamptz,
    Text,
    Varchar(u32),
    Jsonb,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Real => f.write_str("REAL"),
            ColumnType::DoublePrecision => f.write_str("DOUBLE PRECISION"),
            ColumnType::Numeric {
                precision: Some(p),
                scale: Some(s),
            } => write!(f, "NUMERIC({}, {})", p, s),
            ColumnType::Numeric {
                precision: Some(p),
                scale: None,
            } => write!(f, "NUMERIC({})", p),
            ColumnType::Numeric { .. } => f.write_str("NUMERIC"),
            ColumnType::Boolean => f.write_str("BOOLEAN"),
            ColumnType::Date => f.write_str("DATE"),
            ColumnType::Integer => f.write_str("INTEGER"),
            ColumnType::BigInt => f.write_str("BIGINT"),
            ColumnType::Timestamptz => f.write_str("TIMESTAMPTZ(3)"),
            ColumnType::Text => f.write_str("TEXT"),
            ColumnType::Varchar(n) => write!(f, "VARCHAR({})", n),
            ColumnType::Jsonb => f.write_str("JSONB"),
        }
    }
}

/// Platform-specific column type overrides, consulted before the standard
/// `Edm.*` mapping.
pub trait PlatformDataAdapter: Send + Sync {
    fn override_type(&self, property: &Property) -> Option<ColumnType>;
}

/// Stores the platform's enumeration types as text and collection types as
/// JSON. Only types declared in the platform's own namespace are touched, so
/// stray types still fail the mapping.
#[derive(Debug, Clone)]
pub struct EnumerationTypes {
    namespace: String,
}

impl EnumerationTypes {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn in_namespace(&self, type_name: &str) -> bool {
        type_name
            .strip_prefix(self.namespace.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl PlatformDataAdapter for EnumerationTypes {
    fn override_type(&self, property: &Property) -> Option<ColumnType> {
        let type_name = property.type_name.as_str();
        if let Some(inner) = type_name
            .strip_prefix("Collection(")
            .and_then(|t| t.strip_suffix(')'))
        {
            if inner.starts_with("Edm.") || self.in_namespace(inner) {
                return Some(ColumnType::Jsonb);
            }
            return None;
        }
        self.in_namespace(type_name).then_some(ColumnType::Text)
    }
}

pub fn platform_data_adapter(namespace: &str) -> Arc<dyn PlatformDataAdapter> {
    Arc::new(EnumerationTypes::new(namespace))
}

/// Maps one metadata property to a column type.
///
/// # Errors
///
/// Returns `AppError::SchemaMapping` for a type with no mapping; schema sync
/// of the resource must stop there.
pub fn column_type(
    resource: &str,
    property: &Property,
    overrides: &dyn PlatformDataAdapter,
) -> Result<ColumnType, AppError> {
    if let Some(t) = overrides.override_type(property) {
        return Ok(t);
    }
    let mapped = match property.type_name.as_str() {
        "Edm.Double" => match property.precision {
            Some(p) if p <= SINGLE_PRECISION_MAX => ColumnType::Real,
            _ => ColumnType::DoublePrecision,
        },
        "Edm.Decimal" => ColumnType::Numeric {
            precision: property.precision,
            scale: property.scale,
        },
        "Edm.Boolean" => ColumnType::Boolean,
        "Edm.Date" => ColumnType::Date,
        "Edm.Int32" => ColumnType::Integer,
        "Edm.Int64" => ColumnType::BigInt,
        "Edm.DateTimeOffset" => ColumnType::Timestamptz,
        "Edm.String" => match property.max_length {
            Some(n) if n <= VARCHAR_MAX => ColumnType::Varchar(n),
            _ => ColumnType::Text,
        },
        "Edm.GeographyPoint" => ColumnType::Jsonb,
        other => {
            return Err(AppError::SchemaMapping {
                resource: resource.to_string(),
                field: property.name.clone(),
                type_name: other.to_string(),
            })
        }
    };
    Ok(mapped)
}

//! OData `$metadata` document model.
//!
//! Only what schema sync needs is kept: entity types and their scalar
//! properties with the facets used by type mapping.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::AppError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub schemas: Vec<Schema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub namespace: String,
    pub entity_types: Vec<EntityType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    pub name: String,
    pub properties: Vec<Property>,
}

/// A scalar property declaration, e.g.
/// `<Property Name="ListPrice" Type="Edm.Decimal" Precision="14" Scale="2"/>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub type_name: String,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub max_length: Option<u32>,
    pub nullable: bool,
}

impl Property {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            precision: None,
            scale: None,
            max_length: None,
            nullable: true,
        }
    }
}

impl Metadata {
    pub fn parse(xml: &str) -> Result<Self, AppError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut schemas = Vec::new();
        let mut schema: Option<Schema> = None;
        let mut entity: Option<EntityType> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = e.local_name();
                    match name.as_ref() {
                        b"Schema" => {
                            let attrs = attributes(&e)?;
                            schema = Some(Schema {
                                namespace: attrs.get("Namespace").cloned().unwrap_or_default(),
                                entity_types: Vec::new(),
                            });
                        }
                        b"EntityType" => {
                            let attrs = attributes(&e)?;
                            entity = Some(EntityType {
                                name: required(&attrs, "Name", "EntityType")?,
                                properties: Vec::new(),
                            });
                        }
                        b"Property" => push_property(&mut entity, &e)?,
                        _ => {}
                    }
                }
                Ok(Event::Empty(e)) => {
                    let name = e.local_name();
                    match name.as_ref() {
                        b"Property" => push_property(&mut entity, &e)?,
                        b"EntityType" => {
                            let attrs = attributes(&e)?;
                            if let Some(s) = schema.as_mut() {
                                s.entity_types.push(EntityType {
                                    name: required(&attrs, "Name", "EntityType")?,
                                    properties: Vec::new(),
                                });
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    b"EntityType" => {
                        if let (Some(s), Some(et)) = (schema.as_mut(), entity.take()) {
                            s.entity_types.push(et);
                        }
                    }
                    b"Schema" => {
                        if let Some(s) = schema.take() {
                            schemas.push(s);
                        }
                    }
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(AppError::Metadata(format!(
                        "at byte {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        if schemas.is_empty() {
            return Err(AppError::Metadata("no Schema element found".to_string()));
        }
        Ok(Self { schemas })
    }

    /// Looks up an entity type in the schema with the given namespace.
    pub fn entity_type(&self, namespace: &str, name: &str) -> Option<&EntityType> {
        self.schemas
            .iter()
            .filter(|s| s.namespace == namespace)
            .flat_map(|s| s.entity_types.iter())
            .find(|et| et.name == name)
    }
}

fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>, AppError> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| AppError::Metadata(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| AppError::Metadata(e.to_string()))?
            .into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn required(attrs: &HashMap<String, String>, key: &str, element: &str) -> Result<String, AppError> {
    attrs
        .get(key)
        .cloned()
        .ok_or_else(|| AppError::Metadata(format!("{} without {} attribute", element, key)))
}

fn push_property(entity: &mut Option<EntityType>, e: &BytesStart<'_>) -> Result<(), AppError> {
    // Complex types also declare <Property>; only entity members matter.
    let Some(entity) = entity.as_mut() else {
        return Ok(());
    };
    let attrs = attributes(e)?;
    let number = |key: &str| attrs.get(key).and_then(|v| v.parse::<u32>().ok());
    entity.properties.push(Property {
        name: required(&attrs, "Name", "Property")?,
        type_name: required(&attrs, "Type", "Property")?,
        precision: number("Precision"),
        scale: number("Scale"),
        max_length: number("MaxLength"),
        nullable: attrs.get("Nullable").map(|v| v != "false").unwrap_or(true),
    });
    Ok(())
}

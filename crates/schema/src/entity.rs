use parser::{
    types::{FieldDefinition, ObjectType, ServiceDocument, TypeDefinition, TypeKind, TypeSystemDefinition},
    Positioned,
};
use serde::{Deserialize, Serialize};

use crate::{EntityDirectives, SchemaError};

/// Argument of a field definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// A field of a federated entity together with its own federation directives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub directives: EntityDirectives,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<ArgumentInfo>,
}

impl FederatedField {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            directives: Default::default(),
            arguments: Default::default(),
        }
    }

    pub fn with_directives(self, directives: EntityDirectives) -> Self {
        Self { directives, ..self }
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        self.directives.is_external()
    }
}

/// A type with at least one `@key`, as contributed by one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedEntity {
    pub type_name: String,
    pub service_name: String,
    #[serde(default)]
    pub directives: EntityDirectives,
    #[serde(default)]
    pub fields: Vec<FederatedField>,
}

impl FederatedEntity {
    pub fn field(&self, name: &str) -> Option<&FederatedField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// The union of all `@key` field names.
    #[inline]
    pub fn key_fields(&self) -> Vec<String> {
        self.directives.key_fields()
    }

    #[inline]
    pub fn is_key_field(&self, name: &str) -> bool {
        self.directives.is_key_field(name)
    }

    /// Fields this service can return for the entity: everything it owns plus external key fields.
    pub fn resolvable_fields(&self) -> impl Iterator<Item = &FederatedField> {
        self.fields
            .iter()
            .filter(|field| !field.is_external() || self.is_key_field(&field.name))
    }

    /// Validate the directives of the entity and of every field.
    ///
    /// A field carrying `@requires` is only valid when the entity marks the required data as
    /// `@external`, either on the type, on the field itself, or on each required field.
    pub fn validate(&self) -> Result<(), SchemaError> {
        self.directives.validate(&self.type_name)?;

        for field in &self.fields {
            let location = format!("{}.{}", self.type_name, field.name);
            field.directives.validate(&location)?;

            if let Some(requires) = &field.directives.requires {
                let external_declared = self.directives.is_external() ||
                    field.is_external() ||
                    requires
                        .field_names()
                        .all(|name| self.field(name).is_some_and(FederatedField::is_external));
                if !external_declared {
                    return Err(SchemaError::Validation {
                        message: format!("@requires on '{location}' requires the field to be marked as @external"),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Extract every entity (object type with `@key`) from a parsed service document.
pub(crate) fn entities_from_document(service: &str, document: &ServiceDocument) -> Result<Vec<FederatedEntity>, SchemaError> {
    let mut entities = Vec::new();

    for definition in &document.definitions {
        let TypeSystemDefinition::Type(type_definition) = definition else {
            continue;
        };
        let TypeKind::Object(ObjectType { fields, .. }) = &type_definition.node.kind else {
            continue;
        };

        if let Some(entity) = convert_entity(service, &type_definition.node, fields)? {
            entities.push(entity);
        }
    }

    tracing::debug!(service = %service, count = entities.len(), "Extracted federation entities");
    Ok(entities)
}

/// Extract every entity declared by `sdl`.
pub fn extract_entities(service: &str, sdl: &str) -> Result<Vec<FederatedEntity>, SchemaError> {
    if sdl.trim().is_empty() {
        return Err(SchemaError::EmptySchema {
            service: service.to_string(),
        });
    }
    let document = parser::parse_schema(sdl).map_err(|err| SchemaError::Parse {
        service: service.to_string(),
        message: err.to_string(),
    })?;
    entities_from_document(service, &document)
}

fn convert_entity(
    service: &str,
    definition: &TypeDefinition,
    fields: &[Positioned<FieldDefinition>],
) -> Result<Option<FederatedEntity>, SchemaError> {
    let type_name = definition.name.node.to_string();
    let directives = EntityDirectives::from_directives(&type_name, &definition.directives)?;
    if directives.keys.is_empty() {
        return Ok(None);
    }

    let fields = fields
        .iter()
        .map(|field| convert_field(&type_name, &field.node))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(FederatedEntity {
        type_name,
        service_name: service.to_string(),
        directives,
        fields,
    }))
}

fn convert_field(type_name: &str, definition: &FieldDefinition) -> Result<FederatedField, SchemaError> {
    let location = format!("{}.{}", type_name, definition.name.node);
    Ok(FederatedField {
        name: definition.name.node.to_string(),
        ty: definition.ty.node.to_string(),
        directives: EntityDirectives::from_directives(&location, &definition.directives)?,
        arguments: definition
            .arguments
            .iter()
            .map(|argument| ArgumentInfo {
                name: argument.node.name.node.to_string(),
                ty: argument.node.ty.node.to_string(),
            })
            .collect(),
    })
}

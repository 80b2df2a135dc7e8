use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use parser::types::{ObjectType, TypeKind, TypeSystemDefinition};

use crate::{entity::entities_from_document, FederatedEntity, SchemaError};

const ROOT_TYPES: &[&str] = &["Query", "Mutation", "Subscription"];

/// The schema of one subgraph with the federation data derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSchema {
    pub service_name: String,
    pub sdl: String,
    pub entities: Vec<FederatedEntity>,
    /// Root field names keyed by root type (`Query`, `Mutation`, `Subscription`).
    pub root_fields: IndexMap<String, Vec<String>>,
}

impl ServiceSchema {
    /// Parse `sdl` and validate the federation directives it declares.
    pub fn parse(service_name: impl Into<String>, sdl: impl Into<String>) -> Result<Self, SchemaError> {
        let service_name = service_name.into();
        let sdl = sdl.into();

        if service_name.is_empty() {
            return Err(SchemaError::EmptyServiceName);
        }
        if sdl.trim().is_empty() {
            return Err(SchemaError::EmptySchema { service: service_name });
        }

        let document = parser::parse_schema(&sdl).map_err(|err| SchemaError::Parse {
            service: service_name.clone(),
            message: err.to_string(),
        })?;

        let entities = entities_from_document(&service_name, &document)?;
        for entity in &entities {
            entity.validate()?;
        }

        let mut root_fields: IndexMap<String, Vec<String>> = IndexMap::new();
        for definition in &document.definitions {
            let TypeSystemDefinition::Type(type_definition) = definition else {
                continue;
            };
            let type_name = type_definition.node.name.node.as_str();
            if !ROOT_TYPES.contains(&type_name) {
                continue;
            }
            if let TypeKind::Object(ObjectType { fields, .. }) = &type_definition.node.kind {
                let names = root_fields.entry(type_name.to_string()).or_default();
                for field in fields {
                    let name = field.node.name.node.to_string();
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }

        Ok(Self {
            service_name,
            sdl,
            entities,
            root_fields,
        })
    }

    /// Whether this service declares `field` on any root type.
    pub fn owns_root_field(&self, field: &str) -> bool {
        self.root_fields.values().flatten().any(|name| name == field)
    }
}

/// An immutable copy of the registered schemas, captured once per request.
#[derive(Debug, Clone, Default)]
pub struct SchemaSnapshot {
    schemas: IndexMap<String, Arc<ServiceSchema>>,
}

impl SchemaSnapshot {
    pub fn schema(&self, service_name: &str) -> Option<&ServiceSchema> {
        self.schemas.get(service_name).map(AsRef::as_ref)
    }

    /// Registered service names in registration order.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Every entity contributed by every registered service.
    pub fn federated_entities(&self) -> Vec<FederatedEntity> {
        self.schemas
            .values()
            .flat_map(|schema| schema.entities.iter().cloned())
            .collect()
    }

    /// Services declaring `field` on a root type, in registration order.
    pub fn root_field_owners(&self, field: &str) -> Vec<String> {
        self.schemas
            .values()
            .filter(|schema| schema.owns_root_field(field))
            .map(|schema| schema.service_name.clone())
            .collect()
    }

    /// `(provider, dependent)` service pairs implied by `@requires`.
    ///
    /// The provider is any other service exposing a required field of the same entity type without
    /// `@external`.
    pub fn requires_edges(&self) -> Vec<(String, String)> {
        let entities = self.federated_entities();
        let mut edges: Vec<(String, String)> = Vec::new();

        for dependent in &entities {
            let required = dependent
                .fields
                .iter()
                .filter_map(|field| field.directives.requires.as_ref())
                .flat_map(|requires| requires.field_names());

            for field_name in required {
                for provider in &entities {
                    if provider.service_name == dependent.service_name || provider.type_name != dependent.type_name {
                        continue;
                    }
                    let provides_field = provider
                        .field(field_name)
                        .is_some_and(|field| !field.is_external());
                    let edge = (provider.service_name.clone(), dependent.service_name.clone());
                    if provides_field && !edges.contains(&edge) {
                        edges.push(edge);
                    }
                }
            }
        }

        edges
    }
}

/// Storage of the registered subgraph schemas.
///
/// Readers work on a [`SchemaSnapshot`] so a registration never changes a request in flight.
pub trait SchemaRegistry: Send + Sync {
    fn register_schema(&self, service_name: &str, sdl: &str) -> Result<(), SchemaError>;

    fn unregister_schema(&self, service_name: &str) -> bool;

    fn snapshot(&self) -> SchemaSnapshot;

    fn schema(&self, service_name: &str) -> Option<Arc<ServiceSchema>> {
        self.snapshot().schemas.get(service_name).cloned()
    }

    fn services(&self) -> Vec<String> {
        self.snapshot().services().map(ToString::to_string).collect()
    }

    fn federated_entities(&self) -> Vec<FederatedEntity> {
        self.snapshot().federated_entities()
    }

    fn root_field_owners(&self, field: &str) -> Vec<String> {
        self.snapshot().root_field_owners(field)
    }
}

#[derive(Debug, Default)]
pub struct InMemorySchemaRegistry {
    schemas: RwLock<IndexMap<String, Arc<ServiceSchema>>>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.schemas.read().unwrap_or_else(|err| err.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SchemaRegistry for InMemorySchemaRegistry {
    fn register_schema(&self, service_name: &str, sdl: &str) -> Result<(), SchemaError> {
        let schema = ServiceSchema::parse(service_name, sdl)?;
        tracing::info!(
            service = %service_name,
            entities = schema.entities.len(),
            "Registered service schema"
        );
        self.schemas
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(service_name.to_string(), Arc::new(schema));
        Ok(())
    }

    fn unregister_schema(&self, service_name: &str) -> bool {
        self.schemas
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .shift_remove(service_name)
            .is_some()
    }

    fn snapshot(&self) -> SchemaSnapshot {
        SchemaSnapshot {
            schemas: self.schemas.read().unwrap_or_else(|err| err.into_inner()).clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn root_fields_are_grouped_by_type() {
        let schema = ServiceSchema::parse(
            "accounts",
            r#"
            type Query { me: User users: [User] }
            type Mutation { login(name: String!): String }
            type User @key(fields: "id") { id: ID! }
            "#,
        )
        .unwrap();

        assert_eq!(schema.root_fields["Query"], vec!["me".to_string(), "users".to_string()]);
        assert_eq!(schema.root_fields["Mutation"], vec!["login".to_string()]);
        assert!(schema.owns_root_field("login"));
        assert!(!schema.owns_root_field("id"));
    }

    #[test]
    fn unregister_removes_schema() {
        let registry = InMemorySchemaRegistry::new();
        registry.register_schema("a", "type Query { a: Int }").unwrap();
        assert!(registry.unregister_schema("a"));
        assert!(!registry.unregister_schema("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_not_affected_by_later_registrations() {
        let registry = InMemorySchemaRegistry::new();
        registry.register_schema("users", "type Query { users: [Int] }").unwrap();
        let snapshot = registry.snapshot();
        registry.register_schema("products", "type Query { products: [Int] }").unwrap();

        assert_eq!(snapshot.services().collect::<Vec<_>>(), vec!["users"]);
        assert_eq!(registry.root_field_owners("products"), vec!["products".to_string()]);
        assert!(snapshot.root_field_owners("products").is_empty());
    }

    #[test]
    fn requires_points_at_the_owning_service() {
        let registry = InMemorySchemaRegistry::new();
        registry
            .register_schema(
                "products",
                r#"type Product @key(fields: "upc") { upc: String! weight: Int }"#,
            )
            .unwrap();
        registry
            .register_schema(
                "shipping",
                r#"
                extend type Product @key(fields: "upc") {
                    upc: String! @external
                    weight: Int @external
                    estimate: Int @requires(fields: "weight")
                }
                "#,
            )
            .unwrap();

        assert_eq!(registry.snapshot().requires_edges(), vec![(
            "products".to_string(),
            "shipping".to_string()
        )]);
    }
}

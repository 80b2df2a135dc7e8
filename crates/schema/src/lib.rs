#![forbid(unsafe_code)]

mod directives;
mod entity;
mod error;
mod registry;

pub use directives::{
    validate_field_selection,
    EntityDirectives,
    ExternalDirective,
    KeyDirective,
    ProvidesDirective,
    RequiresDirective,
};
pub use entity::{extract_entities, ArgumentInfo, FederatedEntity, FederatedField};
pub use error::SchemaError;
pub use registry::{InMemorySchemaRegistry, SchemaRegistry, SchemaSnapshot, ServiceSchema};

use once_cell::sync::Lazy;
use parser::{types::ConstDirective, Positioned};
use regex::Regex;
use serde::{Deserialize, Serialize};
use value::{ConstValue, Name};

use crate::SchemaError;

/// A field set as accepted by `@key`, `@requires` and `@provides`: whitespace separated names.
static FIELD_SELECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*(\s+[a-zA-Z_][a-zA-Z0-9_]*)*$").expect("field selection pattern is valid")
});

/// `@key(fields: "...", resolvable: Boolean = true)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDirective {
    pub fields: String,
    #[serde(default = "default_resolvable")]
    pub resolvable: bool,
}

impl KeyDirective {
    pub fn new(fields: impl Into<String>) -> Self {
        Self {
            fields: fields.into(),
            resolvable: true,
        }
    }

    /// Names of the fields in this key.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.split_whitespace()
    }
}

/// `@external(reason: String)`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDirective {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `@requires(fields: "...")`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiresDirective {
    pub fields: String,
}

impl RequiresDirective {
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.split_whitespace()
    }
}

/// `@provides(fields: "...")`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidesDirective {
    pub fields: String,
}

/// Federation directives attached to a type or to a field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDirectives {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<KeyDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<RequiresDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provides: Option<ProvidesDirective>,
}

impl EntityDirectives {
    /// Collect the federation directives from a parsed directive list.
    ///
    /// Unknown directives are ignored. `location` is only used for error messages.
    pub fn from_directives(location: &str, directives: &[Positioned<ConstDirective>]) -> Result<Self, SchemaError> {
        let mut result = EntityDirectives::default();

        for directive in directives {
            let arguments = &directive.node.arguments;
            match directive.node.name.node.as_str() {
                "key" => {
                    let fields = required_fields_argument("key", location, arguments)?;
                    let resolvable = match get_argument(arguments, "resolvable") {
                        Some(ConstValue::Boolean(resolvable)) => *resolvable,
                        Some(_) => {
                            return Err(SchemaError::Directive {
                                directive: "key",
                                location: location.to_string(),
                                message: "argument 'resolvable' must be a boolean".to_string(),
                            })
                        },
                        None => true,
                    };
                    result.keys.push(KeyDirective { fields, resolvable });
                },
                "external" => {
                    let reason = match get_argument(arguments, "reason") {
                        Some(ConstValue::String(reason)) => Some(reason.clone()),
                        _ => None,
                    };
                    result.external = Some(ExternalDirective { reason });
                },
                "requires" => {
                    let fields = required_fields_argument("requires", location, arguments)?;
                    result.requires = Some(RequiresDirective { fields });
                },
                "provides" => {
                    let fields = required_fields_argument("provides", location, arguments)?;
                    result.provides = Some(ProvidesDirective { fields });
                },
                _ => {},
            }
        }

        Ok(result)
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        self.external.is_some()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.external.is_none() && self.requires.is_none() && self.provides.is_none()
    }

    /// The union of the fields named by every `@key`, in declaration order and without duplicates.
    pub fn key_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        for name in self.keys.iter().flat_map(KeyDirective::field_names) {
            if !fields.iter().any(|field| field == name) {
                fields.push(name.to_string());
            }
        }
        fields
    }

    pub fn is_key_field(&self, name: &str) -> bool {
        self.keys.iter().flat_map(KeyDirective::field_names).any(|field| field == name)
    }

    /// Check the field sets of the federation directives.
    ///
    /// The `@requires`/`@external` pairing spans several fields and is checked by
    /// [`FederatedEntity::validate`](crate::FederatedEntity::validate).
    pub fn validate(&self, location: &str) -> Result<(), SchemaError> {
        if self.keys.is_empty() {
            tracing::debug!(location = %location, "No @key directives found");
        }

        for (index, key) in self.keys.iter().enumerate() {
            validate_field_selection(&key.fields).map_err(|_| SchemaError::Directive {
                directive: "key",
                location: location.to_string(),
                message: format!("directive {} has invalid fields '{}'", index, key.fields),
            })?;
        }

        if let Some(requires) = &self.requires {
            validate_field_selection(&requires.fields).map_err(|_| SchemaError::Directive {
                directive: "requires",
                location: location.to_string(),
                message: format!("invalid fields '{}'", requires.fields),
            })?;
        }

        if let Some(provides) = &self.provides {
            validate_field_selection(&provides.fields).map_err(|_| SchemaError::Directive {
                directive: "provides",
                location: location.to_string(),
                message: format!("invalid fields '{}'", provides.fields),
            })?;
        }

        Ok(())
    }
}

/// Check that a field set is a non-empty list of whitespace separated field names.
pub fn validate_field_selection(fields: &str) -> Result<(), SchemaError> {
    let trimmed = fields.trim();
    if trimmed.is_empty() || !FIELD_SELECTION.is_match(trimmed) {
        return Err(SchemaError::InvalidFieldSelection {
            fields: fields.to_string(),
        });
    }
    Ok(())
}

fn default_resolvable() -> bool {
    true
}

fn get_argument<'a>(arguments: &'a [(Positioned<Name>, Positioned<ConstValue>)], name: &str) -> Option<&'a ConstValue> {
    arguments
        .iter()
        .find_map(|(key, value)| (key.node.as_str() == name).then_some(&value.node))
}

fn required_fields_argument(
    directive: &'static str,
    location: &str,
    arguments: &[(Positioned<Name>, Positioned<ConstValue>)],
) -> Result<String, SchemaError> {
    match get_argument(arguments, "fields") {
        Some(ConstValue::String(fields)) if !fields.trim().is_empty() => Ok(fields.trim().to_string()),
        _ => Err(SchemaError::Directive {
            directive,
            location: location.to_string(),
            message: "argument 'fields' must be a non-empty string".to_string(),
        }),
    }
}

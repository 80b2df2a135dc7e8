use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Schema of service '{service}' is empty.")]
    EmptySchema { service: String },

    #[error("Failed to parse schema of service '{service}': {message}")]
    Parse { service: String, message: String },

    #[error("Invalid @{directive} directive on '{location}': {message}")]
    Directive {
        directive: &'static str,
        location: String,
        message: String,
    },

    #[error("Invalid field selection '{fields}'.")]
    InvalidFieldSelection { fields: String },

    #[error("{message}")]
    Validation { message: String },

    #[error("Service name must not be empty.")]
    EmptyServiceName,
}

impl SchemaError {
    /// Stable error code reported in GraphQL error extensions.
    pub fn code(&self) -> &'static str {
        match self {
            SchemaError::EmptySchema { .. } | SchemaError::EmptyServiceName => "SCHEMA_INVALID",
            SchemaError::Parse { .. } => "PARSING_ERROR",
            SchemaError::Directive { .. } => "DIRECTIVE_PARSING_ERROR",
            SchemaError::InvalidFieldSelection { .. } | SchemaError::Validation { .. } => "VALIDATION_ERROR",
        }
    }
}

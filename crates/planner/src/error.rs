use std::fmt::{self, Display, Formatter};

use graphfed_schema::SchemaError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ServerError;

pub type Result<T, E = FederationError> = std::result::Result<T, E>;

/// How bad an error is; also used to order the error list of a response.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FederationError {
    #[error("Failed to parse query: {0}")]
    QueryParsing(String),

    #[error("Invalid query: {0}")]
    QueryValidation(String),

    #[error("{0}")]
    QueryComplexity(String),

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Call to service '{service}' failed: {message}")]
    ServiceCall {
        service: String,
        message: String,
        status: Option<u16>,
    },

    #[error("Service '{service}' timed out: {message}")]
    Timeout { service: String, message: String },

    #[error("Service '{service}' is unavailable: {message}")]
    ServiceUnavailable { service: String, message: String },

    #[error("Service '{0}' not found.")]
    ServiceNotFound(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Invalid schema: {0}")]
    SchemaInvalid(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("{0}")]
    DirectiveParsing(String),

    #[error("Entity resolution failed: {0}")]
    EntityResolution(String),

    #[error("Failed to extract data: {0}")]
    DataExtraction(String),

    #[error("Failed to build query: {0}")]
    QueryBuilding(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Parsing failed: {0}")]
    Parsing(String),

    #[error("Resolution failed: {0}")]
    Resolution(String),

    #[error("Merge failed: {0}")]
    Merge(String),
}

impl FederationError {
    /// The stable code reported in `extensions.code`.
    pub fn code(&self) -> &'static str {
        match self {
            FederationError::QueryParsing(_) => "QUERY_PARSING_ERROR",
            FederationError::QueryValidation(_) => "QUERY_VALIDATION_ERROR",
            FederationError::QueryComplexity(_) => "QUERY_COMPLEXITY_ERROR",
            FederationError::Planning(_) => "PLANNING_FAILED",
            FederationError::Execution(_) | FederationError::Merge(_) => "EXECUTION_FAILED",
            FederationError::ServiceCall { .. } => "SERVICE_CALL_ERROR",
            FederationError::Timeout { .. } => "TIMEOUT_ERROR",
            FederationError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            FederationError::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            FederationError::ConfigInvalid(_) => "CONFIG_INVALID",
            FederationError::SchemaInvalid(_) => "SCHEMA_INVALID",
            FederationError::Internal(_) => "INTERNAL_ERROR",
            FederationError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            FederationError::DirectiveParsing(_) => "DIRECTIVE_PARSING_ERROR",
            FederationError::EntityResolution(_) => "ENTITY_RESOLUTION_ERROR",
            FederationError::DataExtraction(_) => "DATA_EXTRACTION_ERROR",
            FederationError::QueryBuilding(_) => "QUERY_BUILDING_ERROR",
            FederationError::Validation(_) => "VALIDATION_ERROR",
            FederationError::Parsing(_) => "PARSING_ERROR",
            FederationError::Resolution(_) => "RESOLUTION_ERROR",
        }
    }

    /// Whether the same call may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            FederationError::Timeout { .. } |
            FederationError::ServiceUnavailable { .. } |
            FederationError::RateLimitExceeded(_) => true,
            FederationError::ServiceCall { status, .. } => match status {
                Some(status) => *status >= 500 || *status == 429,
                None => true,
            },
            _ => false,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            FederationError::Internal(_) | FederationError::ConfigInvalid(_) | FederationError::SchemaInvalid(_) => {
                Severity::Critical
            },
            FederationError::ServiceCall { .. } |
            FederationError::Timeout { .. } |
            FederationError::ServiceUnavailable { .. } => Severity::High,
            FederationError::QueryParsing(_) |
            FederationError::QueryValidation(_) |
            FederationError::QueryComplexity(_) => Severity::Medium,
            _ => Severity::Low,
        }
    }

    /// The service the error originates from, when it is tied to one.
    pub fn service(&self) -> Option<&str> {
        match self {
            FederationError::ServiceCall { service, .. } |
            FederationError::Timeout { service, .. } |
            FederationError::ServiceUnavailable { service, .. } |
            FederationError::ServiceNotFound(service) => Some(service),
            _ => None,
        }
    }

    pub fn to_server_error(&self) -> ServerError {
        let error = ServerError::new(self.to_string()).extension("code", self.code());
        match self.service() {
            Some(service) => error.extension("service", service),
            None => error,
        }
    }
}

impl From<SchemaError> for FederationError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::Directive { .. } => FederationError::DirectiveParsing(err.to_string()),
            SchemaError::Parse { .. } => FederationError::Parsing(err.to_string()),
            SchemaError::EmptySchema { .. } | SchemaError::EmptyServiceName => {
                FederationError::SchemaInvalid(err.to_string())
            },
            SchemaError::InvalidFieldSelection { .. } | SchemaError::Validation { .. } => {
                FederationError::Validation(err.to_string())
            },
        }
    }
}

impl From<FederationError> for ServerError {
    fn from(err: FederationError) -> Self {
        err.to_server_error()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;
    use value::ConstValue;

    use super::*;

    fn service_call(status: Option<u16>) -> FederationError {
        FederationError::ServiceCall {
            service: "users".to_string(),
            message: "failed".to_string(),
            status,
        }
    }

    #[test_case(service_call(Some(503)), true ; "server error")]
    #[test_case(service_call(Some(429)), true ; "too many requests")]
    #[test_case(service_call(Some(400)), false ; "bad request")]
    #[test_case(service_call(None), true ; "no status")]
    #[test_case(FederationError::RateLimitExceeded("slow down".to_string()), true ; "rate limit")]
    #[test_case(FederationError::QueryParsing("bad".to_string()), false ; "parsing")]
    #[test_case(FederationError::ConfigInvalid("bad".to_string()), false ; "config")]
    fn retryability(err: FederationError, retryable: bool) {
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn severity_orders_errors() {
        assert_eq!(FederationError::Internal("x".to_string()).severity(), Severity::Critical);
        assert_eq!(service_call(None).severity(), Severity::High);
        assert_eq!(FederationError::QueryComplexity("x".to_string()).severity(), Severity::Medium);
        assert_eq!(FederationError::Merge("x".to_string()).severity(), Severity::Low);
        assert!(Severity::Critical > Severity::High);
    }

    #[test]
    fn server_error_carries_code_and_service() {
        let err = FederationError::Timeout {
            service: "products-service".to_string(),
            message: "deadline exceeded".to_string(),
        }
        .to_server_error();

        assert_eq!(err.code(), Some("TIMEOUT_ERROR"));
        assert_eq!(
            err.extensions.get("service"),
            Some(&ConstValue::String("products-service".to_string()))
        );
    }
}

use std::{collections::HashMap, time::Duration};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::{FederationError, Result};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_QUERY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_QUERY_DEPTH: usize = 10;
pub const MAX_QUERY_DEPTH_LIMIT: usize = 100;

/// Configuration of the federation gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationConfig {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default = "default_true")]
    pub enable_query_planning: bool,

    #[serde(default)]
    pub enable_caching: bool,

    /// Maximum selection depth of a query, `0` disables the check.
    #[serde(default = "default_max_query_depth")]
    pub max_query_depth: usize,

    #[serde(
        rename = "query_timeout_ms",
        with = "serde_millis",
        default = "default_query_timeout"
    )]
    pub query_timeout: Duration,

    #[serde(default)]
    pub enable_introspection: bool,

    #[serde(default)]
    pub debug_mode: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            enable_query_planning: true,
            enable_caching: false,
            max_query_depth: DEFAULT_MAX_QUERY_DEPTH,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            enable_introspection: false,
            debug_mode: false,
        }
    }
}

/// A subgraph the gateway routes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Base URL, for example `http://users:4001`.
    pub endpoint: String,

    #[serde(default = "default_path")]
    pub path: String,

    /// SDL of the service.
    #[serde(default)]
    pub schema: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(rename = "timeout_ms", with = "serde_millis", default = "default_service_timeout")]
    pub timeout: Duration,

    #[serde(default)]
    pub max_retries: u32,

    /// Static headers added to every call to the service.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            path: default_path(),
            schema: String::new(),
            weight: default_weight(),
            timeout: DEFAULT_SERVICE_TIMEOUT,
            max_retries: 0,
            headers: HashMap::new(),
            health_check: None,
        }
    }

    pub fn schema(self, schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            ..self
        }
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// The URL GraphQL requests are posted to.
    pub fn url(&self) -> String {
        join_url(&self.endpoint, &self.path)
    }

    /// The URL of the health endpoint, when health checks are enabled.
    pub fn health_url(&self) -> Option<String> {
        self.health_check
            .as_ref()
            .filter(|health_check| health_check.enabled)
            .map(|health_check| join_url(&self.endpoint, &health_check.path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(rename = "interval_ms", with = "serde_millis", default = "default_health_interval")]
    pub interval: Duration,

    #[serde(rename = "timeout_ms", with = "serde_millis", default = "default_service_timeout")]
    pub timeout: Duration,

    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_health_interval(),
            timeout: DEFAULT_SERVICE_TIMEOUT,
            path: default_health_path(),
        }
    }
}

impl FederationConfig {
    /// Replace unset values with their defaults.
    pub fn with_defaults(mut self) -> Self {
        if self.query_timeout.is_zero() {
            self.query_timeout = DEFAULT_QUERY_TIMEOUT;
        }
        for service in &mut self.services {
            if service.timeout.is_zero() {
                service.timeout = DEFAULT_SERVICE_TIMEOUT;
            }
            if service.weight == 0 {
                service.weight = default_weight();
            }
            if service.path.is_empty() {
                service.path = default_path();
            }
            if let Some(health_check) = &mut service.health_check {
                if health_check.interval.is_zero() {
                    health_check.interval = default_health_interval();
                }
                if health_check.timeout.is_zero() {
                    health_check.timeout = DEFAULT_SERVICE_TIMEOUT;
                }
                if health_check.path.is_empty() {
                    health_check.path = default_health_path();
                }
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(invalid("at least one service must be configured"));
        }

        if self.max_query_depth > MAX_QUERY_DEPTH_LIMIT {
            return Err(invalid(format!(
                "max_query_depth must be between 0 and {}, got {}",
                MAX_QUERY_DEPTH_LIMIT, self.max_query_depth
            )));
        }

        if self.query_timeout.is_zero() {
            return Err(invalid("query_timeout must be positive"));
        }
        if self.query_timeout > MAX_QUERY_TIMEOUT {
            return Err(invalid(format!(
                "query_timeout must not exceed {}s",
                MAX_QUERY_TIMEOUT.as_secs()
            )));
        }

        let mut names = IndexSet::new();
        for (index, service) in self.services.iter().enumerate() {
            service.validate().map_err(|err| match err {
                FederationError::ConfigInvalid(message) => invalid(format!("service {index}: {message}")),
                err => err,
            })?;
            if !names.insert(service.name.as_str()) {
                return Err(invalid(format!("duplicate service name '{}'", service.name)));
            }
        }

        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|service| service.name == name)
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(invalid("service name is required"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid(format!(
                "service name '{}' may only contain letters, digits, '_' and '-'",
                self.name
            )));
        }

        if self.endpoint.is_empty() {
            return Err(invalid(format!("endpoint of service '{}' is required", self.name)));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(invalid(format!(
                "endpoint '{}' of service '{}' must start with http:// or https://",
                self.endpoint, self.name
            )));
        }

        if self.schema.trim().is_empty() {
            return Err(invalid(format!("schema of service '{}' is required", self.name)));
        }

        if let Some(health_check) = &self.health_check {
            if health_check.timeout > health_check.interval {
                return Err(invalid(format!(
                    "health check timeout of service '{}' must not exceed its interval",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> FederationError {
    FederationError::ConfigInvalid(message.into())
}

fn join_url(endpoint: &str, path: &str) -> String {
    match (endpoint.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", endpoint.trim_end_matches('/'), path),
        (false, false) if !path.is_empty() => format!("{endpoint}/{path}"),
        _ => format!("{endpoint}{path}"),
    }
}

fn default_true() -> bool {
    true
}

fn default_max_query_depth() -> usize {
    DEFAULT_MAX_QUERY_DEPTH
}

fn default_query_timeout() -> Duration {
    DEFAULT_QUERY_TIMEOUT
}

fn default_service_timeout() -> Duration {
    DEFAULT_SERVICE_TIMEOUT
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_path() -> String {
    "/graphql".to_string()
}

fn default_weight() -> u32 {
    1
}

/// Durations written as integer milliseconds.
pub mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

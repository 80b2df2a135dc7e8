#![forbid(unsafe_code)]

pub use caller::{BatchResponse, ServiceCall, ServiceCaller, ServiceResponse};
pub use engine::{Engine, EngineMetrics, EngineStatus};
pub use entity_resolver::EntityResolver;
pub use executor::{ExecutionCoordinator, ExecutionState};
pub use health::{HealthCache, HealthStatus, DEFAULT_HEALTH_TTL};
pub use http_caller::{CallerStats, HttpCaller};
pub use merger::{ConflictPolicy, FieldMerger, MergerConfig, NullPolicy, ResponseMerger, DEFAULT_MAX_MERGE_DEPTH};

mod caller;
mod engine;
mod entity_resolver;
mod executor;
mod health;
mod http_caller;
mod merger;

pub mod handler;

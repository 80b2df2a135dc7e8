#![forbid(unsafe_code)]

mod analyzer;
mod builder;
pub mod config;
mod dependency;
mod entity;
mod error;
mod optimizer;
mod ownership;
pub mod plan;
mod printer;
mod request;
mod response;
mod validate;

pub use analyzer::{FieldKind, FieldPath, ParsedQuery, QueryAnalyzer, MAX_RECURSION_DEPTH};
pub use builder::PlanBuilder;
pub use config::{FederationConfig, HealthCheckConfig, ServiceConfig};
pub use dependency::DependencyGraph;
pub use entity::{
    EntityPlanner,
    EntityResolution,
    FederationPlan,
    RepresentationRequest,
    REPRESENTATIONS_VARIABLE,
};
pub use error::{FederationError, Result, Severity};
pub use optimizer::PlanOptimizer;
pub use ownership::OwnershipResolver;
pub use plan::{ExecutionPlan, MergeStrategy, PlanMetadata, SubQuery};
pub use printer::PrintedOperation;
pub use request::Request;
pub use response::{Response, ServerError};
pub use validate::validate_plan;

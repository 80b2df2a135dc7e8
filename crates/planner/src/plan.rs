use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use value::Variables;

use crate::config::serde_millis;

pub const DEFAULT_SUB_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_COUNT: u32 = 3;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Shallow,
    Deep,
}

impl Display for MergeStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeStrategy::Shallow => "shallow",
            MergeStrategy::Deep => "deep",
        })
    }
}

/// The part of a query sent to one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubQuery {
    pub service_name: String,
    pub query: String,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(rename = "timeoutMs", with = "serde_millis")]
    pub timeout: Duration,
    pub retry_count: u32,
}

impl SubQuery {
    pub fn new(service_name: impl Into<String>, query: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self {
            path: vec![service_name.clone()],
            service_name,
            query: query.into(),
            variables: Default::default(),
            timeout: DEFAULT_SUB_QUERY_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }

    pub fn variables(self, variables: Variables) -> Self {
        Self { variables, ..self }
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// The operation keyword of the query text.
    pub fn operation_keyword(&self) -> &'static str {
        let query = self.query.trim_start();
        if query.starts_with("mutation") {
            "mutation"
        } else if query.starts_with("subscription") {
            "subscription"
        } else {
            "query"
        }
    }

    /// Number of selection sets in the query text.
    #[inline]
    pub fn nesting(&self) -> usize {
        self.query.matches('{').count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub created_at: DateTime<Utc>,
    pub total_fields: usize,
    pub total_services: usize,
    pub complexity: usize,
    pub optimized: bool,
    pub original_sub_queries: usize,
    pub optimized_sub_queries: usize,
}

impl Default for PlanMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            total_fields: 0,
            total_services: 0,
            complexity: 0,
            optimized: false,
            original_sub_queries: 0,
            optimized_sub_queries: 0,
        }
    }
}

/// Sub-queries in execution order, with the services each one must wait for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub sub_queries: Vec<SubQuery>,
    /// service -> services it must follow
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub dependencies: IndexMap<String, Vec<String>>,
    pub merge_strategy: MergeStrategy,
    pub metadata: PlanMetadata,
}

impl ExecutionPlan {
    pub fn new(sub_queries: Vec<SubQuery>) -> Self {
        let merge_strategy = choose_merge_strategy(&sub_queries);
        let metadata = PlanMetadata {
            total_services: sub_queries.len(),
            complexity: plan_complexity(&sub_queries),
            original_sub_queries: sub_queries.len(),
            optimized_sub_queries: sub_queries.len(),
            ..Default::default()
        };
        Self {
            sub_queries,
            dependencies: Default::default(),
            merge_strategy,
            metadata,
        }
    }

    pub fn sub_query(&self, service_name: &str) -> Option<&SubQuery> {
        self.sub_queries
            .iter()
            .find(|sub_query| sub_query.service_name == service_name)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.sub_queries.iter().map(|sub_query| sub_query.service_name.as_str())
    }
}

/// Deep merging pays off only when several services return nested data.
pub fn choose_merge_strategy(sub_queries: &[SubQuery]) -> MergeStrategy {
    if sub_queries.len() > 1 && sub_queries.iter().any(|sub_query| sub_query.nesting() > 1) {
        MergeStrategy::Deep
    } else {
        MergeStrategy::Shallow
    }
}

/// Selection sets of every sub-query plus the number of variables they carry.
pub fn plan_complexity(sub_queries: &[SubQuery]) -> usize {
    sub_queries
        .iter()
        .map(|sub_query| sub_query.nesting() + sub_query.variables.len())
        .sum()
}

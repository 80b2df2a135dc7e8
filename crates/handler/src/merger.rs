use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use graphfed_planner::{FederationError, MergeStrategy, Response, Result, ServerError};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use value::{ConstValue, Name};

use crate::ServiceResponse;

pub const DEFAULT_MAX_MERGE_DEPTH: usize = 10;

fn default_max_depth() -> usize {
    DEFAULT_MAX_MERGE_DEPTH
}

/// What to do when two services return different values for one field.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    First,
    Last,
    Merge,
    Error,
}

/// How an incoming `null` is treated when the field already has a value.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullPolicy {
    /// Keep the existing value.
    #[default]
    Skip,
    /// Resolve like any other value.
    Keep,
    /// Replace the existing value.
    Override,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergerConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub null_policy: NullPolicy,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_MERGE_DEPTH,
            conflict_policy: ConflictPolicy::default(),
            null_policy: NullPolicy::default(),
        }
    }
}

/// Custom resolution of conflicting values for one field name.
pub trait FieldMerger: Send + Sync {
    fn merge(&self, field: &str, existing: &ConstValue, incoming: &ConstValue) -> Result<ConstValue>;
}

/// Combines the responses of the services into the response of the gateway.
#[derive(Clone, Default)]
pub struct ResponseMerger {
    config: MergerConfig,
    field_mergers: HashMap<String, Arc<dyn FieldMerger>>,
}

impl Debug for ResponseMerger {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseMerger")
            .field("config", &self.config)
            .field("field_mergers", &self.field_mergers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResponseMerger {
    pub fn new(config: MergerConfig) -> Self {
        Self {
            config,
            field_mergers: Default::default(),
        }
    }

    pub fn field_merger(mut self, field: impl Into<String>, merger: impl FieldMerger + 'static) -> Self {
        self.field_mergers.insert(field.into(), Arc::new(merger));
        self
    }

    #[inline]
    pub fn config(&self) -> &MergerConfig {
        &self.config
    }

    pub fn merge(&self, responses: &[ServiceResponse], strategy: MergeStrategy) -> Result<Response> {
        if responses.is_empty() {
            return Ok(Response::default());
        }

        let mut data = ConstValue::Null;
        for response in responses {
            if matches!(response.data, ConstValue::Null) {
                continue;
            }
            data = match strategy {
                MergeStrategy::Shallow => self.merge_shallow(data, &response.data)?,
                MergeStrategy::Deep => self.merge_deep("data", data, &response.data, 0)?,
            };
        }

        let mut extensions: IndexMap<String, ConstValue> = IndexMap::new();
        for response in responses {
            for (name, value) in &response.extensions {
                let merged = match extensions.get(name) {
                    Some(existing) => self.resolve_conflict(name, existing, value, 0)?,
                    None => value.clone(),
                };
                extensions.insert(name.clone(), merged);
            }
        }
        if strategy == MergeStrategy::Deep {
            extensions.insert("merge_metadata".to_string(), merge_metadata(responses));
        }

        tracing::debug!(
            responses = responses.len(),
            strategy = %strategy,
            "Merged service responses"
        );

        Ok(Response {
            data,
            errors: merge_errors(responses),
            extensions,
            headers: None,
        })
    }

    fn merge_shallow(&self, data: ConstValue, incoming: &ConstValue) -> Result<ConstValue> {
        match (data, incoming) {
            (ConstValue::Object(mut object), ConstValue::Object(fields)) => {
                for (name, value) in fields {
                    self.insert_field(&mut object, name, value, 0, false)?;
                }
                Ok(ConstValue::Object(object))
            },
            (ConstValue::Null, incoming) => Ok(incoming.clone()),
            (existing, incoming) => self.resolve_conflict("data", &existing, incoming, 0),
        }
    }

    fn merge_deep(&self, field: &str, existing: ConstValue, incoming: &ConstValue, depth: usize) -> Result<ConstValue> {
        if depth > self.config.max_depth {
            return Err(FederationError::Merge(format!(
                "maximum merge depth of {} exceeded at field '{field}'",
                self.config.max_depth
            )));
        }

        match (existing, incoming) {
            (ConstValue::Null, incoming) => Ok(incoming.clone()),
            (ConstValue::Object(mut object), ConstValue::Object(fields)) => {
                for (name, value) in fields {
                    self.insert_field(&mut object, name, value, depth + 1, true)?;
                }
                Ok(ConstValue::Object(object))
            },
            (ConstValue::List(existing), ConstValue::List(incoming)) => Ok(concat_unique(existing, incoming)),
            (existing, incoming) => self.resolve_conflict(field, &existing, incoming, depth),
        }
    }

    fn insert_field(
        &self,
        object: &mut IndexMap<Name, ConstValue>,
        name: &Name,
        value: &ConstValue,
        depth: usize,
        deep: bool,
    ) -> Result<()> {
        let Some(existing) = object.get_mut(name) else {
            object.insert(name.clone(), value.clone());
            return Ok(());
        };

        if matches!(value, ConstValue::Null) {
            match self.config.null_policy {
                NullPolicy::Skip => return Ok(()),
                NullPolicy::Override => {
                    *existing = ConstValue::Null;
                    return Ok(());
                },
                NullPolicy::Keep => {},
            }
        }

        let current = std::mem::take(existing);
        *existing = match deep && !self.field_mergers.contains_key(name.as_str()) {
            true => self.merge_deep(name, current, value, depth)?,
            false => self.resolve_conflict(name, &current, value, depth)?,
        };
        Ok(())
    }

    /// Pick the value of a field present in two responses.
    pub fn resolve_conflict(
        &self,
        field: &str,
        existing: &ConstValue,
        incoming: &ConstValue,
        depth: usize,
    ) -> Result<ConstValue> {
        if let Some(merger) = self.field_mergers.get(field) {
            return merger.merge(field, existing, incoming);
        }

        match self.config.conflict_policy {
            ConflictPolicy::First => Ok(existing.clone()),
            ConflictPolicy::Last => Ok(incoming.clone()),
            ConflictPolicy::Error if existing == incoming => Ok(existing.clone()),
            ConflictPolicy::Error => Err(FederationError::Merge(format!(
                "conflicting values for field '{field}'"
            ))),
            ConflictPolicy::Merge => self.attempt_merge(field, existing, incoming, depth),
        }
    }

    fn attempt_merge(&self, field: &str, existing: &ConstValue, incoming: &ConstValue, depth: usize) -> Result<ConstValue> {
        match (existing, incoming) {
            (ConstValue::Object(_), ConstValue::Object(_)) => {
                self.merge_deep(field, existing.clone(), incoming, depth + 1)
            },
            (ConstValue::List(existing), ConstValue::List(incoming)) => {
                Ok(concat_unique(existing.clone(), incoming))
            },
            (ConstValue::String(a), ConstValue::String(b)) if a == b => Ok(existing.clone()),
            (ConstValue::String(a), ConstValue::String(b)) => Ok(ConstValue::String(format!("{a} {b}"))),
            (ConstValue::Number(a), ConstValue::Number(b)) => Ok(ConstValue::Number(sum(a, b))),
            _ => Ok(incoming.clone()),
        }
    }
}

fn sum(a: &serde_json::Number, b: &serde_json::Number) -> serde_json::Number {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return sum.into();
        }
    }
    let sum = a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default();
    serde_json::Number::from_f64(sum).unwrap_or_else(|| 0.into())
}

/// Concatenate two lists, dropping structurally equal elements.
fn concat_unique(existing: Vec<ConstValue>, incoming: &[ConstValue]) -> ConstValue {
    let mut seen = IndexSet::new();
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    for value in existing.into_iter().chain(incoming.iter().cloned()) {
        if seen.insert(canonical(&value)) {
            merged.push(value);
        }
    }
    ConstValue::List(merged)
}

/// Serialization of a value that does not depend on object key order.
fn canonical(value: &ConstValue) -> String {
    match value {
        ConstValue::Object(object) => {
            let mut fields: Vec<_> = object.iter().collect();
            fields.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
            let fields: Vec<String> = fields
                .into_iter()
                .map(|(name, value)| format!("{name}:{}", canonical(value)))
                .collect();
            format!("{{{}}}", fields.join(","))
        },
        ConstValue::List(values) => {
            let values: Vec<String> = values.iter().map(canonical).collect();
            format!("[{}]", values.join(","))
        },
        value => value.to_string(),
    }
}

fn severity_rank(code: Option<&str>) -> u8 {
    match code {
        Some("INTERNAL_ERROR") => 100,
        Some("SERVICE_ERROR") => 90,
        Some("VALIDATION_ERROR") => 80,
        Some("AUTHORIZATION_ERROR") => 70,
        Some("RATE_LIMIT_ERROR") => 60,
        _ => 50,
    }
}

/// Transport failures and service errors, de-duplicated and most severe first.
fn merge_errors(responses: &[ServiceResponse]) -> Vec<ServerError> {
    let mut seen = IndexSet::new();
    let mut errors = Vec::new();

    for response in responses {
        let service = response.service_name.as_str();
        let transport = response.error.iter().map(|err| {
            ServerError::new(format!("Service {service} error: {err}"))
                .extension("code", "SERVICE_ERROR")
                .extension("service", service)
        });
        let returned = response.errors.iter().map(|err| {
            let mut err = err.clone();
            if !err.extensions.contains_key("service") {
                err.extensions.insert("service".to_string(), ConstValue::String(service.to_string()));
            }
            err
        });

        for err in transport.chain(returned) {
            if seen.insert((err.message.clone(), err.code().map(ToString::to_string))) {
                errors.push(err);
            }
        }
    }

    errors.sort_by_key(|err| std::cmp::Reverse(severity_rank(err.code())));
    errors
}

fn merge_metadata(responses: &[ServiceResponse]) -> ConstValue {
    let services: IndexSet<&str> = responses.iter().map(|response| response.service_name.as_str()).collect();
    let mut metadata = IndexMap::new();
    metadata.insert(
        Name::new("services"),
        ConstValue::List(services.into_iter().map(|service| ConstValue::String(service.to_string())).collect()),
    );
    metadata.insert(Name::new("responseCount"), ConstValue::from(responses.len() as u64));
    metadata.insert(Name::new("strategy"), ConstValue::String(MergeStrategy::Deep.to_string()));
    ConstValue::Object(metadata)
}

use std::collections::BTreeSet;

use graphfed_schema::FederatedEntity;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use value::{ConstValue, Name};

use crate::{
    plan::{DEFAULT_RETRY_COUNT, DEFAULT_SUB_QUERY_TIMEOUT},
    DependencyGraph,
    ExecutionPlan,
    FederationError,
    MergeStrategy,
    ParsedQuery,
    PlanMetadata,
    Result,
    SubQuery,
};

/// Name of the variable carrying entity representations.
pub const REPRESENTATIONS_VARIABLE: &str = "representations";

/// How one entity type is fetched from its owning service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityResolution {
    pub type_name: String,
    pub service_name: String,
    pub key_fields: Vec<String>,
    pub query: String,
}

/// A `{__typename, <key fields>}` object identifying one entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepresentationRequest {
    #[serde(rename = "__typename")]
    pub type_name: String,
    #[serde(flatten)]
    pub fields: IndexMap<Name, ConstValue>,
}

impl RepresentationRequest {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Default::default(),
        }
    }

    pub fn field(mut self, name: impl AsRef<str>, value: impl Into<ConstValue>) -> Self {
        self.fields.insert(Name::new(name), value.into());
        self
    }

    /// Read a representation from a GraphQL object value.
    pub fn from_value(value: &ConstValue) -> Result<Self> {
        let ConstValue::Object(object) = value else {
            return Err(FederationError::Validation("representation must be an object".to_string()));
        };
        let type_name = match object.get("__typename") {
            Some(ConstValue::String(type_name)) => type_name.clone(),
            _ => {
                return Err(FederationError::Validation(
                    "representation is missing __typename".to_string(),
                ))
            }
        };
        let fields = object
            .iter()
            .filter(|(name, _)| name.as_str() != "__typename")
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Ok(Self { type_name, fields })
    }

    pub fn to_value(&self) -> ConstValue {
        let mut object = IndexMap::with_capacity(self.fields.len() + 1);
        object.insert(Name::new("__typename"), ConstValue::String(self.type_name.clone()));
        object.extend(self.fields.iter().map(|(name, value)| (name.clone(), value.clone())));
        ConstValue::Object(object)
    }

    /// Check the representation carries every key field of `entity`.
    pub fn validate(&self, entity: &FederatedEntity) -> Result<()> {
        if self.type_name.is_empty() {
            return Err(FederationError::Validation(
                "representation is missing __typename".to_string(),
            ));
        }
        if self.type_name != entity.type_name {
            return Err(FederationError::Validation(format!(
                "representation type {} does not match entity {}",
                self.type_name, entity.type_name
            )));
        }
        for key in entity.key_fields() {
            if !self.fields.contains_key(key.as_str()) {
                return Err(FederationError::Validation(format!(
                    "missing required key field '{key}' for entity {}",
                    entity.type_name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationPlan {
    pub entities: Vec<EntityResolution>,
    pub representations: Vec<RepresentationRequest>,
    pub required_services: Vec<String>,
    pub dependency_order: Vec<String>,
}

/// Plans `_entities` lookups for federated types.
#[derive(Debug, Default, Copy, Clone)]
pub struct EntityPlanner;

impl EntityPlanner {
    pub fn new() -> Self {
        Self
    }

    #[instrument(err(Debug), skip_all, level = "trace")]
    pub fn plan_entity_resolution(&self, entities: &[FederatedEntity], query: &ParsedQuery) -> Result<FederationPlan> {
        let resolutions = entities
            .iter()
            .map(|entity| self.build_entity_resolution(entity))
            .collect::<Result<Vec<_>>>()?;

        let representations = match query.variables.get(REPRESENTATIONS_VARIABLE) {
            Some(ConstValue::List(values)) => values
                .iter()
                .map(RepresentationRequest::from_value)
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };

        let required_services = entities
            .iter()
            .map(|entity| entity.service_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Ok(FederationPlan {
            entities: resolutions,
            representations,
            required_services,
            dependency_order: self.analyze_dependencies(entities)?,
        })
    }

    pub fn build_entity_resolution(&self, entity: &FederatedEntity) -> Result<EntityResolution> {
        let key_fields = entity.key_fields();
        if key_fields.is_empty() {
            return Err(FederationError::Planning(format!(
                "entity {} has no key fields",
                entity.type_name
            )));
        }

        Ok(EntityResolution {
            type_name: entity.type_name.clone(),
            service_name: entity.service_name.clone(),
            key_fields,
            query: entities_query(entity),
        })
    }

    /// The `_entities` query fetching `entity` for a batch of representations.
    pub fn build_representation_query(
        &self,
        entity: &FederatedEntity,
        representations: &[RepresentationRequest],
    ) -> Result<String> {
        if representations.is_empty() {
            return Err(FederationError::Planning(format!(
                "no representations to resolve for entity {}",
                entity.type_name
            )));
        }
        Ok(entities_query(entity))
    }

    /// Services ordered so that `@requires` providers come before their dependents.
    pub fn analyze_dependencies(&self, entities: &[FederatedEntity]) -> Result<Vec<String>> {
        dependency_graph(entities).topological_order()
    }

    /// Keep resolutions of one service next to each other, providers before their dependents.
    pub fn optimize_federation_plan(&self, plan: FederationPlan) -> FederationPlan {
        let mut by_service: IndexMap<String, Vec<EntityResolution>> = IndexMap::new();
        for resolution in plan.entities {
            by_service
                .entry(resolution.service_name.clone())
                .or_default()
                .push(resolution);
        }
        let position = |service: &str| {
            plan.dependency_order
                .iter()
                .position(|name| name == service)
                .unwrap_or(usize::MAX)
        };
        by_service.sort_by_cached_key(|service, _| position(service.as_str()));
        FederationPlan {
            entities: by_service.into_values().flatten().collect(),
            ..plan
        }
    }

    #[instrument(err(Debug), skip_all, level = "trace")]
    pub fn create_federation_execution_plan(
        &self,
        query: &ParsedQuery,
        entities: &[FederatedEntity],
    ) -> Result<ExecutionPlan> {
        if entities.is_empty() {
            return Err(FederationError::Planning("no federated entities provided".to_string()));
        }

        let plan = self.optimize_federation_plan(self.plan_entity_resolution(entities, query)?);
        let sub_queries: Vec<SubQuery> = plan
            .entities
            .iter()
            .map(|resolution| {
                let representations = plan
                    .representations
                    .iter()
                    .filter(|representation| representation.type_name == resolution.type_name)
                    .map(RepresentationRequest::to_value)
                    .collect();
                let mut variables = value::Variables::default();
                variables.insert(Name::new(REPRESENTATIONS_VARIABLE), ConstValue::List(representations));
                SubQuery {
                    service_name: resolution.service_name.clone(),
                    query: resolution.query.clone(),
                    variables,
                    path: vec![resolution.type_name.clone()],
                    timeout: DEFAULT_SUB_QUERY_TIMEOUT,
                    retry_count: DEFAULT_RETRY_COUNT,
                }
            })
            .collect();

        let metadata = PlanMetadata {
            total_fields: query.field_paths().len(),
            total_services: plan.required_services.len(),
            complexity: crate::plan::plan_complexity(&sub_queries),
            original_sub_queries: sub_queries.len(),
            optimized_sub_queries: sub_queries.len(),
            ..Default::default()
        };

        tracing::debug!(
            entities = entities.len(),
            sub_queries = sub_queries.len(),
            "Built federation execution plan"
        );

        Ok(ExecutionPlan {
            sub_queries,
            dependencies: dependency_graph(entities).to_dependencies(),
            merge_strategy: MergeStrategy::Deep,
            metadata,
        })
    }
}

fn entities_query(entity: &FederatedEntity) -> String {
    let fields: Vec<&str> = entity.resolvable_fields().map(|field| field.name.as_str()).collect();
    format!(
        "query($representations: [_Any!]!) {{ _entities(representations: $representations) {{ ... on {} {{ {} }} }} }}",
        entity.type_name,
        fields.join(" ")
    )
}

/// A field's `@requires` makes its service depend on whichever other service exposes the
/// required field of the same type without `@external`.
fn dependency_graph(entities: &[FederatedEntity]) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for entity in entities {
        graph.add_node(entity.service_name.as_str());
    }

    for entity in entities {
        let required = entity
            .fields
            .iter()
            .filter_map(|field| field.directives.requires.as_ref())
            .flat_map(|requires| requires.field_names());
        for field_name in required {
            if let Some(provider) = field_provider(entities, &entity.type_name, field_name) {
                if provider != entity.service_name {
                    graph.add_dependency(&entity.service_name, provider);
                }
            }
        }
    }

    graph
}

fn field_provider<'a>(entities: &'a [FederatedEntity], type_name: &str, field_name: &str) -> Option<&'a str> {
    entities
        .iter()
        .filter(|entity| entity.type_name == type_name)
        .find(|entity| {
            entity
                .field(field_name)
                .map(|field| !field.is_external())
                .unwrap_or_default()
        })
        .map(|entity| entity.service_name.as_str())
}

#[cfg(test)]
mod tests {
    use graphfed_schema::extract_entities;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{QueryAnalyzer, Request};

    const USERS_SDL: &str = r#"
        type User @key(fields: "id") {
            id: ID!
            name: String
            email: String
        }
    "#;

    const REVIEWS_SDL: &str = r#"
        extend type User @key(fields: "id") {
            id: ID! @external
            email: String @external
            reviewCount: Int @requires(fields: "email")
        }
    "#;

    fn entities() -> Vec<FederatedEntity> {
        let mut entities = extract_entities("reviews", REVIEWS_SDL).unwrap();
        entities.extend(extract_entities("users", USERS_SDL).unwrap());
        entities
    }

    fn query() -> ParsedQuery {
        QueryAnalyzer::new().analyze(&Request::new("{ me { id } }")).unwrap()
    }

    #[test]
    fn entity_query_skips_external_fields() {
        let entities = entities();
        let resolution = EntityPlanner::new().build_entity_resolution(&entities[0]).unwrap();
        assert_eq!(resolution.key_fields, vec!["id".to_string()]);
        assert_eq!(
            resolution.query,
            "query($representations: [_Any!]!) { _entities(representations: $representations) { ... on User { id reviewCount } } }"
        );
    }

    #[test]
    fn entity_without_keys() {
        let entity = FederatedEntity {
            type_name: "Thing".to_string(),
            service_name: "things".to_string(),
            directives: Default::default(),
            fields: vec![],
        };
        let err = EntityPlanner::new().build_entity_resolution(&entity).unwrap_err();
        assert_eq!(err.code(), "PLANNING_FAILED");
    }

    #[test]
    fn requires_orders_providers_first() {
        let entities = entities();
        let order = EntityPlanner::new().analyze_dependencies(&entities).unwrap();
        assert_eq!(order, vec!["users".to_string(), "reviews".to_string()]);
    }

    #[test]
    fn representation_query_needs_representations() {
        let entities = entities();
        let planner = EntityPlanner::new();
        assert!(planner.build_representation_query(&entities[1], &[]).is_err());
        let query = planner
            .build_representation_query(&entities[1], &[RepresentationRequest::new("User").field("id", "1")])
            .unwrap();
        assert!(query.contains("... on User { id name email }"));
    }

    #[test]
    fn representation_validation() {
        let entities = entities();
        let user = &entities[1];
        assert!(RepresentationRequest::new("User").field("id", "1").validate(user).is_ok());
        assert_eq!(
            RepresentationRequest::new("User").field("name", "a").validate(user),
            Err(FederationError::Validation(
                "missing required key field 'id' for entity User".to_string()
            ))
        );
        assert!(RepresentationRequest::new("Product").field("id", "1").validate(user).is_err());
    }

    #[test]
    fn federation_plan() {
        let planner = EntityPlanner::new();
        let plan = planner.plan_entity_resolution(&entities(), &query()).unwrap();
        assert_eq!(plan.required_services, vec!["reviews".to_string(), "users".to_string()]);
        assert_eq!(plan.dependency_order, vec!["users".to_string(), "reviews".to_string()]);
        assert!(plan.representations.is_empty());
    }

    #[test]
    fn optimized_plan_groups_services_in_dependency_order() {
        let planner = EntityPlanner::new();
        let plan = planner.plan_entity_resolution(&entities(), &query()).unwrap();
        assert_eq!(plan.entities[0].service_name, "reviews");

        let plan = planner.optimize_federation_plan(plan);
        assert_eq!(
            plan.entities
                .iter()
                .map(|resolution| resolution.service_name.as_str())
                .collect::<Vec<_>>(),
            vec!["users", "reviews"]
        );
    }

    #[test]
    fn federation_execution_plan() {
        let plan = EntityPlanner::new()
            .create_federation_execution_plan(&query(), &entities())
            .unwrap();
        assert_eq!(plan.merge_strategy, MergeStrategy::Deep);
        assert_eq!(
            plan.sub_queries
                .iter()
                .map(|sub_query| sub_query.service_name.as_str())
                .collect::<Vec<_>>(),
            vec!["users", "reviews"]
        );
        assert_eq!(plan.sub_queries[0].path, vec!["User".to_string()]);
        assert_eq!(plan.sub_queries[0].timeout, DEFAULT_SUB_QUERY_TIMEOUT);
        assert_eq!(plan.dependencies["reviews"], vec!["users".to_string()]);
    }

    #[test]
    fn representations_from_variables() {
        let mut variables = value::Variables::default();
        variables.insert(
            Name::new(REPRESENTATIONS_VARIABLE),
            ConstValue::List(vec![RepresentationRequest::new("User").field("id", "7").to_value()]),
        );
        let query = QueryAnalyzer::new()
            .analyze(&Request::new("{ me { id } }").variables(variables))
            .unwrap();
        let plan = EntityPlanner::new().plan_entity_resolution(&entities(), &query).unwrap();
        assert_eq!(plan.representations, vec![RepresentationRequest::new("User").field("id", "7")]);
    }
}

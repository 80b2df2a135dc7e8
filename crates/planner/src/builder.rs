use graphfed_schema::SchemaSnapshot;
use indexmap::IndexMap;
use parser::{types::Field, Positioned};
use tracing::instrument;

use crate::{
    plan::{choose_merge_strategy, plan_complexity, DEFAULT_RETRY_COUNT, DEFAULT_SUB_QUERY_TIMEOUT},
    printer::QueryPrinter,
    DependencyGraph,
    ExecutionPlan,
    FederationConfig,
    FederationError,
    OwnershipResolver,
    ParsedQuery,
    PlanMetadata,
    Result,
    SubQuery,
};

/// Query plan builder
pub struct PlanBuilder<'a> {
    config: &'a FederationConfig,
    registry: Option<&'a SchemaSnapshot>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(config: &'a FederationConfig) -> Self {
        Self { config, registry: None }
    }

    /// Resolve ownership and `@requires` edges from registered schemas.
    pub fn registry(self, registry: &'a SchemaSnapshot) -> Self {
        Self {
            registry: Some(registry),
            ..self
        }
    }

    /// Split the query into one sub-query per owning service, providers first.
    #[instrument(err(Debug), skip_all, level = "trace")]
    pub fn plan(&self, query: &ParsedQuery) -> Result<ExecutionPlan> {
        let root_fields = query.root_fields();
        if root_fields.is_empty() {
            return Err(FederationError::Planning("query selects no fields".to_string()));
        }

        let mut resolver = OwnershipResolver::new(&self.config.services);
        if let Some(registry) = self.registry {
            resolver = resolver.registry(registry);
        }

        let mut fields_by_service: IndexMap<&str, Vec<&Positioned<Field>>> = IndexMap::new();
        for field in root_fields {
            let name = field.node.name.node.as_str();
            let service = resolver.resolve(name).ok_or_else(|| {
                FederationError::Planning(format!("no service available for field '{name}'"))
            })?;
            fields_by_service.entry(service.name.as_str()).or_default().push(field);
        }

        let graph = self.dependency_graph(fields_by_service.keys().copied());
        let order = graph.topological_order()?;

        let mut sub_queries = Vec::with_capacity(order.len());
        for service_name in &order {
            let Some(fields) = fields_by_service.get(service_name.as_str()) else {
                continue;
            };
            let service = self
                .config
                .service(service_name)
                .ok_or_else(|| FederationError::ServiceNotFound(service_name.clone()))?;

            let printed = QueryPrinter::new(&query.fragments).print_operation(
                query.operation_type,
                query.operation_name.as_deref(),
                &query.operation.variable_definitions,
                fields,
                &query.variables,
            )?;

            let timeout = match service.timeout.is_zero() {
                true => DEFAULT_SUB_QUERY_TIMEOUT,
                false => service.timeout,
            };

            sub_queries.push(SubQuery {
                service_name: service_name.clone(),
                query: printed.query,
                variables: printed.variables,
                path: vec![service_name.clone()],
                timeout,
                retry_count: DEFAULT_RETRY_COUNT,
            });
        }

        let metadata = PlanMetadata {
            total_fields: query.field_paths().len(),
            total_services: sub_queries.len(),
            complexity: plan_complexity(&sub_queries),
            original_sub_queries: sub_queries.len(),
            optimized_sub_queries: sub_queries.len(),
            ..Default::default()
        };

        let plan = ExecutionPlan {
            merge_strategy: choose_merge_strategy(&sub_queries),
            dependencies: graph.to_dependencies(),
            sub_queries,
            metadata,
        };

        tracing::debug!(
            sub_queries = plan.sub_queries.len(),
            merge_strategy = %plan.merge_strategy,
            complexity = plan.metadata.complexity,
            "Built execution plan"
        );
        Ok(plan)
    }

    fn dependency_graph<'b>(&self, services: impl Iterator<Item = &'b str>) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for service in services {
            graph.add_node(service);
        }
        graph.apply_business_rules();

        if let Some(registry) = self.registry {
            for (provider, dependent) in registry.requires_edges() {
                let present = graph.nodes().any(|node| node == provider) && graph.nodes().any(|node| node == dependent);
                if present {
                    graph.add_dependency(&dependent, &provider);
                }
            }
        }

        graph
    }
}

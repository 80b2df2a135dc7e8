use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};
use tracing::instrument;

use crate::{
    plan::{choose_merge_strategy, plan_complexity},
    printer::{assemble_operation, print_variable_definition, QueryPrinter},
    ExecutionPlan,
    FederationError,
    QueryAnalyzer,
    Request,
    Result,
    SubQuery,
};

pub const DEFAULT_MAX_BATCH_SIZE: usize = 5;
pub const DEFAULT_COMPLEXITY_THRESHOLD: usize = 10;

/// Rewrites an execution plan into fewer, correctly ordered sub-queries.
#[derive(Debug, Copy, Clone)]
pub struct PlanOptimizer {
    max_batch_size: usize,
    complexity_threshold: usize,
}

impl Default for PlanOptimizer {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            complexity_threshold: DEFAULT_COMPLEXITY_THRESHOLD,
        }
    }
}

impl PlanOptimizer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn max_batch_size(self, max_batch_size: usize) -> Self {
        Self { max_batch_size, ..self }
    }

    pub fn complexity_threshold(self, complexity_threshold: usize) -> Self {
        Self {
            complexity_threshold,
            ..self
        }
    }

    /// Merge same-service sub-queries, order providers first, then batch similar queries.
    #[instrument(err(Debug), skip_all, level = "trace")]
    pub fn optimize(&self, plan: &ExecutionPlan) -> Result<ExecutionPlan> {
        let original = plan.sub_queries.len();

        let merged = self.merge_same_service(&plan.sub_queries)?;
        let reordered = self.reorder(merged, &plan.dependencies);
        let sub_queries = self.batch(reordered)?;

        let services: IndexSet<&str> = sub_queries.iter().map(|sub_query| sub_query.service_name.as_str()).collect();
        let mut metadata = plan.metadata.clone();
        metadata.total_services = services.len();
        metadata.complexity = plan_complexity(&sub_queries);
        metadata.optimized = true;
        metadata.original_sub_queries = original;
        metadata.optimized_sub_queries = sub_queries.len();

        tracing::debug!(
            original = original,
            optimized = sub_queries.len(),
            "Optimized execution plan"
        );

        Ok(ExecutionPlan {
            merge_strategy: match sub_queries.len() == original {
                true => plan.merge_strategy,
                false => choose_merge_strategy(&sub_queries),
            },
            dependencies: plan.dependencies.clone(),
            sub_queries,
            metadata,
        })
    }

    /// Union the sub-queries addressed to the same service, keeping first-seen order.
    pub fn merge_same_service(&self, sub_queries: &[SubQuery]) -> Result<Vec<SubQuery>> {
        let mut groups: IndexMap<&str, Vec<&SubQuery>> = IndexMap::new();
        for sub_query in sub_queries {
            groups.entry(sub_query.service_name.as_str()).or_default().push(sub_query);
        }

        groups
            .into_values()
            .map(|group| match group.as_slice() {
                [single] => Ok((*single).clone()),
                group => merge_sub_queries(group),
            })
            .collect()
    }

    /// Order sub-queries so every service follows the services it depends on.
    ///
    /// A cycle leaves the input order untouched.
    pub fn reorder(&self, sub_queries: Vec<SubQuery>, dependencies: &IndexMap<String, Vec<String>>) -> Vec<SubQuery> {
        fn visit<'a>(
            service: &'a str,
            dependencies: &'a IndexMap<String, Vec<String>>,
            visiting: &mut HashSet<&'a str>,
            visited: &mut IndexSet<&'a str>,
        ) -> bool {
            if visited.contains(service) {
                return true;
            }
            if !visiting.insert(service) {
                return false;
            }
            for provider in dependencies.get(service).into_iter().flatten() {
                if !visit(provider, dependencies, visiting, visited) {
                    return false;
                }
            }
            visiting.remove(service);
            visited.insert(service);
            true
        }

        let mut visiting = HashSet::new();
        let mut visited = IndexSet::new();
        for sub_query in &sub_queries {
            if !visit(&sub_query.service_name, dependencies, &mut visiting, &mut visited) {
                tracing::warn!(
                    service = %sub_query.service_name,
                    "Circular dependency while reordering sub-queries, keeping the original order"
                );
                return sub_queries;
            }
        }

        let order: IndexMap<String, usize> = visited
            .iter()
            .enumerate()
            .map(|(index, service)| (service.to_string(), index))
            .collect();
        let mut sub_queries = sub_queries;
        sub_queries.sort_by_key(|sub_query| order.get(&sub_query.service_name).copied().unwrap_or(usize::MAX));
        sub_queries
    }

    /// Merge groups of similar plain queries into single requests.
    pub fn batch(&self, sub_queries: Vec<SubQuery>) -> Result<Vec<SubQuery>> {
        let mut assigned = vec![false; sub_queries.len()];
        let mut result = Vec::with_capacity(sub_queries.len());

        for index in 0..sub_queries.len() {
            if assigned[index] {
                continue;
            }
            assigned[index] = true;

            let mut group = vec![&sub_queries[index]];
            for other in index + 1..sub_queries.len() {
                if group.len() >= self.max_batch_size {
                    break;
                }
                if !assigned[other] && self.is_similar(&sub_queries[index], &sub_queries[other]) {
                    assigned[other] = true;
                    group.push(&sub_queries[other]);
                }
            }

            let batchable = group.len() >= 2 && group.iter().all(|sub_query| sub_query.operation_keyword() == "query");
            if batchable {
                tracing::debug!(
                    service = %group[0].service_name,
                    size = group.len(),
                    "Batched similar sub-queries"
                );
                result.push(merge_sub_queries(&group)?);
            } else {
                result.extend(group.into_iter().cloned());
            }
        }

        Ok(result)
    }

    /// Same service and operation, small enough, and a comparable number of variables.
    pub fn is_similar(&self, a: &SubQuery, b: &SubQuery) -> bool {
        if a.service_name != b.service_name || a.operation_keyword() != b.operation_keyword() {
            return false;
        }
        if text_complexity(&a.query) > self.complexity_threshold || text_complexity(&b.query) > self.complexity_threshold {
            return false;
        }

        let (a_len, b_len) = (a.variables.len(), b.variables.len());
        if a_len == 0 && b_len == 0 {
            return true;
        }
        let (min, max) = (a_len.min(b_len), a_len.max(b_len));
        min as f64 / max as f64 >= 0.5
    }
}

fn text_complexity(query: &str) -> usize {
    2 * query.matches('{').count() + query.matches('(').count() + query.matches("[]").count()
}

/// Union several sub-queries into one: root selections, variable definitions, values and paths.
fn merge_sub_queries(group: &[&SubQuery]) -> Result<SubQuery> {
    let Some(first) = group.first() else {
        return Err(FederationError::Internal("cannot merge an empty group".to_string()));
    };

    let analyzer = QueryAnalyzer::new();
    let parsed = group
        .iter()
        .map(|sub_query| {
            analyzer.analyze(&Request::new(sub_query.query.clone()).variables(sub_query.variables.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut fields: IndexSet<String> = IndexSet::new();
    let mut definitions: IndexMap<String, String> = IndexMap::new();
    for query in &parsed {
        let mut printer = QueryPrinter::new(&query.fragments);
        for field in query.root_fields() {
            fields.insert(printer.print_field(&field.node)?);
        }
        for definition in &query.operation.variable_definitions {
            let name = definition.node.name.node.to_string();
            if !definitions.contains_key(&name) {
                definitions.insert(name, print_variable_definition(&definition.node)?);
            }
        }
    }

    let operation_type = parsed[0].operation_type;
    let name = parsed[0].operation_name.as_deref().filter(|name| {
        parsed
            .iter()
            .all(|query| query.operation_name.as_deref() == Some(*name))
    });
    let definitions: Vec<String> = definitions.into_values().collect();
    let fields: Vec<String> = fields.into_iter().collect();

    let mut merged = SubQuery {
        service_name: first.service_name.clone(),
        query: assemble_operation(operation_type, name, &definitions, &fields),
        variables: first.variables.clone(),
        path: first.path.clone(),
        timeout: first.timeout,
        retry_count: first.retry_count,
    };

    for sub_query in &group[1..] {
        for (name, value) in sub_query.variables.iter() {
            if !merged.variables.contains_key(name) {
                merged.variables.insert(name.clone(), value.clone());
            }
        }
        for segment in &sub_query.path {
            if !merged.path.contains(segment) {
                merged.path.push(segment.clone());
            }
        }
        merged.timeout = merged.timeout.max(sub_query.timeout);
        merged.retry_count = merged.retry_count.max(sub_query.retry_count);
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use value::{ConstValue, Name, Variables};

    use super::*;

    fn variables(names: &[&str]) -> Variables {
        let mut variables = Variables::default();
        for name in names {
            variables.insert(Name::new(name), ConstValue::from(1));
        }
        variables
    }

    #[test]
    fn same_service_queries_are_merged() {
        let sub_queries = vec![
            SubQuery::new("users", "query ($id: ID) { user(id: $id) { id } }")
                .variables(variables(&["id"]))
                .timeout(Duration::from_secs(5)),
            SubQuery::new("products", "query { products { upc } }"),
            SubQuery::new("users", "query { me { id } user(id: $id) { id } }").timeout(Duration::from_secs(10)),
        ];

        let merged = PlanOptimizer::new().merge_same_service(&sub_queries).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].query, "query ($id: ID) { user(id: $id) { id } me { id } }");
        assert_eq!(merged[0].timeout, Duration::from_secs(10));
        assert_eq!(merged[0].variables.len(), 1);
        assert_eq!(merged[1].service_name, "products");
    }

    #[test]
    fn reorder_puts_providers_first() {
        let mut dependencies = IndexMap::new();
        dependencies.insert("orders".to_string(), vec!["users".to_string()]);

        let sub_queries = vec![SubQuery::new("orders", "{ orders }"), SubQuery::new("users", "{ users }")];
        let reordered = PlanOptimizer::new().reorder(sub_queries, &dependencies);
        let services: Vec<_> = reordered.iter().map(|sub_query| sub_query.service_name.as_str()).collect();
        assert_eq!(services, vec!["users", "orders"]);
    }

    #[test]
    fn reorder_keeps_input_order_on_cycles() {
        let mut dependencies = IndexMap::new();
        dependencies.insert("a".to_string(), vec!["b".to_string()]);
        dependencies.insert("b".to_string(), vec!["a".to_string()]);

        let sub_queries = vec![SubQuery::new("b", "{ b }"), SubQuery::new("a", "{ a }")];
        let reordered = PlanOptimizer::new().reorder(sub_queries.clone(), &dependencies);
        assert_eq!(reordered, sub_queries);
    }

    #[test]
    fn similar_queries_are_batched() {
        let sub_queries = vec![
            SubQuery::new("users", "query { a }"),
            SubQuery::new("users", "query { b }"),
            SubQuery::new("users", "mutation { c }"),
            SubQuery::new("products", "query { d }"),
        ];

        let batched = PlanOptimizer::new().batch(sub_queries).unwrap();
        let queries: Vec<_> = batched.iter().map(|sub_query| sub_query.query.as_str()).collect();
        assert_eq!(queries, vec!["query { a b }", "mutation { c }", "query { d }"]);
    }

    #[test]
    fn similarity_rules() {
        let optimizer = PlanOptimizer::new();
        let simple = SubQuery::new("users", "query { a }");

        let complex = SubQuery::new("users", "query { a { b { c { d { e { f } } } } } }");
        assert!(!optimizer.is_similar(&simple, &complex));

        let one = SubQuery::new("users", "query { a }").variables(variables(&["x"]));
        let three = SubQuery::new("users", "query { a }").variables(variables(&["x", "y", "z"]));
        assert!(!optimizer.is_similar(&one, &three));
        assert!(!optimizer.is_similar(&simple, &one));
        assert!(optimizer.is_similar(&simple, &SubQuery::new("users", "query { b }")));
    }

    #[test]
    fn optimize_records_metadata() {
        let plan = ExecutionPlan::new(vec![
            SubQuery::new("users", "query { a }"),
            SubQuery::new("users", "query { b }"),
        ]);
        let optimized = PlanOptimizer::new().optimize(&plan).unwrap();

        assert_eq!(optimized.sub_queries.len(), 1);
        assert!(optimized.metadata.optimized);
        assert_eq!(optimized.metadata.original_sub_queries, 2);
        assert_eq!(optimized.metadata.optimized_sub_queries, 1);
    }

    #[test]
    fn unparsable_queries_fail_optimization() {
        let plan = ExecutionPlan::new(vec![
            SubQuery::new("users", "query { a"),
            SubQuery::new("users", "query { b }"),
        ]);
        assert!(PlanOptimizer::new().optimize(&plan).is_err());
    }
}

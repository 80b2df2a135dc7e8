use crate::{DependencyGraph, ExecutionPlan, FederationError, Result};

/// Check that a plan can be executed as is.
pub fn validate_plan(plan: &ExecutionPlan) -> Result<()> {
    if plan.sub_queries.is_empty() {
        return Err(FederationError::Planning("execution plan has no sub-queries".to_string()));
    }

    for (index, sub_query) in plan.sub_queries.iter().enumerate() {
        if sub_query.service_name.is_empty() {
            return Err(FederationError::Planning(format!("sub-query {index} has no service name")));
        }
        if sub_query.query.trim().is_empty() {
            return Err(FederationError::Planning(format!(
                "sub-query {index} for service {} has an empty query",
                sub_query.service_name
            )));
        }
        if sub_query.timeout.is_zero() {
            return Err(FederationError::Planning(format!(
                "sub-query {index} for service {} has no timeout",
                sub_query.service_name
            )));
        }
    }

    for (service, providers) in &plan.dependencies {
        for provider in providers {
            if plan.sub_query(provider).is_none() {
                return Err(FederationError::Planning(format!(
                    "service {service} depends on non-existent service {provider}"
                )));
            }
        }
    }

    let graph = DependencyGraph::from_dependencies(plan.services(), &plan.dependencies);
    if let Some(service) = graph.find_cycle() {
        return Err(FederationError::Planning(format!(
            "circular dependency detected involving service {service}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::SubQuery;

    fn plan(edges: &[(&str, &str)]) -> ExecutionPlan {
        let mut plan = ExecutionPlan::new(vec![SubQuery::new("a", "{ a }"), SubQuery::new("b", "{ b }")]);
        let mut dependencies: IndexMap<String, Vec<String>> = IndexMap::new();
        for (service, provider) in edges {
            dependencies
                .entry(service.to_string())
                .or_default()
                .push(provider.to_string());
        }
        plan.dependencies = dependencies;
        plan
    }

    #[test]
    fn valid_plan() {
        assert!(validate_plan(&plan(&[("b", "a")])).is_ok());
    }

    #[test]
    fn empty_plan() {
        let plan = ExecutionPlan::new(vec![]);
        assert_eq!(validate_plan(&plan).unwrap_err().code(), "PLANNING_FAILED");
    }

    #[test]
    fn zero_timeout() {
        let plan = ExecutionPlan::new(vec![SubQuery::new("a", "{ a }").timeout(Duration::ZERO)]);
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn unknown_dependency() {
        assert_eq!(
            validate_plan(&plan(&[("b", "c")])),
            Err(FederationError::Planning(
                "service b depends on non-existent service c".to_string()
            ))
        );
    }

    #[test]
    fn cyclic_dependencies() {
        let err = validate_plan(&plan(&[("a", "b"), ("b", "a")])).unwrap_err();
        assert_eq!(
            err,
            FederationError::Planning("circular dependency detected involving service a".to_string())
        );
    }
}

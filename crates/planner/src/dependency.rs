use std::collections::VecDeque;

use indexmap::{IndexMap, IndexSet};

use crate::{FederationError, Result};

/// Dependent keyword(s) and the provider keywords they rely on.
const BUSINESS_RULES: &[(&[&str], &[&str])] = &[
    (&["order"], &["user", "product", "payment"]),
    (&["review", "rating"], &["user", "product"]),
    (&["cart", "wishlist", "shopping"], &["user", "product"]),
    (&["checkout"], &["user", "product", "payment"]),
    (&["payment"], &["user"]),
    (&["billing"], &["user"]),
    (&["shipping", "delivery"], &["user", "order"]),
    (&["fulfillment"], &["order", "product"]),
    (&["notification", "email", "sms"], &["user"]),
    (&["analytics", "reporting"], &["user", "product", "order"]),
    (&["inventory", "catalog"], &["product"]),
];

/// A directed graph of services where an edge `provider -> dependent` means the dependent must
/// run after the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: IndexSet<String>,
    /// dependent -> providers
    providers: IndexMap<String, IndexSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_node(&mut self, service: impl Into<String>) {
        self.nodes.insert(service.into());
    }

    /// Record that `dependent` must follow `provider`. Self edges are ignored.
    pub fn add_dependency(&mut self, dependent: &str, provider: &str) {
        if dependent == provider {
            return;
        }
        self.add_node(provider);
        self.add_node(dependent);
        self.providers
            .entry(dependent.to_string())
            .or_default()
            .insert(provider.to_string());
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn providers_of(&self, service: &str) -> impl Iterator<Item = &str> {
        self.providers
            .get(service)
            .into_iter()
            .flat_map(|providers| providers.iter().map(String::as_str))
    }

    #[inline]
    pub fn has_edges(&self) -> bool {
        self.providers.values().any(|providers| !providers.is_empty())
    }

    /// Apply the built-in domain rules between the services already in the graph.
    ///
    /// A service whose name contains a dependent keyword depends on every other service whose name
    /// contains one of the matching provider keywords. Only the first matching rule applies.
    pub fn apply_business_rules(&mut self) {
        let services: Vec<String> = self.nodes.iter().cloned().collect();

        for dependent in &services {
            let lower = dependent.to_lowercase();
            let Some((_, providers)) = BUSINESS_RULES
                .iter()
                .find(|(keywords, _)| keywords.iter().any(|keyword| lower.contains(keyword)))
            else {
                continue;
            };

            for provider in &services {
                let provider_lower = provider.to_lowercase();
                if provider != dependent && providers.iter().any(|keyword| provider_lower.contains(keyword)) {
                    tracing::debug!(dependent = %dependent, provider = %provider, "Added business dependency");
                    self.add_dependency(dependent, provider);
                }
            }
        }
    }

    /// Order the services so providers come first (Kahn's algorithm).
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: IndexMap<&str, usize> = self
            .nodes
            .iter()
            .map(|node| (node.as_str(), self.providers_of(node).count()))
            .collect();

        let mut dependents: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for (dependent, providers) in &self.providers {
            for provider in providers {
                dependents.entry(provider.as_str()).or_default().push(dependent.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            return Err(FederationError::Planning("circular dependency detected".to_string()));
        }
        Ok(order)
    }

    /// Find a service taking part in a cycle with a depth-first search.
    pub fn find_cycle(&self) -> Option<String> {
        #[derive(Copy, Clone, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(graph: &'a DependencyGraph, node: &'a str, marks: &mut IndexMap<&'a str, Mark>) -> Option<String> {
            match marks.get(node) {
                Some(Mark::Visiting) => return Some(node.to_string()),
                Some(Mark::Done) => return None,
                None => {},
            }
            marks.insert(node, Mark::Visiting);
            for provider in graph.providers_of(node) {
                if let Some(service) = visit(graph, provider, marks) {
                    return Some(service);
                }
            }
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = IndexMap::new();
        self.nodes.iter().find_map(|node| visit(self, node, &mut marks))
    }

    /// The edges as `dependent -> providers`, omitting services without providers.
    pub fn to_dependencies(&self) -> IndexMap<String, Vec<String>> {
        self.providers
            .iter()
            .filter(|(_, providers)| !providers.is_empty())
            .map(|(dependent, providers)| (dependent.clone(), providers.iter().cloned().collect()))
            .collect()
    }

    pub fn from_dependencies<'a>(
        nodes: impl IntoIterator<Item = &'a str>,
        dependencies: &'a IndexMap<String, Vec<String>>,
    ) -> Self {
        let mut graph = DependencyGraph::new();
        for node in nodes {
            graph.add_node(node);
        }
        for (dependent, providers) in dependencies {
            for provider in providers {
                graph.add_dependency(dependent, provider);
            }
        }
        graph
    }
}

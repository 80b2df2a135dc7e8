use std::collections::{HashMap, HashSet};

use parser::{
    types::{
        DocumentOperations,
        Field,
        FragmentDefinition,
        OperationDefinition,
        OperationType,
        Selection,
        SelectionSet,
    },
    Positioned,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use value::{Name, Variables};

use crate::{printer::QueryPrinter, FederationError, PrintedOperation, Request, Result};

/// Recursion ceiling of the selection walkers.
pub const MAX_RECURSION_DEPTH: usize = 50;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Object,
    Scalar,
}

/// Field names from the operation root down to one selected field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPath {
    pub path: Vec<String>,
    pub kind: FieldKind,
}

impl FieldPath {
    /// The root field this path starts at.
    pub fn root(&self) -> &str {
        self.path.first().map(String::as_str).unwrap_or_default()
    }
}

/// The shape of one analyzed operation.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub operation_name: Option<String>,
    pub operation_type: OperationType,
    pub variables: Variables,
    pub fragment_names: Vec<String>,
    pub depth: usize,
    pub complexity: usize,
    pub(crate) operation: OperationDefinition,
    pub(crate) fragments: HashMap<Name, Positioned<FragmentDefinition>>,
    max_recursion_depth: usize,
}

/// Parses a request and measures the selected operation.
#[derive(Debug, Copy, Clone)]
pub struct QueryAnalyzer {
    max_recursion_depth: usize,
}

impl Default for QueryAnalyzer {
    fn default() -> Self {
        Self {
            max_recursion_depth: MAX_RECURSION_DEPTH,
        }
    }
}

impl QueryAnalyzer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn max_recursion_depth(self, max_recursion_depth: usize) -> Self {
        Self { max_recursion_depth }
    }

    #[instrument(err(Debug), skip_all, level = "trace")]
    pub fn analyze(&self, request: &Request) -> Result<ParsedQuery> {
        if request.query.trim().is_empty() {
            return Err(FederationError::QueryParsing("query is empty".to_string()));
        }

        let document =
            parser::parse_query(&request.query).map_err(|err| FederationError::QueryParsing(err.to_string()))?;

        let (operation_name, operation) = select_operation(document.operations, request.operation_name.as_deref())?;

        let mut fragment_names: Vec<String> = document.fragments.keys().map(ToString::to_string).collect();
        fragment_names.sort();

        let mut query = ParsedQuery {
            operation_name,
            operation_type: operation.ty,
            variables: request.variables.clone(),
            fragment_names,
            depth: 0,
            complexity: 0,
            operation,
            fragments: document.fragments,
            max_recursion_depth: self.max_recursion_depth,
        };

        let depth = query.selection_depth(&query.operation.selection_set.node, &mut HashSet::new(), 0);
        let complexity = query.selection_complexity(&query.operation.selection_set.node, &mut HashSet::new(), 0);
        query.depth = depth;
        query.complexity = complexity;

        tracing::debug!(
            operation = ?query.operation_name,
            depth = query.depth,
            complexity = query.complexity,
            "Analyzed query"
        );
        Ok(query)
    }
}

fn select_operation(
    operations: DocumentOperations,
    operation_name: Option<&str>,
) -> Result<(Option<String>, OperationDefinition)> {
    match (operations, operation_name) {
        (DocumentOperations::Single(operation), None) => Ok((None, operation.node)),
        (DocumentOperations::Single(_), Some(name)) => Err(unknown_operation(name)),
        (DocumentOperations::Multiple(mut operations), Some(name)) => operations
            .remove(name)
            .map(|operation| (Some(name.to_string()), operation.node))
            .ok_or_else(|| unknown_operation(name)),
        (DocumentOperations::Multiple(operations), None) if operations.len() == 1 => operations
            .into_iter()
            .next()
            .map(|(name, operation)| (Some(name.to_string()), operation.node))
            .ok_or_else(|| FederationError::QueryParsing("no operation found".to_string())),
        (DocumentOperations::Multiple(_), None) => Err(FederationError::QueryParsing(
            "multiple operations found but no operation name specified".to_string(),
        )),
    }
}

fn unknown_operation(name: &str) -> FederationError {
    FederationError::QueryValidation(format!("unknown operation named '{name}'"))
}

impl ParsedQuery {
    pub fn operation(&self) -> &OperationDefinition {
        &self.operation
    }

    pub fn fragment(&self, name: &str) -> Option<&FragmentDefinition> {
        self.fragments.get(name).map(|fragment| &fragment.node)
    }

    /// The root fields of the operation, looking through fragments at the root level.
    pub fn root_fields(&self) -> Vec<&Positioned<Field>> {
        let mut fields = Vec::new();
        let mut visiting = HashSet::new();
        self.collect_fields(&self.operation.selection_set.node, &mut visiting, &mut fields);
        fields
    }

    /// The selected operation on its own, with fragments inlined and only the variables it uses.
    pub fn print(&self) -> Result<PrintedOperation> {
        QueryPrinter::new(&self.fragments).print_operation(
            self.operation_type,
            self.operation_name.as_deref(),
            &self.operation.variable_definitions,
            &self.root_fields(),
            &self.variables,
        )
    }

    /// Every selected field as a path of field names.
    pub fn field_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        let mut visiting = HashSet::new();
        self.walk_paths(
            &self.operation.selection_set.node,
            &mut Vec::new(),
            &mut visiting,
            &mut paths,
        );
        paths
    }

    fn collect_fields<'a>(
        &'a self,
        selection_set: &'a SelectionSet,
        visiting: &mut HashSet<&'a str>,
        fields: &mut Vec<&'a Positioned<Field>>,
    ) {
        for selection in &selection_set.items {
            match &selection.node {
                Selection::Field(field) => fields.push(field),
                Selection::InlineFragment(fragment) => {
                    self.collect_fields(&fragment.node.selection_set.node, visiting, fields)
                },
                Selection::FragmentSpread(spread) => {
                    let name = spread.node.fragment_name.node.as_str();
                    if let Some(fragment) = self.fragments.get(name) {
                        if visiting.insert(name) {
                            self.collect_fields(&fragment.node.selection_set.node, visiting, fields);
                            visiting.remove(name);
                        }
                    }
                },
            }
        }
    }

    fn walk_paths<'a>(
        &'a self,
        selection_set: &'a SelectionSet,
        prefix: &mut Vec<String>,
        visiting: &mut HashSet<&'a str>,
        paths: &mut Vec<FieldPath>,
    ) {
        if prefix.len() >= self.max_recursion_depth {
            tracing::warn!(path = ?prefix, "Field path walk reached the recursion limit");
            return;
        }

        for selection in &selection_set.items {
            match &selection.node {
                Selection::Field(field) => {
                    let field = &field.node;
                    prefix.push(field.name.node.to_string());
                    let kind = match field.selection_set.node.items.is_empty() {
                        true => FieldKind::Scalar,
                        false => FieldKind::Object,
                    };
                    paths.push(FieldPath {
                        path: prefix.clone(),
                        kind,
                    });
                    self.walk_paths(&field.selection_set.node, prefix, visiting, paths);
                    prefix.pop();
                },
                Selection::InlineFragment(fragment) => {
                    self.walk_paths(&fragment.node.selection_set.node, prefix, visiting, paths)
                },
                Selection::FragmentSpread(spread) => {
                    let name = spread.node.fragment_name.node.as_str();
                    if let Some(fragment) = self.fragments.get(name) {
                        if visiting.insert(name) {
                            self.walk_paths(&fragment.node.selection_set.node, prefix, visiting, paths);
                            visiting.remove(name);
                        }
                    }
                },
            }
        }
    }

    /// Maximum nesting of selection sets below `selection_set`.
    fn selection_depth<'a>(
        &'a self,
        selection_set: &'a SelectionSet,
        visiting: &mut HashSet<&'a str>,
        recursion: usize,
    ) -> usize {
        if recursion >= self.max_recursion_depth {
            tracing::warn!(
                limit = self.max_recursion_depth,
                "Query depth calculation reached the recursion limit"
            );
            return 0;
        }

        let mut depth = 0;
        for selection in &selection_set.items {
            let current = match &selection.node {
                Selection::Field(field) => {
                    let children = &field.node.selection_set.node;
                    match children.items.is_empty() {
                        true => 1,
                        false => 1 + self.selection_depth(children, visiting, recursion + 1),
                    }
                },
                Selection::InlineFragment(fragment) => {
                    self.selection_depth(&fragment.node.selection_set.node, visiting, recursion + 1)
                },
                Selection::FragmentSpread(spread) => {
                    let name = spread.node.fragment_name.node.as_str();
                    match self.fragments.get(name) {
                        Some(fragment) if visiting.insert(name) => {
                            let depth =
                                self.selection_depth(&fragment.node.selection_set.node, visiting, recursion + 1);
                            visiting.remove(name);
                            depth
                        },
                        _ => 0,
                    }
                },
            };
            depth = depth.max(current);
        }
        depth
    }

    /// One unit per selected field plus the cost of its sub-selection.
    fn selection_complexity<'a>(
        &'a self,
        selection_set: &'a SelectionSet,
        visiting: &mut HashSet<&'a str>,
        recursion: usize,
    ) -> usize {
        if recursion >= self.max_recursion_depth {
            tracing::warn!(
                limit = self.max_recursion_depth,
                "Query complexity calculation reached the recursion limit"
            );
            return 0;
        }

        selection_set
            .items
            .iter()
            .map(|selection| match &selection.node {
                Selection::Field(field) => {
                    1 + self.selection_complexity(&field.node.selection_set.node, visiting, recursion + 1)
                },
                Selection::InlineFragment(fragment) => {
                    self.selection_complexity(&fragment.node.selection_set.node, visiting, recursion + 1)
                },
                Selection::FragmentSpread(spread) => {
                    let name = spread.node.fragment_name.node.as_str();
                    match self.fragments.get(name) {
                        Some(fragment) if visiting.insert(name) => {
                            let complexity =
                                self.selection_complexity(&fragment.node.selection_set.node, visiting, recursion + 1);
                            visiting.remove(name);
                            complexity
                        },
                        _ => 0,
                    }
                },
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn analyze(query: &str) -> Result<ParsedQuery> {
        QueryAnalyzer::new().analyze(&Request::new(query))
    }

    #[test]
    fn print_keeps_only_the_selected_operation() {
        let mut variables = Variables::default();
        variables.insert(Name::new("id"), value::ConstValue::Number(7.into()));
        variables.insert(Name::new("unused"), value::ConstValue::Number(1.into()));
        let query = QueryAnalyzer::new()
            .analyze(
                &Request::new(
                    "query A { users { id } } query B($id: ID) { user(id: $id) { ...U } } fragment U on User { name }",
                )
                .operation_name("B")
                .variables(variables),
            )
            .unwrap();

        let printed = query.print().unwrap();
        assert_eq!(printed.query, "query B($id: ID) { user(id: $id) { ... on User { name } } }");
        assert_eq!(printed.variables.len(), 1);
        assert_eq!(printed.variables.get("id"), Some(&value::ConstValue::Number(7.into())));
    }

    #[test_case("{ users { id } }", 2, 2 ; "nested")]
    #[test_case("{ a b c }", 1, 3 ; "flat")]
    #[test_case("{ a { b { c { d } } } }", 4, 4 ; "deep")]
    #[test_case("{ a { ... on A { b { c } } } }", 3, 3 ; "inline fragments add no level")]
    #[test_case("{ a { ...F } } fragment F on A { b { c } }", 3, 3 ; "fragment spread")]
    fn depth_and_complexity(query: &str, depth: usize, complexity: usize) {
        let parsed = analyze(query).unwrap();
        assert_eq!((parsed.depth, parsed.complexity), (depth, complexity));
    }

    #[test]
    fn cyclic_fragments_terminate() {
        let parsed = analyze(
            r#"
            { user { ...A } }
            fragment A on User { friends { ...B } }
            fragment B on User { name ...A }
            "#,
        )
        .unwrap();

        assert!(parsed.depth <= MAX_RECURSION_DEPTH);
        assert_eq!(parsed.depth, 3);
        assert_eq!(parsed.complexity, 3);
        assert_eq!(parsed.field_paths().len(), 3);
    }

    #[test]
    fn recursion_ceiling_caps_the_result() {
        let parsed = QueryAnalyzer::new()
            .max_recursion_depth(2)
            .analyze(&Request::new("{ a { b { c { d } } } }"))
            .unwrap();
        assert_eq!(parsed.depth, 2);
    }

    #[test]
    fn field_paths_use_field_names() {
        let parsed = analyze("{ people: users { id profile { bio } } }").unwrap();
        let paths: Vec<_> = parsed
            .field_paths()
            .into_iter()
            .map(|path| (path.path.join("."), path.kind))
            .collect();

        assert_eq!(paths, vec![
            ("users".to_string(), FieldKind::Object),
            ("users.id".to_string(), FieldKind::Scalar),
            ("users.profile".to_string(), FieldKind::Object),
            ("users.profile.bio".to_string(), FieldKind::Scalar),
        ]);
    }

    #[test]
    fn operation_selection() {
        let query = "query A { a } query B { b }";

        let err = analyze(query).unwrap_err();
        assert_eq!(err.code(), "QUERY_PARSING_ERROR");

        let parsed = QueryAnalyzer::new()
            .analyze(&Request::new(query).operation_name("B"))
            .unwrap();
        assert_eq!(parsed.operation_name.as_deref(), Some("B"));
        assert_eq!(parsed.root_fields()[0].node.name.node.as_str(), "b");

        let err = QueryAnalyzer::new()
            .analyze(&Request::new(query).operation_name("C"))
            .unwrap_err();
        assert_eq!(err.code(), "QUERY_VALIDATION_ERROR");
    }

    #[test_case("" ; "empty")]
    #[test_case("   " ; "blank")]
    #[test_case("{ users { id }" ; "unbalanced")]
    fn invalid_queries_are_parsing_errors(query: &str) {
        assert_eq!(analyze(query).unwrap_err().code(), "QUERY_PARSING_ERROR");
    }
}

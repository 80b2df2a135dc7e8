use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Write},
};

use indexmap::IndexSet;
use parser::{
    types::{
        Directive,
        Field,
        FragmentDefinition,
        OperationType,
        Selection,
        SelectionSet,
        VariableDefinition,
    },
    Positioned,
};
use value::{Name, Value, Variables};

use crate::{FederationError, Result};

/// A self-contained operation text with the variable values it references.
#[derive(Debug, Clone, PartialEq)]
pub struct PrintedOperation {
    pub query: String,
    pub variables: Variables,
}

/// Prints selections back to GraphQL text, inlining fragment spreads.
pub(crate) struct QueryPrinter<'a> {
    fragments: &'a HashMap<Name, Positioned<FragmentDefinition>>,
    referenced: IndexSet<&'a str>,
}

impl<'a> QueryPrinter<'a> {
    pub(crate) fn new(fragments: &'a HashMap<Name, Positioned<FragmentDefinition>>) -> Self {
        Self {
            fragments,
            referenced: IndexSet::new(),
        }
    }

    /// Print an operation containing `fields`, keeping only the variable definitions and values
    /// the fields reference.
    pub(crate) fn print_operation(
        mut self,
        ty: OperationType,
        name: Option<&str>,
        variable_definitions: &'a [Positioned<VariableDefinition>],
        fields: &[&'a Positioned<Field>],
        variables: &Variables,
    ) -> Result<PrintedOperation> {
        let mut printed_fields = Vec::with_capacity(fields.len());
        let mut visiting = HashSet::new();
        for field in fields {
            let mut output = String::new();
            self.write_field(&mut output, &field.node, &mut visiting)
                .map_err(print_error)?;
            printed_fields.push(output);
        }

        let definitions = variable_definitions
            .iter()
            .map(|definition| &definition.node)
            .filter(|definition| self.referenced.contains(definition.name.node.as_str()))
            .map(print_variable_definition)
            .collect::<Result<Vec<_>>>()?;

        let query = assemble_operation(ty, name, &definitions, &printed_fields);

        let mut selected = Variables::default();
        for name in &self.referenced {
            if let Some((key, value)) = variables.get_key_value(*name) {
                selected.insert(key.clone(), value.clone());
            }
        }

        Ok(PrintedOperation {
            query,
            variables: selected,
        })
    }

    /// Print a single field, used to compare selections textually.
    pub(crate) fn print_field(&mut self, field: &'a Field) -> Result<String> {
        let mut output = String::new();
        self.write_field(&mut output, field, &mut HashSet::new())
            .map_err(print_error)?;
        Ok(output)
    }

    fn write_field(&mut self, output: &mut String, field: &'a Field, visiting: &mut HashSet<&'a str>) -> fmt::Result {
        if let Some(alias) = &field.alias {
            write!(output, "{}: ", alias.node)?;
        }
        output.push_str(field.name.node.as_str());

        if !field.arguments.is_empty() {
            output.push('(');
            for (index, (name, value)) in field.arguments.iter().enumerate() {
                if index > 0 {
                    output.push_str(", ");
                }
                self.reference(&value.node);
                write!(output, "{}: {}", name.node, value.node)?;
            }
            output.push(')');
        }

        self.write_directives(output, &field.directives)?;
        self.write_selection_set(output, &field.selection_set.node, visiting)
    }

    fn write_directives(&mut self, output: &mut String, directives: &'a [Positioned<Directive>]) -> fmt::Result {
        for directive in directives {
            write!(output, " @{}", directive.node.name.node)?;
            if !directive.node.arguments.is_empty() {
                output.push('(');
                for (index, (name, value)) in directive.node.arguments.iter().enumerate() {
                    if index > 0 {
                        output.push_str(", ");
                    }
                    self.reference(&value.node);
                    write!(output, "{}: {}", name.node, value.node)?;
                }
                output.push(')');
            }
        }
        Ok(())
    }

    fn write_selection_set(
        &mut self,
        output: &mut String,
        selection_set: &'a SelectionSet,
        visiting: &mut HashSet<&'a str>,
    ) -> fmt::Result {
        if selection_set.items.is_empty() {
            return Ok(());
        }

        output.push_str(" { ");
        for selection in &selection_set.items {
            match &selection.node {
                Selection::Field(field) => {
                    self.write_field(output, &field.node, visiting)?;
                    output.push(' ');
                },
                Selection::InlineFragment(fragment) => {
                    output.push_str("...");
                    if let Some(condition) = &fragment.node.type_condition {
                        write!(output, " on {}", condition.node.on.node)?;
                    }
                    self.write_directives(output, &fragment.node.directives)?;
                    self.write_selection_set(output, &fragment.node.selection_set.node, visiting)?;
                    output.push(' ');
                },
                Selection::FragmentSpread(spread) => {
                    let name = spread.node.fragment_name.node.as_str();
                    let Some(fragment) = self.fragments.get(name) else {
                        continue;
                    };
                    if !visiting.insert(name) {
                        continue;
                    }
                    write!(output, "... on {}", fragment.node.type_condition.node.on.node)?;
                    self.write_directives(output, &spread.node.directives)?;
                    self.write_selection_set(output, &fragment.node.selection_set.node, visiting)?;
                    output.push(' ');
                    visiting.remove(name);
                },
            }
        }
        output.push('}');
        Ok(())
    }

    fn reference(&mut self, value: &'a Value) {
        match value {
            Value::Variable(name) => {
                self.referenced.insert(name.as_str());
            },
            Value::List(values) => values.iter().for_each(|value| self.reference(value)),
            Value::Object(object) => object.values().for_each(|value| self.reference(value)),
            _ => {},
        }
    }
}

pub(crate) fn print_variable_definition(definition: &VariableDefinition) -> Result<String> {
    let mut output = format!("${}: {}", definition.name.node, definition.var_type.node);
    if let Some(default_value) = &definition.default_value {
        write!(output, " = {}", default_value.node).map_err(print_error)?;
    }
    Ok(output)
}

/// `<keyword> [name][(definitions)] { fields }`
pub(crate) fn assemble_operation(
    ty: OperationType,
    name: Option<&str>,
    definitions: &[String],
    fields: &[String],
) -> String {
    let mut query = ty.to_string();
    if let Some(name) = name {
        query.push(' ');
        query.push_str(name);
    }
    if !definitions.is_empty() {
        if name.is_none() {
            query.push(' ');
        }
        query.push('(');
        query.push_str(&definitions.join(", "));
        query.push(')');
    }
    query.push_str(" { ");
    query.push_str(&fields.join(" "));
    query.push_str(" }");
    query
}

fn print_error(err: fmt::Error) -> FederationError {
    FederationError::QueryBuilding(err.to_string())
}

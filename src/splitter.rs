use std::collections::{HashMap, HashSet};

use apollo_compiler::ast::{Definition, Document, Field, FragmentDefinition, OperationDefinition, Selection, Value};
use apollo_compiler::Node;
use tracing::debug;

use crate::error::{GapFillerError, GapFillerResult};
use crate::models::{ArgValue, Argument, GraphQLRequest, SplitResult, SubDocument};

const SOURCE_NAME: &str = "request.graphql";

#[derive(Debug, Clone, Default)]
pub struct QuerySplitter {
    names: HashSet<String>,
}

impl QuerySplitter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn split(&self, body: &[u8]) -> GapFillerResult<SplitResult> {
        let request: GraphQLRequest = serde_json::from_slice(body)
            .map_err(|e| GapFillerError::Parse(format!("invalid request envelope: {}", e)))?;
        self.split_request(request)
    }

    pub fn split_request(&self, request: GraphQLRequest) -> GapFillerResult<SplitResult> {
        let document = Document::parse(request.query.clone(), SOURCE_NAME)
            .map_err(|e| GapFillerError::Parse(e.errors.to_string()))?;

        // Only names that occur exactly once at the top level are split out.
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for op in operations(&document) {
            for selection in &op.selection_set {
                if let Selection::Field(field) = selection {
                    if self.names.contains(field.name.as_str()) {
                        *counts.entry(field.name.as_str()).or_default() += 1;
                    }
                }
            }
        }
        let extractable: HashSet<String> = counts
            .into_iter()
            .filter(|(_, count)| *count == 1)
            .map(|(name, _)| name.to_string())
            .collect();

        if extractable.is_empty() {
            return Ok(SplitResult {
                remainder: Some(request),
                per_field: HashMap::new(),
            });
        }

        let fragments = fragment_index(&document);
        let mut remainder = document.clone();
        let mut per_field = HashMap::new();

        for definition in remainder.definitions.iter_mut() {
            let Definition::OperationDefinition(op) = definition else {
                continue;
            };
            let op = op.make_mut();
            let mut kept = Vec::with_capacity(op.selection_set.len());
            for selection in std::mem::take(&mut op.selection_set) {
                match selection {
                    Selection::Field(field) if extractable.contains(field.name.as_str()) => {
                        let sub = sub_document(op, &field, &fragments, &request);
                        debug!(field = %field.name, query = %sub.request.query, "split out sub-document");
                        per_field.insert(field.name.to_string(), sub);
                    }
                    other => kept.push(other),
                }
            }
            op.selection_set = kept;
        }

        remainder.definitions.retain(|definition| match definition {
            Definition::OperationDefinition(op) => !op.selection_set.is_empty(),
            _ => true,
        });

        let remainder = if operations(&remainder).next().is_some() {
            let used = used_fragments(
                operations(&remainder).flat_map(|op| op.selection_set.iter()),
                &fragments,
            );
            remainder.definitions.retain(|definition| match definition {
                Definition::FragmentDefinition(fragment) => used.iter().any(|name| name == fragment.name.as_str()),
                _ => true,
            });
            for definition in remainder.definitions.iter_mut() {
                if let Definition::OperationDefinition(op) = definition {
                    prune_variables(op.make_mut(), &fragments);
                }
            }
            Some(GraphQLRequest {
                query: remainder.to_string(),
                variables: request.variables.clone(),
                operation_name: request.operation_name.clone(),
            })
        } else {
            None
        };

        Ok(SplitResult { remainder, per_field })
    }
}

fn operations(document: &Document) -> impl Iterator<Item = &Node<OperationDefinition>> {
    document.definitions.iter().filter_map(|definition| match definition {
        Definition::OperationDefinition(op) => Some(op),
        _ => None,
    })
}

fn fragment_index(document: &Document) -> HashMap<String, Node<FragmentDefinition>> {
    document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::FragmentDefinition(fragment) => Some((fragment.name.to_string(), fragment.clone())),
            _ => None,
        })
        .collect()
}

fn sub_document(
    op: &OperationDefinition,
    field: &Node<Field>,
    fragments: &HashMap<String, Node<FragmentDefinition>>,
    request: &GraphQLRequest,
) -> SubDocument {
    let mut operation = op.clone();
    operation.selection_set = vec![Selection::Field(field.clone())];
    prune_variables(&mut operation, fragments);

    let used = used_fragments(operation.selection_set.iter(), fragments);
    let mut document = Document::new();
    document
        .definitions
        .push(Definition::OperationDefinition(Node::new(operation)));
    for name in used {
        if let Some(fragment) = fragments.get(&name) {
            document
                .definitions
                .push(Definition::FragmentDefinition(fragment.clone()));
        }
    }

    let arguments = field
        .arguments
        .iter()
        .map(|arg| Argument::new(arg.name.as_str(), resolve_value(&arg.value, request)))
        .collect();

    SubDocument {
        request: GraphQLRequest {
            query: document.to_string(),
            variables: request.variables.clone(),
            operation_name: request.operation_name.clone(),
        },
        response_key: field.alias.as_ref().unwrap_or(&field.name).to_string(),
        arguments,
    }
}

fn resolve_value(value: &Value, request: &GraphQLRequest) -> ArgValue {
    match value {
        Value::Null => ArgValue::Null,
        Value::Enum(name) => ArgValue::Enum(name.to_string()),
        Value::Variable(name) => request
            .variable(name.as_str())
            .map(ArgValue::from_json)
            .unwrap_or(ArgValue::Null),
        Value::String(s) => ArgValue::String(s.to_string()),
        Value::Float(f) => f.try_to_f64().map(ArgValue::Float).unwrap_or(ArgValue::Null),
        Value::Int(i) => i
            .as_str()
            .parse::<i64>()
            .map(ArgValue::Int)
            .unwrap_or_else(|_| ArgValue::String(i.as_str().to_string())),
        Value::Boolean(b) => ArgValue::Boolean(*b),
        Value::List(items) => ArgValue::List(items.iter().map(|v| resolve_value(v, request)).collect()),
        Value::Object(fields) => ArgValue::Object(
            fields
                .iter()
                .map(|(name, v)| (name.to_string(), resolve_value(v, request)))
                .collect(),
        ),
    }
}

/// Drops variable definitions the operation no longer references.
fn prune_variables(op: &mut OperationDefinition, fragments: &HashMap<String, Node<FragmentDefinition>>) {
    let mut used = HashSet::new();
    for directive in op.directives.iter() {
        for arg in &directive.arguments {
            value_variables(&arg.value, &mut used);
        }
    }
    let mut visited = HashSet::new();
    selection_variables(&op.selection_set, fragments, &mut used, &mut visited);
    op.variables
        .retain(|definition| used.contains(definition.name.as_str()));
}

fn selection_variables(
    selections: &[Selection],
    fragments: &HashMap<String, Node<FragmentDefinition>>,
    used: &mut HashSet<String>,
    visited: &mut HashSet<String>,
) {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                for arg in &field.arguments {
                    value_variables(&arg.value, used);
                }
                for directive in field.directives.iter() {
                    for arg in &directive.arguments {
                        value_variables(&arg.value, used);
                    }
                }
                selection_variables(&field.selection_set, fragments, used, visited);
            }
            Selection::InlineFragment(inline) => {
                for directive in inline.directives.iter() {
                    for arg in &directive.arguments {
                        value_variables(&arg.value, used);
                    }
                }
                selection_variables(&inline.selection_set, fragments, used, visited);
            }
            Selection::FragmentSpread(spread) => {
                for directive in spread.directives.iter() {
                    for arg in &directive.arguments {
                        value_variables(&arg.value, used);
                    }
                }
                let name = spread.fragment_name.to_string();
                if visited.insert(name.clone()) {
                    if let Some(fragment) = fragments.get(&name) {
                        selection_variables(&fragment.selection_set, fragments, used, visited);
                    }
                }
            }
        }
    }
}

fn value_variables(value: &Value, used: &mut HashSet<String>) {
    match value {
        Value::Variable(name) => {
            used.insert(name.to_string());
        }
        Value::List(items) => {
            for item in items {
                value_variables(item, used);
            }
        }
        Value::Object(fields) => {
            for (_, v) in fields {
                value_variables(v, used);
            }
        }
        _ => {}
    }
}

/// Names of fragments reachable from `selections`, transitively.
fn used_fragments<'a>(
    selections: impl Iterator<Item = &'a Selection>,
    fragments: &HashMap<String, Node<FragmentDefinition>>,
) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack: Vec<&Selection> = selections.collect();
    while let Some(selection) = stack.pop() {
        match selection {
            Selection::Field(field) => stack.extend(field.selection_set.iter()),
            Selection::InlineFragment(inline) => stack.extend(inline.selection_set.iter()),
            Selection::FragmentSpread(spread) => {
                let name = spread.fragment_name.to_string();
                if found.contains(&name) {
                    continue;
                }
                if let Some(fragment) = fragments.get(&name) {
                    stack.extend(fragment.selection_set.iter());
                }
                found.push(name);
            }
        }
    }
    found
}

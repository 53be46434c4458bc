//! Ordered, fail-fast validation pipeline

use super::error::ValidationError;
use super::graph::{Adjacency, find_cycle, reachable, reversed, search_roots};
use crate::config::{END, EdgeTarget, ExecutionMode, FieldSpec, NodeSpec, START, WorkflowSpec};
use crate::template::{check_condition_syntax, placeholders, suggest_correction};
use crate::types::{TypeExpr, parse_type};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

/// Local inputs bound for every invocation of a parallel target
const PARALLEL_LOCALS: [&str; 2] = ["item", "index"];

/// Validates one workflow document
pub struct GraphValidator<'a> {
    spec: &'a WorkflowSpec,
    mode: ExecutionMode,
    node_ids: HashSet<&'a str>,
    field_names: HashSet<&'a str>,
    parallel_targets: HashSet<&'a str>,
}

impl<'a> GraphValidator<'a> {
    pub fn new(spec: &'a WorkflowSpec) -> Self {
        let parallel_targets = spec
            .edges
            .iter()
            .filter_map(|e| match &e.target {
                EdgeTarget::Parallel(p) => Some(p.target_node.as_str()),
                _ => None,
            })
            .collect();

        Self {
            spec,
            mode: spec.execution_mode(),
            node_ids: spec.nodes.iter().map(|n| n.id.as_str()).collect(),
            field_names: spec.state.fields.keys().map(|k| k.as_str()).collect(),
            parallel_targets,
        }
    }

    /// Run every stage in order, stopping at the first failure
    pub fn validate(&self) -> Result<(), ValidationError> {
        let stages: [(&str, fn(&Self) -> Result<(), ValidationError>); 9] = [
            ("document", Self::check_document),
            ("edge_endpoints", Self::check_edge_endpoints),
            ("outputs", Self::check_outputs),
            ("output_schema", Self::check_output_schemas),
            ("output_types", Self::check_output_types),
            ("placeholders", Self::check_placeholders),
            ("state_types", Self::check_state_types),
            ("structure", Self::check_structure),
            ("reachability", Self::check_reachability),
        ];

        for (name, stage) in stages {
            stage(self)?;
            tracing::debug!(stage = name, "validation stage passed");
        }
        Ok(())
    }

    fn sorted_ids(&self) -> Vec<&'a str> {
        let mut ids: Vec<&str> = self.node_ids.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn sorted_fields(&self) -> Vec<&'a str> {
        let mut names: Vec<&str> = self.field_names.iter().copied().collect();
        names.sort_unstable();
        names
    }

    fn check_document(&self) -> Result<(), ValidationError> {
        let spec = self.spec;
        if spec.state.fields.is_empty() {
            return Err(ValidationError::new(
                "document",
                "workflow declares no state fields",
                "state.fields",
            ));
        }
        if spec.nodes.is_empty() {
            return Err(ValidationError::new("document", "workflow declares no nodes", "nodes"));
        }
        if spec.edges.is_empty() {
            return Err(ValidationError::new("document", "workflow declares no edges", "edges"));
        }

        // Check for duplicate and malformed node ids
        let mut seen = HashSet::new();
        for node in &spec.nodes {
            let location = format!("nodes.{}", node.id);
            if node.id == START || node.id == END {
                return Err(ValidationError::new(
                    "document",
                    format!("node id '{}' is reserved", node.id),
                    location,
                ));
            }
            if !IDENTIFIER.is_match(&node.id) {
                return Err(ValidationError::new(
                    "document",
                    format!("node id '{}' is not a valid identifier", node.id),
                    location,
                ));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(ValidationError::new(
                    "document",
                    format!("duplicate node id '{}'", node.id),
                    location,
                ));
            }
            match (&node.prompt, &node.code) {
                (None, None) => {
                    return Err(ValidationError::new(
                        "document",
                        format!("node '{}' must declare either a prompt or code", node.id),
                        location,
                    ));
                }
                (Some(_), Some(_)) => {
                    return Err(ValidationError::new(
                        "document",
                        format!("node '{}' declares both a prompt and code", node.id),
                        location,
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn check_edge_endpoints(&self) -> Result<(), ValidationError> {
        let mut candidates = self.sorted_ids();
        candidates.push(START);
        candidates.push(END);

        for (i, edge) in self.spec.edges.iter().enumerate() {
            let location = format!("edges[{}]", i);

            if edge.from == END {
                return Err(ValidationError::new(
                    "edge_endpoints",
                    "END cannot have outgoing edges",
                    location,
                ));
            }
            if edge.from != START && !self.node_ids.contains(edge.from.as_str()) {
                return Err(ValidationError::new(
                    "edge_endpoints",
                    format!("edge source '{}' is not a node", edge.from),
                    location,
                )
                .with_suggestion(suggest_correction(&edge.from, &candidates)));
            }

            let mut targets: Vec<(&str, bool)> = Vec::new();
            match &edge.target {
                EdgeTarget::To(to) => targets.push((to.as_str(), true)),
                EdgeTarget::Routes(routes) => {
                    if routes.is_empty() {
                        return Err(ValidationError::new(
                            "edge_endpoints",
                            format!("edge from '{}' declares no routes", edge.from),
                            location,
                        ));
                    }
                    targets.extend(routes.iter().map(|r| (r.to.as_str(), true)));
                }
                EdgeTarget::Loop(spec) => {
                    targets.push((spec.exit_to.as_str(), true));
                    if let Some(reenter) = &spec.reenter {
                        targets.push((reenter.as_str(), false));
                    }
                }
                EdgeTarget::Parallel(spec) => targets.push((spec.target_node.as_str(), false)),
            }

            for (target, end_allowed) in targets {
                let valid =
                    self.node_ids.contains(target) || (end_allowed && target == END);
                if !valid {
                    return Err(ValidationError::new(
                        "edge_endpoints",
                        format!("edge from '{}' targets unknown node '{}'", edge.from, target),
                        location,
                    )
                    .with_suggestion(suggest_correction(target, &candidates)));
                }
            }
        }

        Ok(())
    }

    fn check_outputs(&self) -> Result<(), ValidationError> {
        let fields = self.sorted_fields();
        for node in &self.spec.nodes {
            let location = format!("nodes.{}.outputs", node.id);
            if node.outputs.is_empty() {
                return Err(ValidationError::new(
                    "outputs",
                    format!("node '{}' declares no outputs", node.id),
                    location,
                ));
            }
            for output in &node.outputs {
                if !self.field_names.contains(output.as_str()) {
                    return Err(ValidationError::new(
                        "outputs",
                        format!("node '{}' writes unknown state field '{}'", node.id, output),
                        location,
                    )
                    .with_suggestion(suggest_correction(output, &fields)));
                }
            }
        }
        Ok(())
    }

    fn check_output_schemas(&self) -> Result<(), ValidationError> {
        for node in &self.spec.nodes {
            let location = format!("nodes.{}.output_schema", node.id);
            let schema = &node.output_schema;

            if schema.type_name.trim() == "object" {
                let Some(fields) = &schema.fields else {
                    return Err(ValidationError::new(
                        "output_schema",
                        format!("node '{}' has an object output schema without fields", node.id),
                        location,
                    ));
                };
                let declared: HashSet<&str> = fields.keys().map(|k| k.as_str()).collect();
                let outputs: HashSet<&str> = node.outputs.iter().map(|o| o.as_str()).collect();
                if declared != outputs {
                    let mut missing: Vec<&str> = outputs.difference(&declared).copied().collect();
                    let mut extra: Vec<&str> = declared.difference(&outputs).copied().collect();
                    missing.sort_unstable();
                    extra.sort_unstable();
                    return Err(ValidationError::new(
                        "output_schema",
                        format!(
                            "node '{}' output schema fields do not match outputs (missing: [{}], extra: [{}])",
                            node.id,
                            missing.join(", "),
                            extra.join(", ")
                        ),
                        location,
                    ));
                }
            } else if node.outputs.len() != 1 {
                return Err(ValidationError::new(
                    "output_schema",
                    format!(
                        "node '{}' has a {} output schema but {} outputs",
                        node.id,
                        schema.type_name,
                        node.outputs.len()
                    ),
                    location,
                ));
            }
        }
        Ok(())
    }

    fn check_output_types(&self) -> Result<(), ValidationError> {
        let state_fields = &self.spec.state.fields;

        for node in &self.spec.nodes {
            let location = format!("nodes.{}.output_schema", node.id);
            let schema = &node.output_schema;

            let pairs: Vec<(&String, &FieldSpec)> = match &schema.fields {
                Some(fields) if schema.type_name.trim() == "object" => fields.iter().collect(),
                _ => vec![(&node.outputs[0], schema)],
            };

            for (name, declared) in pairs {
                let Some(state_field) = state_fields.get(name) else {
                    continue;
                };
                match same_shape(declared, state_field) {
                    Shape::Same | Shape::StateInvalid => {}
                    Shape::OutputInvalid(message) => {
                        return Err(ValidationError::new(
                            "output_types",
                            format!("node '{}' output '{}' has invalid type: {}", node.id, name, message),
                            location,
                        ));
                    }
                    Shape::Different => {
                        return Err(ValidationError::new(
                            "output_types",
                            format!(
                                "node '{}' output '{}' is {} but state field is {}",
                                node.id, name, declared.type_name, state_field.type_name
                            ),
                            location,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_placeholders(&self) -> Result<(), ValidationError> {
        let fields = &self.spec.state.fields;

        for node in &self.spec.nodes {
            let parallel = self.parallel_targets.contains(node.id.as_str());

            for (local, template) in &node.inputs {
                for path in placeholders(template) {
                    let segments: Vec<&str> = path.split('.').collect();
                    if parallel && PARALLEL_LOCALS.contains(&segments[0]) {
                        continue;
                    }
                    if !schema_has_path(fields, &segments) {
                        let mut known = self.sorted_fields();
                        if parallel {
                            known.extend(PARALLEL_LOCALS);
                        }
                        return Err(ValidationError::new(
                            "placeholders",
                            format!(
                                "input '{}' of node '{}' references unknown field '{}'",
                                local, node.id, path
                            ),
                            format!("nodes.{}.inputs.{}", node.id, local),
                        )
                        .with_suggestion(suggest_correction(segments[0], &known)));
                    }
                }
            }

            for (label, template) in [("prompt", &node.prompt), ("system_prompt", &node.system_prompt)] {
                let Some(template) = template else { continue };
                for path in placeholders(template) {
                    let segments: Vec<&str> = path.split('.').collect();
                    if node.inputs.contains_key(segments[0]) {
                        continue;
                    }
                    if parallel && PARALLEL_LOCALS.contains(&segments[0]) {
                        continue;
                    }
                    if !schema_has_path(fields, &segments) {
                        let mut known: Vec<&str> = node
                            .inputs
                            .keys()
                            .map(|k| k.as_str())
                            .chain(self.sorted_fields())
                            .collect();
                        if parallel {
                            known.extend(PARALLEL_LOCALS);
                        }
                        return Err(ValidationError::new(
                            "placeholders",
                            format!("{} of node '{}' references unknown name '{}'", label, node.id, path),
                            format!("nodes.{}.{}", node.id, label),
                        )
                        .with_suggestion(suggest_correction(segments[0], &known)));
                    }
                }
            }
        }

        for (i, edge) in self.spec.edges.iter().enumerate() {
            if let EdgeTarget::Routes(routes) = &edge.target {
                for (j, route) in routes.iter().enumerate() {
                    check_condition_syntax(&route.condition).map_err(|e| {
                        ValidationError::new(
                            "placeholders",
                            e.to_string(),
                            format!("edges[{}].routes[{}]", i, j),
                        )
                    })?;
                }
            }
        }

        Ok(())
    }

    fn check_state_types(&self) -> Result<(), ValidationError> {
        check_field_types(&self.spec.state.fields, "state.fields")
    }

    fn check_structure(&self) -> Result<(), ValidationError> {
        // One edge declaration per source
        let mut sources = HashSet::new();
        for (i, edge) in self.spec.edges.iter().enumerate() {
            if !sources.insert(edge.from.as_str()) {
                return Err(ValidationError::new(
                    "structure",
                    format!("'{}' declares more than one outgoing edge", edge.from),
                    format!("edges[{}]", i),
                ));
            }
        }

        for (i, edge) in self.spec.edges.iter().enumerate() {
            let location = format!("edges[{}]", i);
            match (&edge.target, self.mode) {
                (EdgeTarget::To(_), _) => {}
                (other, ExecutionMode::Linear) => {
                    return Err(ValidationError::new(
                        "structure",
                        format!(
                            "'{}' edges require execution mode 'extended' (edge from '{}')",
                            other.kind(),
                            edge.from
                        ),
                        location,
                    ));
                }
                (EdgeTarget::Loop(spec), ExecutionMode::Extended) => {
                    if edge.from == START {
                        return Err(ValidationError::new(
                            "structure",
                            "START cannot declare a loop edge",
                            location,
                        ));
                    }
                    if spec.max_iterations == 0 {
                        return Err(ValidationError::new(
                            "structure",
                            format!("loop on '{}' must allow at least one iteration", edge.from),
                            location,
                        ));
                    }
                    self.expect_field_type(&spec.condition_field, |t| *t == TypeExpr::Bool, "bool", &location)?;
                }
                (EdgeTarget::Parallel(spec), ExecutionMode::Extended) => {
                    self.expect_field_type(&spec.items_field, TypeExpr::is_list, "a list", &location)?;
                    self.expect_field_type(&spec.collect_field, TypeExpr::is_list, "a list", &location)?;
                }
                (EdgeTarget::Routes(_), ExecutionMode::Extended) => {}
            }
        }

        let adjacency = Adjacency::build(self.spec);
        if let Some(cycle) = find_cycle(&adjacency.forward, &search_roots(self.spec)) {
            let message = match self.mode {
                ExecutionMode::Linear => format!("cycle detected: {}", cycle.join(" -> ")),
                ExecutionMode::Extended => format!(
                    "cycle detected outside a loop edge: {}",
                    cycle.join(" -> ")
                ),
            };
            return Err(ValidationError::new("structure", message, cycle.join(" -> ")));
        }

        Ok(())
    }

    fn expect_field_type(
        &self,
        field: &str,
        check: impl Fn(&TypeExpr) -> bool,
        expected: &str,
        location: &str,
    ) -> Result<(), ValidationError> {
        let Some(spec) = self.spec.state.fields.get(field) else {
            return Err(ValidationError::new(
                "structure",
                format!("edge references unknown state field '{}'", field),
                location,
            )
            .with_suggestion(suggest_correction(field, &self.sorted_fields())));
        };
        match parse_type(&spec.type_name) {
            Ok(ty) if check(&ty) => Ok(()),
            _ => Err(ValidationError::new(
                "structure",
                format!("state field '{}' must be {}, found {}", field, expected, spec.type_name),
                location,
            )),
        }
    }

    fn check_reachability(&self) -> Result<(), ValidationError> {
        let start_edges = self.spec.edges.iter().filter(|e| e.from == START).count();
        if start_edges != 1 {
            return Err(ValidationError::new(
                "reachability",
                format!("START must have exactly one outgoing edge, found {}", start_edges),
                "edges",
            ));
        }

        let adjacency = Adjacency::build(self.spec);

        let from_start = reachable(&adjacency.all, START);
        if let Some(node) = self.first_node(|n| !from_start.contains(n.id.as_str())) {
            return Err(ValidationError::new(
                "reachability",
                format!("node '{}' is not reachable from START", node.id),
                format!("nodes.{}", node.id),
            ));
        }

        let to_end = reachable(&reversed(&adjacency.all), END);
        if let Some(node) = self.first_node(|n| !to_end.contains(n.id.as_str())) {
            return Err(ValidationError::new(
                "reachability",
                format!("node '{}' has no path to END", node.id),
                format!("nodes.{}", node.id),
            ));
        }

        Ok(())
    }

    fn first_node(&self, pred: impl Fn(&NodeSpec) -> bool) -> Option<&'a NodeSpec> {
        self.spec.nodes.iter().find(|n| pred(n))
    }
}

enum Shape {
    Same,
    Different,
    OutputInvalid(String),
    /// Reported by the state type stage
    StateInvalid,
}

fn same_shape(output: &FieldSpec, state: &FieldSpec) -> Shape {
    let out_ty = match parse_type(&output.type_name) {
        Ok(t) => t,
        Err(e) => return Shape::OutputInvalid(e.to_string()),
    };
    let Ok(state_ty) = parse_type(&state.type_name) else {
        return Shape::StateInvalid;
    };
    if out_ty != state_ty {
        return Shape::Different;
    }
    if !out_ty.is_object() {
        return Shape::Same;
    }

    match (&output.fields, &state.fields) {
        (Some(a), Some(b)) => {
            if a.len() != b.len() || a.keys().any(|k| !b.contains_key(k)) {
                return Shape::Different;
            }
            for (name, field) in a {
                match same_shape(field, &b[name]) {
                    Shape::Same => {}
                    other => return other,
                }
            }
            Shape::Same
        }
        // Output schemas may omit the nested shape and defer to state
        (None, _) => Shape::Same,
        (Some(_), None) => Shape::StateInvalid,
    }
}

fn check_field_types(
    fields: &BTreeMap<String, FieldSpec>,
    prefix: &str,
) -> Result<(), ValidationError> {
    for (name, field) in fields {
        let location = format!("{}.{}", prefix, name);
        parse_type(&field.type_name).map_err(|e| {
            ValidationError::new(
                "state_types",
                format!("field '{}' has invalid type: {}", name, e),
                location.clone(),
            )
        })?;
        if let Some(nested) = &field.fields {
            check_field_types(nested, &format!("{}.fields", location))?;
        }
    }
    Ok(())
}

/// Whether a dotted path names a declared field (descending into `object`
/// schemas, and anywhere below an untyped `dict`)
fn schema_has_path(fields: &BTreeMap<String, FieldSpec>, segments: &[&str]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return false;
    };
    let Some(field) = fields.get(*first) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    match &field.fields {
        Some(nested) => schema_has_path(nested, rest),
        None => matches!(parse_type(&field.type_name), Ok(TypeExpr::Dict(_))),
    }
}

/// Validate a workflow document
pub fn validate(spec: &WorkflowSpec) -> Result<(), ValidationError> {
    GraphValidator::new(spec).validate()
}

//! Workflow document types
//!
//! A workflow document is a declarative graph: typed state fields, nodes that
//! read and write those fields, and edges that wire nodes together between
//! the reserved `START` and `END` markers.

use super::LlmConfig;
use crate::sandbox::ResourcePreset;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Reserved entry marker
pub const START: &str = "START";
/// Reserved exit marker
pub const END: &str = "END";

fn default_schema_version() -> String {
    "1.0".to_string()
}

/// Full workflow document
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSpec {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    pub flow: FlowMeta,

    pub state: StateSection,

    #[serde(default)]
    pub nodes: Vec<NodeSpec>,

    #[serde(default)]
    pub edges: Vec<EdgeSpec>,

    /// Per-workflow overrides of the engine configuration
    #[serde(default)]
    pub config: WorkflowSettings,

    /// Opaque section consumed by external optimizers
    #[serde(default)]
    pub optimization: Option<Value>,
}

impl WorkflowSpec {
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The single edge declared by `from`, if any
    pub fn edge_from(&self, from: &str) -> Option<&EdgeSpec> {
        self.edges.iter().find(|e| e.from == from)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.config.execution.mode.unwrap_or_default()
    }

    /// Namespace for agent memory writes
    pub fn agent_id(&self) -> &str {
        self.flow.agent_id.as_deref().unwrap_or(&self.flow.name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FlowMeta {
    pub name: String,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub description: String,

    /// Agent namespace for memory writes; defaults to the flow name
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StateSection {
    #[serde(default, deserialize_with = "unique_fields")]
    pub fields: BTreeMap<String, FieldSpec>,
}

/// A typed field in the state schema (also used for node output schemas)
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<Value>,

    /// Nested schema for `object` fields
    #[serde(default, deserialize_with = "unique_nested_fields")]
    pub fields: Option<BTreeMap<String, FieldSpec>>,

    #[serde(default)]
    pub description: String,
}

impl FieldSpec {
    pub fn of_type(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            required: false,
            default: None,
            fields: None,
            description: String::new(),
        }
    }
}

/// Field map that rejects a name declared twice. TOML already refuses
/// duplicate keys; JSON objects would otherwise keep the last one.
struct UniqueFields(BTreeMap<String, FieldSpec>);

impl<'de> Deserialize<'de> for UniqueFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldsVisitor;

        impl<'de> Visitor<'de> for FieldsVisitor {
            type Value = UniqueFields;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of field names to field specs")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut fields = BTreeMap::new();
                while let Some((name, spec)) = map.next_entry::<String, FieldSpec>()? {
                    if fields.contains_key(&name) {
                        return Err(de::Error::custom(format!(
                            "duplicate state field '{}'",
                            name
                        )));
                    }
                    fields.insert(name, spec);
                }
                Ok(UniqueFields(fields))
            }
        }

        deserializer.deserialize_map(FieldsVisitor)
    }
}

fn unique_fields<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, FieldSpec>, D::Error> {
    UniqueFields::deserialize(deserializer).map(|f| f.0)
}

fn unique_nested_fields<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<BTreeMap<String, FieldSpec>>, D::Error> {
    Option::<UniqueFields>::deserialize(deserializer).map(|f| f.map(|f| f.0))
}

/// One unit of work: an LLM call or a sandboxed code snippet
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub id: String,

    #[serde(default)]
    pub description: String,

    /// Local input name -> template resolved against state
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,

    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub system_prompt: Option<String>,

    pub output_schema: FieldSpec,

    /// State fields this node writes
    #[serde(default)]
    pub outputs: Vec<String>,

    #[serde(default)]
    pub tools: Vec<String>,

    /// Overrides of the workflow LLM settings
    #[serde(default)]
    pub llm: Option<LlmConfig>,

    /// Script executed in a sandbox instead of calling a model
    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub sandbox: Option<SandboxSpec>,
}

impl NodeSpec {
    pub fn is_code_node(&self) -> bool {
        self.code.is_some()
    }
}

/// Sandbox backend selection
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// In-process restricted interpreter
    #[default]
    Restricted,
    /// Throwaway Docker container
    Container,
}

/// Per-node sandbox settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxSpec {
    #[serde(default)]
    pub mode: Option<SandboxMode>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub preset: Option<ResourcePreset>,

    #[serde(default)]
    pub cpus: Option<f64>,

    #[serde(default)]
    pub memory_mb: Option<u64>,

    #[serde(default)]
    pub network: Option<bool>,
}

/// Edge declaration: `from` plus exactly one target variant
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "RawEdge", into = "RawEdge")]
pub struct EdgeSpec {
    pub from: String,
    pub target: EdgeTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EdgeTarget {
    To(String),
    Routes(Vec<RouteSpec>),
    Loop(LoopSpec),
    Parallel(ParallelSpec),
}

impl EdgeTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            EdgeTarget::To(_) => "to",
            EdgeTarget::Routes(_) => "routes",
            EdgeTarget::Loop(_) => "loop",
            EdgeTarget::Parallel(_) => "parallel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    /// Boolean expression over state fields; empty means "always"
    #[serde(default)]
    pub condition: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoopSpec {
    /// Bool state field; true means run another iteration
    pub condition_field: String,
    pub max_iterations: u32,
    pub exit_to: String,
    /// Node re-entered on each iteration; defaults to the edge's source
    #[serde(default)]
    pub reenter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelSpec {
    pub items_field: String,
    pub target_node: String,
    pub collect_field: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawEdge {
    from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    routes: Option<Vec<RouteSpec>>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    loop_spec: Option<LoopSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parallel: Option<ParallelSpec>,
}

impl TryFrom<RawEdge> for EdgeSpec {
    type Error = String;

    fn try_from(raw: RawEdge) -> Result<Self, Self::Error> {
        let mut targets = Vec::new();
        if let Some(to) = raw.to {
            targets.push(EdgeTarget::To(to));
        }
        if let Some(routes) = raw.routes {
            targets.push(EdgeTarget::Routes(routes));
        }
        if let Some(spec) = raw.loop_spec {
            targets.push(EdgeTarget::Loop(spec));
        }
        if let Some(spec) = raw.parallel {
            targets.push(EdgeTarget::Parallel(spec));
        }

        if targets.len() != 1 {
            return Err(format!(
                "edge from '{}' must declare exactly one of to, routes, loop, parallel (found {})",
                raw.from,
                targets.len()
            ));
        }
        let target = targets.remove(0);
        Ok(EdgeSpec {
            from: raw.from,
            target,
        })
    }
}

impl From<EdgeSpec> for RawEdge {
    fn from(edge: EdgeSpec) -> Self {
        let mut raw = RawEdge {
            from: edge.from,
            to: None,
            routes: None,
            loop_spec: None,
            parallel: None,
        };
        match edge.target {
            EdgeTarget::To(to) => raw.to = Some(to),
            EdgeTarget::Routes(routes) => raw.routes = Some(routes),
            EdgeTarget::Loop(spec) => raw.loop_spec = Some(spec),
            EdgeTarget::Parallel(spec) => raw.parallel = Some(spec),
        }
        raw
    }
}

/// Graph topology the engine accepts
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Plain chains: single `to` edges, no cycles
    #[default]
    Linear,
    /// Adds conditional routes, bounded loops and parallel fan-out
    Extended,
}

/// Per-workflow `config` section
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSettings {
    #[serde(default)]
    pub execution: ExecutionSettings,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub observability: ObservabilitySettings,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionSettings {
    /// Falls back to the engine default when unset
    pub mode: Option<ExecutionMode>,

    /// Retries after the first model attempt
    pub max_retries: Option<u32>,

    /// Write each node's outputs to agent memory
    #[serde(default)]
    pub persist_memory: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilitySettings {
    /// Overrides the CLI log level (`debug`, `info`, `error`)
    pub log_level: Option<String>,

    /// Log resolved prompts at debug level
    #[serde(default)]
    pub trace_prompts: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUMMARIZE: &str = r#"
        schema_version = "1.0"

        [flow]
        name = "summarize"

        [state.fields.topic]
        type = "str"
        required = true

        [state.fields.result]
        type = "str"

        [[nodes]]
        id = "summarize"
        prompt = "Summarize {topic}"
        outputs = ["result"]
        output_schema = { type = "str" }

        [[edges]]
        from = "START"
        to = "summarize"

        [[edges]]
        from = "summarize"
        to = "END"
    "#;

    #[test]
    fn test_parse_workflow_toml() {
        let spec: WorkflowSpec = toml::from_str(SUMMARIZE).unwrap();
        assert_eq!(spec.flow.name, "summarize");
        assert_eq!(spec.state.fields.len(), 2);
        assert!(spec.state.fields["topic"].required);
        assert_eq!(spec.nodes[0].outputs, vec!["result"]);
        assert_eq!(
            spec.edge_from("START").unwrap().target,
            EdgeTarget::To("summarize".into())
        );
        assert_eq!(spec.execution_mode(), ExecutionMode::Linear);
        assert_eq!(spec.agent_id(), "summarize");
    }

    #[test]
    fn test_edge_requires_exactly_one_target() {
        let both = r#"{"from": "a", "to": "b", "routes": [{"condition": "", "to": "c"}]}"#;
        let err = serde_json::from_str::<EdgeSpec>(both).unwrap_err();
        assert!(err.to_string().contains("exactly one"));

        let none = r#"{"from": "a"}"#;
        assert!(serde_json::from_str::<EdgeSpec>(none).is_err());
    }

    #[test]
    fn test_parse_extended_edges() {
        let json = r#"[
            {"from": "draft", "loop": {"condition_field": "needs_work", "max_iterations": 3, "exit_to": "END"}},
            {"from": "split", "parallel": {"items_field": "docs", "target_node": "summarize", "collect_field": "summaries"}},
            {"from": "triage", "routes": [{"condition": "score > 5", "to": "deep"}, {"to": "END"}]}
        ]"#;
        let edges: Vec<EdgeSpec> = serde_json::from_str(json).unwrap();
        assert_eq!(edges[0].target.kind(), "loop");
        assert_eq!(edges[1].target.kind(), "parallel");
        match &edges[2].target {
            EdgeTarget::Routes(routes) => {
                assert_eq!(routes.len(), 2);
                assert!(routes[1].condition.is_empty());
            }
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[test]
    fn test_edge_serializes_back_to_flat_form() {
        let edge = EdgeSpec {
            from: "a".into(),
            target: EdgeTarget::To("END".into()),
        };
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json, serde_json::json!({"from": "a", "to": "END"}));
    }

    #[test]
    fn test_duplicate_state_field_rejected() {
        let json = r#"{
            "flow": {"name": "dup"},
            "state": {"fields": {"topic": {"type": "str"}, "topic": {"type": "int"}}}
        }"#;
        let err = serde_json::from_str::<WorkflowSpec>(json).unwrap_err();
        assert!(err.to_string().contains("duplicate state field 'topic'"));

        let nested = r#"{
            "type": "object",
            "fields": {"title": {"type": "str"}, "title": {"type": "str"}}
        }"#;
        assert!(serde_json::from_str::<FieldSpec>(nested).is_err());

        let null_fields = r#"{"type": "str", "fields": null}"#;
        let field: FieldSpec = serde_json::from_str(null_fields).unwrap();
        assert!(field.fields.is_none());
    }

    #[test]
    fn test_nested_field_spec() {
        let json = r#"{
            "type": "object",
            "fields": {
                "title": {"type": "str", "required": true},
                "tags": {"type": "list[str]", "default": []}
            }
        }"#;
        let field: FieldSpec = serde_json::from_str(json).unwrap();
        let nested = field.fields.unwrap();
        assert!(nested["title"].required);
        assert_eq!(nested["tags"].default, Some(serde_json::json!([])));
    }
}

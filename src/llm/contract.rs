//! Output contracts derived from a node's `output_schema`
//!
//! A contract turns a model reply (or a sandbox result) into the patch of
//! state fields the node declares. Shape problems surface as
//! [`LlmError::Contract`], which the retry loop treats as retryable.

use super::output_parser::extract_json;
use super::types::LlmError;
use crate::config::{FieldSpec, NodeSpec};
use crate::types::{TypeExpr, parse_type};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct OutputContract {
    /// Output field name -> declared field spec
    fields: Vec<(String, FieldSpec)>,
    /// `true` when the schema is a bare value rather than an object
    single: bool,
}

impl OutputContract {
    pub fn for_node(node: &NodeSpec) -> Result<Self, LlmError> {
        let schema = &node.output_schema;
        let is_object = parse_type(&schema.type_name)
            .map_err(|e| LlmError::config(format!("output_schema of '{}': {}", node.id, e)))?
            .is_object();

        if is_object {
            let nested = schema.fields.as_ref().ok_or_else(|| {
                LlmError::config(format!("output_schema of '{}' has no fields", node.id))
            })?;
            let fields = node
                .outputs
                .iter()
                .map(|name| {
                    nested
                        .get(name)
                        .cloned()
                        .map(|spec| (name.clone(), spec))
                        .ok_or_else(|| {
                            LlmError::config(format!(
                                "output '{}' of '{}' missing from output_schema",
                                name, node.id
                            ))
                        })
                })
                .collect::<Result<_, _>>()?;
            return Ok(Self {
                fields,
                single: false,
            });
        }

        match node.outputs.as_slice() {
            [name] => Ok(Self {
                fields: vec![(name.clone(), schema.clone())],
                single: true,
            }),
            _ => Err(LlmError::config(format!(
                "node '{}' must declare exactly one output for a '{}' schema",
                node.id, schema.type_name
            ))),
        }
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// JSON schema for structured output. Providers require an object at
    /// the top level, so a single-value schema is wrapped under its output
    /// name.
    pub fn json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, spec)| (name.clone(), field_schema(spec)))
            .collect();
        let required: Vec<&str> = self.output_names().collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Instruction appended to the prompt describing the expected reply
    pub fn format_instructions(&self) -> String {
        format!(
            "Respond with a JSON object matching this schema:\n{}",
            self.json_schema()
        )
    }

    /// Extract the declared outputs from model text
    pub fn extract(&self, text: &str) -> Result<Map<String, Value>, LlmError> {
        match extract_json(text) {
            Some(value) => match self.from_value(value) {
                Ok(patch) => Ok(patch),
                // a lone string output may legitimately be prose
                Err(_) if self.is_single_str() => Ok(self.single_patch(text.trim())),
                Err(e) => Err(e),
            },
            None if self.is_single_str() => Ok(self.single_patch(text.trim())),
            None => Err(LlmError::contract("reply contains no JSON document")),
        }
    }

    /// Map a structured value onto the declared outputs
    pub fn from_value(&self, value: Value) -> Result<Map<String, Value>, LlmError> {
        if self.single {
            let (name, spec) = &self.fields[0];
            let value = match value {
                Value::Object(mut map) if map.len() == 1 && map.contains_key(name) => {
                    map.remove(name).unwrap_or(Value::Null)
                }
                other => other,
            };
            check_type(name, spec, &value)?;
            let mut patch = Map::new();
            patch.insert(name.clone(), value);
            return Ok(patch);
        }

        let Value::Object(mut map) = value else {
            return Err(LlmError::contract(format!(
                "expected an object with fields [{}], got {}",
                self.output_names().collect::<Vec<_>>().join(", "),
                TypeExpr::describe_value(&value)
            )));
        };

        let mut patch = Map::new();
        for (name, spec) in &self.fields {
            let value = map
                .remove(name)
                .ok_or_else(|| LlmError::contract(format!("missing output field '{}'", name)))?;
            check_type(name, spec, &value)?;
            patch.insert(name.clone(), value);
        }
        Ok(patch)
    }

    fn is_single_str(&self) -> bool {
        self.single && parse_type(&self.fields[0].1.type_name) == Ok(TypeExpr::Str)
    }

    fn single_patch(&self, text: &str) -> Map<String, Value> {
        let mut patch = Map::new();
        patch.insert(self.fields[0].0.clone(), Value::String(text.to_string()));
        patch
    }
}

fn check_type(name: &str, spec: &FieldSpec, value: &Value) -> Result<(), LlmError> {
    let Ok(expected) = parse_type(&spec.type_name) else {
        return Ok(());
    };
    if expected.accepts(value) {
        Ok(())
    } else {
        Err(LlmError::contract(format!(
            "output '{}' expected {}, got {}",
            name,
            expected,
            TypeExpr::describe_value(value)
        )))
    }
}

/// JSON schema for one field spec
fn field_schema(spec: &FieldSpec) -> Value {
    let mut schema = match parse_type(&spec.type_name) {
        Ok(TypeExpr::Object) => object_schema(spec.fields.as_ref()),
        Ok(expr) => type_schema(&expr),
        Err(_) => json!({}),
    };
    if !spec.description.is_empty() {
        schema["description"] = Value::String(spec.description.clone());
    }
    schema
}

fn object_schema(fields: Option<&BTreeMap<String, FieldSpec>>) -> Value {
    let Some(fields) = fields else {
        return json!({"type": "object"});
    };
    let properties: Map<String, Value> = fields
        .iter()
        .map(|(name, spec)| (name.clone(), field_schema(spec)))
        .collect();
    let required: Vec<&String> = fields.keys().collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

fn type_schema(expr: &TypeExpr) -> Value {
    match expr {
        TypeExpr::Str => json!({"type": "string"}),
        TypeExpr::Int => json!({"type": "integer"}),
        TypeExpr::Float => json!({"type": "number"}),
        TypeExpr::Bool => json!({"type": "boolean"}),
        TypeExpr::List(None) => json!({"type": "array"}),
        TypeExpr::List(Some(item)) => json!({"type": "array", "items": type_schema(item)}),
        TypeExpr::Dict(None) | TypeExpr::Object => json!({"type": "object"}),
        TypeExpr::Dict(Some((_, value))) => {
            json!({"type": "object", "additionalProperties": type_schema(value)})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(value: Value) -> NodeSpec {
        serde_json::from_value(value).unwrap()
    }

    fn pair_node() -> NodeSpec {
        node(json!({
            "id": "split",
            "outputs": ["a", "b"],
            "output_schema": {"type": "object", "fields": {
                "a": {"type": "str"},
                "b": {"type": "int"}
            }}
        }))
    }

    #[test]
    fn test_object_contract_rejects_missing_field() {
        let contract = OutputContract::for_node(&pair_node()).unwrap();
        let err = contract.extract(r#"{"a": "x"}"#).unwrap_err();
        assert_eq!(err, LlmError::contract("missing output field 'b'"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_object_contract_extracts_fenced_reply() {
        let contract = OutputContract::for_node(&pair_node()).unwrap();
        let patch = contract
            .extract("Sure:\n```json\n{\"a\": \"x\", \"b\": 2, \"extra\": true}\n```")
            .unwrap();
        assert_eq!(patch.len(), 2);
        assert_eq!(patch["b"], 2);
    }

    #[test]
    fn test_type_mismatch_is_contract_error() {
        let contract = OutputContract::for_node(&pair_node()).unwrap();
        let err = contract.extract(r#"{"a": "x", "b": "two"}"#).unwrap_err();
        assert!(matches!(err, LlmError::Contract { .. }));
    }

    #[test]
    fn test_single_string_falls_back_to_text() {
        let contract = OutputContract::for_node(&node(json!({
            "id": "summarize",
            "outputs": ["summary"],
            "output_schema": {"type": "str"}
        })))
        .unwrap();

        assert_eq!(contract.extract("  A short summary. ").unwrap()["summary"], "A short summary.");
        assert_eq!(contract.extract(r#"{"summary": "wrapped"}"#).unwrap()["summary"], "wrapped");
    }

    #[test]
    fn test_padded_str_type_still_accepts_prose() {
        let contract = OutputContract::for_node(&node(json!({
            "id": "summarize",
            "outputs": ["summary"],
            "output_schema": {"type": " str "}
        })))
        .unwrap();

        assert_eq!(contract.extract("Plain prose.").unwrap()["summary"], "Plain prose.");
    }

    #[test]
    fn test_single_value_schema_is_wrapped() {
        let contract = OutputContract::for_node(&node(json!({
            "id": "tags",
            "outputs": ["tags"],
            "output_schema": {"type": "list[str]"}
        })))
        .unwrap();

        let schema = contract.json_schema();
        assert_eq!(schema["properties"]["tags"]["items"]["type"], "string");
        assert_eq!(schema["required"], json!(["tags"]));

        assert_eq!(contract.extract(r#"["a", "b"]"#).unwrap()["tags"], json!(["a", "b"]));
        assert!(contract.extract("no list here").is_err());
    }

    #[test]
    fn test_from_value_for_sandbox_results() {
        let contract = OutputContract::for_node(&pair_node()).unwrap();
        let patch = contract.from_value(json!({"a": "x", "b": 3})).unwrap();
        assert_eq!(patch["a"], "x");
        assert!(contract.from_value(json!(3)).is_err());
    }
}

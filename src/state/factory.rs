//! Schema-driven state factory

use super::error::{StateBuilderError, StateError};
use super::runtime::RuntimeState;
use crate::config::FieldSpec;
use crate::types::{TypeExpr, parse_type};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
struct FieldNode {
    ty: TypeExpr,
    required: bool,
    default: Option<Value>,
    nested: Option<StateFactory>,
}

/// Builds validated runtime states for one schema.
///
/// Cloning is cheap; clones share the compiled schema.
#[derive(Debug, Clone)]
pub struct StateFactory {
    fields: Arc<BTreeMap<String, FieldNode>>,
}

impl StateFactory {
    /// Compile a schema into a factory
    pub fn build(schema: &BTreeMap<String, FieldSpec>) -> Result<Self, StateBuilderError> {
        if schema.is_empty() {
            return Err(StateBuilderError::EmptySchema);
        }
        Self::build_at(schema, "")
    }

    fn build_at(
        schema: &BTreeMap<String, FieldSpec>,
        prefix: &str,
    ) -> Result<Self, StateBuilderError> {
        let mut fields = BTreeMap::new();

        for (name, spec) in schema {
            let path = join_path(prefix, name);
            let ty = parse_type(&spec.type_name).map_err(|source| {
                StateBuilderError::InvalidType {
                    path: path.clone(),
                    source,
                }
            })?;

            let nested = if ty.is_object() {
                let nested_schema = spec.fields.as_ref().ok_or_else(|| {
                    StateBuilderError::MissingNestedSchema { path: path.clone() }
                })?;
                if nested_schema.is_empty() {
                    return Err(StateBuilderError::EmptyNestedSchema { path });
                }
                Some(Self::build_at(nested_schema, &path)?)
            } else {
                if spec.fields.is_some() {
                    return Err(StateBuilderError::UnexpectedNestedSchema { path });
                }
                None
            };

            if spec.required && spec.default.is_some() {
                return Err(StateBuilderError::RequiredWithDefault { path });
            }

            let default = match &spec.default {
                None => None,
                Some(value) => {
                    let checked = match &nested {
                        Some(factory) => value
                            .as_object()
                            .and_then(|obj| factory.materialize(obj, &path).ok())
                            .map(Value::Object),
                        None => ty.accepts(value).then(|| value.clone()),
                    };
                    match checked {
                        Some(v) => Some(v),
                        None => {
                            return Err(StateBuilderError::InvalidDefault {
                                path,
                                expected: ty.to_string(),
                            });
                        }
                    }
                }
            };

            fields.insert(
                name.clone(),
                FieldNode {
                    ty,
                    required: spec.required,
                    default,
                    nested,
                },
            );
        }

        Ok(Self {
            fields: Arc::new(fields),
        })
    }

    /// Construct a state; omitted fields take their default or null
    pub fn create(&self, values: Map<String, Value>) -> Result<RuntimeState, StateError> {
        let materialized = self.materialize(&values, "")?;
        Ok(RuntimeState::new(materialized, self.clone()))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_type(&self, name: &str) -> Option<&TypeExpr> {
        self.fields.get(name).map(|f| &f.ty)
    }

    pub fn nested(&self, name: &str) -> Option<&StateFactory> {
        self.fields.get(name).and_then(|f| f.nested.as_ref())
    }

    /// Whether a dotted path names a field in this schema. Paths may descend
    /// into nested objects, and past any non-object container (whose shape is
    /// not declared).
    pub fn has_path(&self, segments: &[&str]) -> bool {
        let Some((first, rest)) = segments.split_first() else {
            return false;
        };
        match self.fields.get(*first) {
            None => false,
            Some(_) if rest.is_empty() => true,
            Some(node) => match &node.nested {
                Some(nested) => nested.has_path(rest),
                None => matches!(node.ty, TypeExpr::Dict(_)),
            },
        }
    }

    /// Validate `values` against the schema and fill defaults
    pub(crate) fn materialize(
        &self,
        values: &Map<String, Value>,
        prefix: &str,
    ) -> Result<Map<String, Value>, StateError> {
        if let Some(unknown) = values.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(StateError::UnknownField {
                path: join_path(prefix, unknown),
            });
        }

        let mut out = Map::new();
        for (name, node) in self.fields.iter() {
            let path = join_path(prefix, name);
            let value = match values.get(name) {
                None if node.required => return Err(StateError::MissingField { path }),
                None => node.default.clone().unwrap_or(Value::Null),
                Some(Value::Null) if node.required => {
                    return Err(StateError::TypeMismatch {
                        path,
                        expected: node.ty.to_string(),
                        actual: "null".into(),
                    });
                }
                Some(Value::Null) => Value::Null,
                Some(value) => node.check(value, &path)?,
            };
            out.insert(name.clone(), value);
        }
        Ok(out)
    }
}

impl FieldNode {
    fn check(&self, value: &Value, path: &str) -> Result<Value, StateError> {
        match (&self.nested, value) {
            (Some(nested), Value::Object(obj)) => Ok(Value::Object(nested.materialize(obj, path)?)),
            (None, value) if self.ty.accepts(value) => Ok(value.clone()),
            _ => Err(StateError::TypeMismatch {
                path: path.to_string(),
                expected: self.ty.to_string(),
                actual: TypeExpr::describe_value(value).to_string(),
            }),
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

//! Immutable runtime state

use super::error::StateError;
use super::factory::StateFactory;
use serde_json::{Map, Value};
use std::sync::Arc;

/// A validated state snapshot.
///
/// Updates go through [`RuntimeState::with_fields`], which returns a new
/// state and leaves `self` untouched. Clones share the underlying map.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    values: Arc<Map<String, Value>>,
    factory: StateFactory,
}

impl RuntimeState {
    pub(super) fn new(values: Map<String, Value>, factory: StateFactory) -> Self {
        Self {
            values: Arc::new(values),
            factory,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Look up a dotted path such as `report.meta.title`
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.values.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn factory(&self) -> &StateFactory {
        &self.factory
    }

    pub fn to_value(&self) -> Value {
        Value::Object((*self.values).clone())
    }

    /// Serialized snapshot for checkpoints
    pub fn to_json(&self) -> String {
        // A map of JSON values always serializes.
        serde_json::to_string(&*self.values).unwrap_or_else(|_| "{}".to_string())
    }

    /// Apply `patch` and revalidate against the full schema
    pub fn with_fields(&self, patch: Map<String, Value>) -> Result<RuntimeState, StateError> {
        if patch.is_empty() {
            return Ok(self.clone());
        }
        let mut merged = (*self.values).clone();
        merged.extend(patch);
        let values = self.factory.materialize(&merged, "")?;
        Ok(RuntimeState::new(values, self.factory.clone()))
    }
}

impl PartialEq for RuntimeState {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldSpec;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn factory() -> StateFactory {
        let schema: BTreeMap<String, FieldSpec> = serde_json::from_value(json!({
            "topic": {"type": "str", "required": true},
            "count": {"type": "int", "default": 0},
            "meta": {"type": "object", "fields": {"lang": {"type": "str", "default": "en"}}}
        }))
        .unwrap();
        StateFactory::build(&schema).unwrap()
    }

    #[test]
    fn test_with_fields_is_copy_on_write() {
        let before = factory()
            .create(json!({"topic": "AI"}).as_object().unwrap().clone())
            .unwrap();

        let mut patch = Map::new();
        patch.insert("count".into(), json!(5));
        let after = before.with_fields(patch).unwrap();

        assert_eq!(before.get("count"), Some(&json!(0)));
        assert_eq!(after.get("count"), Some(&json!(5)));
        assert_eq!(after.get("topic"), Some(&json!("AI")));
    }

    #[test]
    fn test_with_fields_revalidates() {
        let state = factory()
            .create(json!({"topic": "AI"}).as_object().unwrap().clone())
            .unwrap();

        let mut patch = Map::new();
        patch.insert("count".into(), json!("many"));
        assert!(matches!(
            state.with_fields(patch),
            Err(StateError::TypeMismatch { .. })
        ));

        let mut patch = Map::new();
        patch.insert("bogus".into(), json!(1));
        assert!(matches!(
            state.with_fields(patch),
            Err(StateError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_get_path_and_snapshot() {
        let state = factory()
            .create(json!({"topic": "AI", "meta": {}}).as_object().unwrap().clone())
            .unwrap();
        assert_eq!(state.get_path("meta.lang"), Some(&json!("en")));
        assert_eq!(state.get_path("meta.missing"), None);

        let snapshot: Value = serde_json::from_str(&state.to_json()).unwrap();
        assert_eq!(snapshot["topic"], json!("AI"));
    }
}

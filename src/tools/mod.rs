//! Named tools a model may call during a node run

use crate::llm::ToolDefinition;
use crate::template::suggest_correction;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("unknown tool '{name}'{}", .suggestion.as_ref().map(|s| format!(", did you mean '{}'?", s)).unwrap_or_default())]
    NotFound {
        name: String,
        suggestion: Option<String>,
    },

    #[error("invalid arguments for '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("tool '{tool}' failed: {message}")]
    Invocation { tool: String, message: String },
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Name used in model tool calls
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the argument object
    fn parameters(&self) -> Value;

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Lookup of tools by name, shared across runs
pub trait ToolRegistry: Send + Sync {
    fn get(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError>;

    fn names(&self) -> Vec<String>;
}

/// Registry backed by a fixed map filled at startup
#[derive(Default, Clone)]
pub struct StaticToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any earlier one with the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }
}

impl ToolRegistry for StaticToolRegistry {
    fn get(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.tools.get(name).cloned().ok_or_else(|| {
            let known: Vec<&str> = self.tools.keys().map(String::as_str).collect();
            ToolError::NotFound {
                name: name.to_string(),
                suggestion: suggest_correction(name, &known),
            }
        })
    }

    fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

/// Check the `required` list of a tool's parameter schema against the
/// arguments a model supplied
pub fn validate_arguments(tool: &dyn Tool, arguments: &Value) -> Result<(), ToolError> {
    let schema = tool.parameters();
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let Some(args) = arguments.as_object() else {
        return Err(ToolError::InvalidArguments {
            tool: tool.name().to_string(),
            message: "arguments must be an object".into(),
        });
    };
    let missing: Vec<&str> = required
        .iter()
        .filter_map(Value::as_str)
        .filter(|key| !args.contains_key(*key))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments {
            tool: tool.name().to_string(),
            message: format!("missing required: [{}]", missing.join(", ")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "uppercase"
        }

        fn description(&self) -> &str {
            "Uppercase a string"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }

        async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
            let text = arguments["text"].as_str().unwrap_or_default();
            Ok(Value::String(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn test_registry_lookup_and_invoke() {
        let registry = StaticToolRegistry::new().with_tool(Arc::new(Upper));
        let tool = registry.get("uppercase").unwrap();
        assert_eq!(tool.invoke(json!({"text": "hi"})).await.unwrap(), "HI");
        assert_eq!(tool.definition().name, "uppercase");
        assert_eq!(registry.names(), vec!["uppercase".to_string()]);
    }

    #[test]
    fn test_unknown_tool_suggests() {
        let registry = StaticToolRegistry::new().with_tool(Arc::new(Upper));
        let err = registry.get("upercase").err().unwrap();
        assert_eq!(
            err,
            ToolError::NotFound {
                name: "upercase".into(),
                suggestion: Some("uppercase".into()),
            }
        );
        assert!(err.to_string().contains("did you mean 'uppercase'"));
    }

    #[test]
    fn test_validate_arguments() {
        assert!(validate_arguments(&Upper, &json!({"text": "x"})).is_ok());
        assert!(matches!(
            validate_arguments(&Upper, &json!({})),
            Err(ToolError::InvalidArguments { .. })
        ));
    }
}

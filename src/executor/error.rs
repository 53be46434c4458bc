//! Node execution errors

use crate::llm::LlmError;
use crate::state::StateError;
use crate::template::TemplateResolutionError;
use crate::tools::ToolError;
use std::fmt;
use thiserror::Error;

/// Lifecycle stage of a single node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStage {
    ResolvingInputs,
    ResolvingPrompt,
    Invoking,
    RunningSandbox,
    ValidatingOutput,
    Persisting,
}

impl NodeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStage::ResolvingInputs => "resolving_inputs",
            NodeStage::ResolvingPrompt => "resolving_prompt",
            NodeStage::Invoking => "invoking",
            NodeStage::RunningSandbox => "running_sandbox",
            NodeStage::ValidatingOutput => "validating_output",
            NodeStage::Persisting => "persisting",
        }
    }
}

impl fmt::Display for NodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Underlying cause of a node failure
#[derive(Debug, Error)]
pub enum NodeFailure {
    #[error("input '{local}' = \"{template}\": {source}")]
    Input {
        local: String,
        template: String,
        source: TemplateResolutionError,
    },

    #[error(transparent)]
    Template(#[from] TemplateResolutionError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("sandbox '{backend}' failed: {message}")]
    Sandbox { backend: String, message: String },

    #[error("sandbox mode '{0}' is not available")]
    SandboxUnavailable(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("declared output '{0}' was not produced")]
    MissingOutput(String),
}

#[derive(Debug, Error)]
#[error("node '{node_id}' failed at {stage}: {failure}")]
pub struct NodeExecutionError {
    pub node_id: String,
    pub stage: NodeStage,
    #[source]
    pub failure: NodeFailure,
}

impl NodeExecutionError {
    pub fn new(node_id: impl Into<String>, stage: NodeStage, failure: impl Into<NodeFailure>) -> Self {
        Self {
            node_id: node_id.into(),
            stage,
            failure: failure.into(),
        }
    }
}

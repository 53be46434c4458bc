//! Configuration types and loading for flowstate

mod llm;
mod loader;
mod workflow;

pub use llm::LlmConfig;
pub use loader::{Defaults, EngineConfig, SandboxDefaults, StorageConfig, load_workflow_file};
pub use workflow::{
    END, EdgeSpec, EdgeTarget, ExecutionMode, ExecutionSettings, FieldSpec, FlowMeta, LoopSpec,
    NodeSpec, ObservabilitySettings, ParallelSpec, RouteSpec, START, SandboxMode, SandboxSpec,
    StateSection, WorkflowSettings, WorkflowSpec,
};

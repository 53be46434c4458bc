//! Node execution
//!
//! One node run moves through fixed stages:
//! `resolving_inputs -> resolving_prompt -> invoking | running_sandbox ->
//! validating_output -> persisting`. A failure at any stage carries the node
//! id and the stage it happened in.

mod error;
mod node;

pub use error::{NodeExecutionError, NodeFailure, NodeStage};
pub use node::{MAX_TOOL_ROUNDS, NodeExecutor, NodeOutcome};

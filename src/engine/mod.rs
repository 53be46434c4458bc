//! Graph execution engine
//!
//! Walks a validated workflow from `START` to `END` on one task:
//! - `to` edges advance unconditionally
//! - `routes` pick the first condition that holds
//! - `loop` edges re-enter a node while a bool field is true, up to a cap
//! - `parallel` edges fan a list field out to concurrent runs of one node
//!   and collect the results in input order
//!
//! Every run is registered before the first node and completed exactly once,
//! whether it succeeds, fails or is cancelled.
//!
//! # Example
//!
//! ```ignore
//! use flowstate::engine::{CancellationToken, EngineDeps, WorkflowEngine};
//!
//! let engine = WorkflowEngine::compile(spec, &config, deps)?;
//! let outcome = engine.run(inputs, &CancellationToken::new()).await?;
//! println!("{} finished: {}", outcome.run_id, outcome.status);
//! ```

mod cancel;
mod runner;

pub use cancel::CancellationToken;
pub use runner::{EngineDeps, NodeTiming, RunOutcome, WorkflowEngine};

use crate::executor::NodeExecutionError;
use crate::state::{StateBuilderError, StateError};
use crate::storage::StoreError;
use crate::template::ConditionError;
use crate::validation::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid state schema: {0}")]
    Schema(#[from] StateBuilderError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Node(#[from] NodeExecutionError),

    #[error("route condition after '{node}' failed: {source}")]
    Condition {
        node: String,
        source: ConditionError,
    },

    #[error("no route after '{node}' matched the current state")]
    NoRoute { node: String },

    #[error("'{node}' has no outgoing edge")]
    NoEdge { node: String },

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("loop on '{node}' exceeded {max_iterations} iterations")]
    LoopLimit { node: String, max_iterations: u32 },

    #[error("parallel items field '{field}' is not a list")]
    NotAList { field: String },

    #[error("run cancelled before '{next}'")]
    Cancelled { next: String },
}

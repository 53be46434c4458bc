//! Run persistence: checkpoints, run registry and agent memory

mod schema;
mod sqlite;
mod types;

pub use sqlite::SqliteStore;
pub use types::{
    AgentMemory, CheckpointStatus, CheckpointStore, ExecutionCheckpoint, MemoryKey, RunCompletion,
    RunRecord, RunRegistry, RunStatus, StoreError,
};

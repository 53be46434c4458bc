//! Persistence records and store contracts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("run '{0}' is not registered")]
    UnknownRun(String),

    #[error("run '{0}' is already registered")]
    DuplicateRun(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Lock,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(CheckpointStatus::Completed),
            "failed" => Some(CheckpointStatus::Failed),
            _ => None,
        }
    }
}

/// State snapshot written after a node finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    pub id: Option<i64>,
    pub run_id: String,
    pub node_id: String,
    /// JSON of the full state after the node
    pub state_snapshot: String,
    pub status: CheckpointStatus,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionCheckpoint {
    pub fn new(
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        state_snapshot: impl Into<String>,
        status: CheckpointStatus,
    ) -> Self {
        Self {
            id: None,
            run_id: run_id.into(),
            node_id: node_id.into(),
            state_snapshot: state_snapshot.into(),
            status,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One workflow run as recorded by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    /// JSON of the final state
    pub outputs: Option<String>,
    pub error: Option<String>,
    /// JSON summary of the slowest node
    pub bottleneck: Option<String>,
}

/// Everything written when a run finishes
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub duration_ms: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub outputs: Option<String>,
    pub error: Option<String>,
    pub bottleneck: Option<String>,
}

/// Scope of one agent memory entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryKey {
    pub agent_id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub key: String,
}

impl MemoryKey {
    pub fn new(
        agent_id: impl Into<String>,
        workflow_id: impl Into<String>,
        node_id: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            workflow_id: workflow_id.into(),
            node_id: node_id.into(),
            key: key.into(),
        }
    }
}

/// Append-only checkpoint log
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint; fails if the run was never registered
    fn save_checkpoint(&self, checkpoint: &ExecutionCheckpoint) -> Result<i64, StoreError>;

    fn latest_checkpoint(&self, run_id: &str) -> Result<Option<ExecutionCheckpoint>, StoreError>;

    /// All checkpoints of a run, oldest first
    fn checkpoint_history(&self, run_id: &str) -> Result<Vec<ExecutionCheckpoint>, StoreError>;
}

/// Run lifecycle bookkeeping
pub trait RunRegistry: Send + Sync {
    /// Register a new run as `pending`
    fn register_run(&self, run_id: &str, workflow_name: &str) -> Result<(), StoreError>;

    fn mark_running(&self, run_id: &str) -> Result<(), StoreError>;

    fn complete_run(&self, run_id: &str, completion: &RunCompletion) -> Result<(), StoreError>;

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError>;

    /// Most recently started runs first
    fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;
}

/// Namespaced key/value memory that outlives runs
pub trait AgentMemory: Send + Sync {
    fn remember(&self, key: &MemoryKey, value: &Value) -> Result<(), StoreError>;

    fn recall(&self, key: &MemoryKey) -> Result<Option<Value>, StoreError>;

    /// Returns whether an entry was removed
    fn forget(&self, key: &MemoryKey) -> Result<bool, StoreError>;

    fn list(&self, agent_id: &str, workflow_id: &str) -> Result<Vec<(MemoryKey, Value)>, StoreError>;
}

//! SQLite-backed checkpoint store, run registry and agent memory

use super::schema::init_schema;
use super::types::{
    AgentMemory, CheckpointStatus, CheckpointStore, ExecutionCheckpoint, MemoryKey, RunCompletion,
    RunRecord, RunRegistry, RunStatus, StoreError,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// One connection shared by every run; writes are serialized by the mutex
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        tracing::debug!(path = %path.display(), "opened checkpoint store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }

    fn run_exists(conn: &Connection, run_id: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM runs WHERE run_id = ?1", [run_id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn set_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs SET status = ?1 WHERE run_id = ?2",
            (status.as_str(), run_id),
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownRun(run_id.to_string()));
        }
        Ok(())
    }
}

fn parse_time(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn bad_enum(idx: usize, text: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected status '{}'", text).into(),
    )
}

const CHECKPOINT_COLUMNS: &str = "id, run_id, node_id, state_snapshot, status, prompt_tokens, \
     completion_tokens, cost_usd, duration_ms, created_at";

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionCheckpoint> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(9)?;
    Ok(ExecutionCheckpoint {
        id: Some(row.get(0)?),
        run_id: row.get(1)?,
        node_id: row.get(2)?,
        state_snapshot: row.get(3)?,
        status: CheckpointStatus::parse(&status).ok_or_else(|| bad_enum(4, &status))?,
        prompt_tokens: row.get::<_, i64>(5)? as u64,
        completion_tokens: row.get::<_, i64>(6)? as u64,
        cost_usd: row.get(7)?,
        duration_ms: row.get::<_, i64>(8)? as u64,
        created_at: parse_time(9, &created_at)?,
    })
}

const RUN_COLUMNS: &str = "run_id, workflow_name, status, started_at, ended_at, duration_ms, \
     total_tokens, total_cost_usd, outputs, error, bottleneck";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(2)?;
    let started_at: String = row.get(3)?;
    let ended_at: Option<String> = row.get(4)?;
    Ok(RunRecord {
        run_id: row.get(0)?,
        workflow_name: row.get(1)?,
        status: RunStatus::parse(&status).ok_or_else(|| bad_enum(2, &status))?,
        started_at: parse_time(3, &started_at)?,
        ended_at: ended_at.map(|t| parse_time(4, &t)).transpose()?,
        duration_ms: row.get::<_, Option<i64>>(5)?.map(|d| d as u64),
        total_tokens: row.get::<_, i64>(6)? as u64,
        total_cost_usd: row.get(7)?,
        outputs: row.get(8)?,
        error: row.get(9)?,
        bottleneck: row.get(10)?,
    })
}

impl CheckpointStore for SqliteStore {
    fn save_checkpoint(&self, checkpoint: &ExecutionCheckpoint) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        if !Self::run_exists(&conn, &checkpoint.run_id)? {
            return Err(StoreError::UnknownRun(checkpoint.run_id.clone()));
        }

        conn.execute(
            "INSERT INTO checkpoints (run_id, node_id, state_snapshot, status, prompt_tokens,
                completion_tokens, cost_usd, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            (
                &checkpoint.run_id,
                &checkpoint.node_id,
                &checkpoint.state_snapshot,
                checkpoint.status.as_str(),
                checkpoint.prompt_tokens as i64,
                checkpoint.completion_tokens as i64,
                checkpoint.cost_usd,
                checkpoint.duration_ms as i64,
                checkpoint.created_at.to_rfc3339(),
            ),
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn latest_checkpoint(&self, run_id: &str) -> Result<Option<ExecutionCheckpoint>, StoreError> {
        let conn = self.conn()?;
        let checkpoint = conn
            .query_row(
                &format!(
                    "SELECT {} FROM checkpoints WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
                    CHECKPOINT_COLUMNS
                ),
                [run_id],
                checkpoint_from_row,
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn checkpoint_history(&self, run_id: &str) -> Result<Vec<ExecutionCheckpoint>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM checkpoints WHERE run_id = ?1 ORDER BY id ASC",
            CHECKPOINT_COLUMNS
        ))?;

        let checkpoints = stmt
            .query_map([run_id], checkpoint_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(checkpoints)
    }
}

impl RunRegistry for SqliteStore {
    fn register_run(&self, run_id: &str, workflow_name: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        if Self::run_exists(&conn, run_id)? {
            return Err(StoreError::DuplicateRun(run_id.to_string()));
        }
        conn.execute(
            "INSERT INTO runs (run_id, workflow_name, status, started_at) VALUES (?1, ?2, ?3, ?4)",
            (
                run_id,
                workflow_name,
                RunStatus::Pending.as_str(),
                Utc::now().to_rfc3339(),
            ),
        )?;
        Ok(())
    }

    fn mark_running(&self, run_id: &str) -> Result<(), StoreError> {
        self.set_status(run_id, RunStatus::Running)
    }

    fn complete_run(&self, run_id: &str, completion: &RunCompletion) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runs SET status = ?1, ended_at = ?2, duration_ms = ?3, total_tokens = ?4,
                total_cost_usd = ?5, outputs = ?6, error = ?7, bottleneck = ?8
             WHERE run_id = ?9",
            (
                completion.status.as_str(),
                Utc::now().to_rfc3339(),
                completion.duration_ms as i64,
                completion.total_tokens as i64,
                completion.total_cost_usd,
                &completion.outputs,
                &completion.error,
                &completion.bottleneck,
                run_id,
            ),
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownRun(run_id.to_string()));
        }
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.conn()?;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
                [run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;

        let runs = stmt
            .query_map([limit as i64], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }
}

impl AgentMemory for SqliteStore {
    fn remember(&self, key: &MemoryKey, value: &Value) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agent_memory (agent_id, workflow_id, node_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(agent_id, workflow_id, node_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            (
                &key.agent_id,
                &key.workflow_id,
                &key.node_id,
                &key.key,
                &encoded,
                Utc::now().to_rfc3339(),
            ),
        )?;
        Ok(())
    }

    fn recall(&self, key: &MemoryKey) -> Result<Option<Value>, StoreError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM agent_memory
                 WHERE agent_id = ?1 AND workflow_id = ?2 AND node_id = ?3 AND key = ?4",
                (&key.agent_id, &key.workflow_id, &key.node_id, &key.key),
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn forget(&self, key: &MemoryKey) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM agent_memory
             WHERE agent_id = ?1 AND workflow_id = ?2 AND node_id = ?3 AND key = ?4",
            (&key.agent_id, &key.workflow_id, &key.node_id, &key.key),
        )?;
        Ok(removed > 0)
    }

    fn list(&self, agent_id: &str, workflow_id: &str) -> Result<Vec<(MemoryKey, Value)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, key, value FROM agent_memory
             WHERE agent_id = ?1 AND workflow_id = ?2
             ORDER BY node_id, key",
        )?;

        let rows = stmt
            .query_map([agent_id, workflow_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (node_id, key, value) in rows {
            entries.push((
                MemoryKey::new(agent_id, workflow_id, node_id, key),
                serde_json::from_str(&value)?,
            ));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_checkpoint_requires_registered_run() {
        let store = store();
        let checkpoint =
            ExecutionCheckpoint::new("missing", "node", "{}", CheckpointStatus::Completed);
        assert!(matches!(
            store.save_checkpoint(&checkpoint),
            Err(StoreError::UnknownRun(_))
        ));
    }

    #[test]
    fn test_checkpoint_history_oldest_first() {
        let store = store();
        store.register_run("run-1", "flow").unwrap();

        for (i, node) in ["a", "b", "c"].iter().enumerate() {
            let mut checkpoint = ExecutionCheckpoint::new(
                "run-1",
                *node,
                format!("{{\"step\": {}}}", i),
                CheckpointStatus::Completed,
            );
            checkpoint.prompt_tokens = 10;
            checkpoint.completion_tokens = 5;
            store.save_checkpoint(&checkpoint).unwrap();
        }

        let history = store.checkpoint_history("run-1").unwrap();
        let nodes: Vec<&str> = history.iter().map(|c| c.node_id.as_str()).collect();
        assert_eq!(nodes, vec!["a", "b", "c"]);
        assert_eq!(history[0].total_tokens(), 15);

        let latest = store.latest_checkpoint("run-1").unwrap().unwrap();
        assert_eq!(latest.node_id, "c");
        assert!(store.latest_checkpoint("other").unwrap().is_none());
    }

    #[test]
    fn test_run_lifecycle() {
        let store = store();
        store.register_run("run-1", "flow").unwrap();
        assert_eq!(store.get_run("run-1").unwrap().unwrap().status, RunStatus::Pending);
        assert!(matches!(
            store.register_run("run-1", "flow"),
            Err(StoreError::DuplicateRun(_))
        ));

        store.mark_running("run-1").unwrap();
        assert_eq!(store.get_run("run-1").unwrap().unwrap().status, RunStatus::Running);

        store
            .complete_run(
                "run-1",
                &RunCompletion {
                    status: RunStatus::Completed,
                    duration_ms: 1200,
                    total_tokens: 42,
                    total_cost_usd: 0.01,
                    outputs: Some("{\"result\":\"ok\"}".into()),
                    error: None,
                    bottleneck: Some("{\"node_id\":\"a\"}".into()),
                },
            )
            .unwrap();

        let run = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.duration_ms, Some(1200));
        assert_eq!(run.total_tokens, 42);
        assert!(run.ended_at.is_some());

        assert!(matches!(
            store.mark_running("nope"),
            Err(StoreError::UnknownRun(_))
        ));
    }

    #[test]
    fn test_recent_runs() {
        let store = store();
        store.register_run("r1", "flow").unwrap();
        store.register_run("r2", "flow").unwrap();
        store.register_run("r3", "other").unwrap();

        let runs = store.recent_runs(2).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "r3");
    }

    #[test]
    fn test_agent_memory() {
        let store = store();
        let key = MemoryKey::new("agent", "flow", "summarize", "result");

        assert!(store.recall(&key).unwrap().is_none());
        store.remember(&key, &json!({"text": "hello"})).unwrap();
        store.remember(&key, &json!({"text": "updated"})).unwrap();
        assert_eq!(store.recall(&key).unwrap(), Some(json!({"text": "updated"})));

        let other = MemoryKey::new("agent", "other-flow", "summarize", "result");
        store.remember(&other, &json!(1)).unwrap();

        let entries = store.list("agent", "flow").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, key);

        assert!(store.forget(&key).unwrap());
        assert!(!store.forget(&key).unwrap());
        assert!(store.recall(&key).unwrap().is_none());
    }

    #[test]
    fn test_open_file_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("runs.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.register_run("run-1", "flow").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_run("run-1").unwrap().is_some());
    }
}

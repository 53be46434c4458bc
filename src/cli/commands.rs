//! CLI command implementations

use super::output::{OutputEvent, OutputHandler};
use crate::config::{EngineConfig, WorkflowSpec, load_workflow_file};
use crate::engine::{CancellationToken, EngineDeps, EngineError, WorkflowEngine};
use crate::llm::OpenAiClient;
use crate::sandbox::Sandboxes;
use crate::state::StateFactory;
use crate::storage::{CheckpointStore, RunRegistry, SqliteStore};
use crate::tools::StaticToolRegistry;
use crate::validation::{ValidationError, validate};
use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

/// Validate a workflow document without running it
pub fn validate_workflow(
    path: &Path,
    config: &EngineConfig,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    // Documents that fail to parse (bad syntax, duplicate fields, unknown
    // keys) are reported like any other invalid workflow
    let mut spec = match load_workflow_file(path) {
        Ok(spec) => spec,
        Err(e) => {
            handler.emit(OutputEvent::WorkflowInvalid {
                stage: "document".into(),
                message: format!("{:#}", e),
                location: path.display().to_string(),
                suggestion: None,
            });
            return Ok(1);
        }
    };
    config.apply_defaults(&mut spec);

    if let Err(e) = validate(&spec) {
        handler.emit(invalid(&e));
        return Ok(1);
    }
    if let Err(e) = StateFactory::build(&spec.state.fields) {
        handler.emit(OutputEvent::WorkflowInvalid {
            stage: "state_schema".into(),
            message: e.to_string(),
            location: "state.fields".into(),
            suggestion: None,
        });
        return Ok(1);
    }

    handler.emit(OutputEvent::WorkflowValid {
        name: spec.flow.name.clone(),
        nodes: spec.nodes.len(),
        edges: spec.edges.len(),
    });
    Ok(0)
}

/// Run a workflow once and print its final state
pub async fn run_workflow(
    path: &Path,
    args: &[String],
    config: &EngineConfig,
    store: Arc<SqliteStore>,
    handler: &dyn OutputHandler,
    cancel: &CancellationToken,
) -> Result<i32> {
    let spec = load_workflow_file(path)?;
    let inputs = parse_inputs(args, &spec)?;
    let effective = config.for_workflow(&spec);

    let llm = OpenAiClient::from_config(&effective.llm).context("creating model client")?;
    let deps = EngineDeps::with_store(
        Arc::new(llm),
        Arc::new(StaticToolRegistry::new()),
        Sandboxes::from_defaults(&effective.sandbox),
        store,
    );

    let engine = match WorkflowEngine::compile(spec, config, deps) {
        Ok(engine) => engine,
        Err(EngineError::Validation(e)) => {
            handler.emit(invalid(&e));
            return Ok(1);
        }
        Err(e) => return Err(e.into()),
    };

    handler.emit(OutputEvent::RunStart {
        workflow: engine.spec().flow.name.clone(),
        nodes: engine.spec().nodes.len(),
    });

    let outcome = engine.run(inputs, cancel).await?;

    for timing in &outcome.timings {
        handler.emit(OutputEvent::NodeTiming {
            node_id: timing.node_id.clone(),
            duration_ms: timing.duration.as_millis() as u64,
        });
    }
    if let Some(error) = &outcome.error {
        handler.emit(OutputEvent::RunError {
            error: error.to_string(),
        });
    }
    handler.emit(OutputEvent::RunComplete {
        run_id: outcome.run_id.clone(),
        success: outcome.is_success(),
        duration_ms: outcome.duration.as_millis() as u64,
        total_tokens: outcome.usage.total(),
        cost_usd: outcome.cost_usd,
        nodes_executed: outcome.timings.len(),
    });
    handler.result(outcome.is_success(), Some(&outcome.state.to_json()));

    Ok(if outcome.is_success() { 0 } else { 1 })
}

/// Show a run and its checkpoints, oldest first
pub fn show_history(store: &SqliteStore, run_id: &str, handler: &dyn OutputHandler) -> Result<i32> {
    let Some(record) = store.get_run(run_id)? else {
        handler.emit(OutputEvent::RunError {
            error: format!("unknown run '{}'", run_id),
        });
        return Ok(1);
    };

    handler.emit(OutputEvent::Run {
        run_id: record.run_id.clone(),
        workflow: record.workflow_name.clone(),
        status: record.status.to_string(),
        started_at: record.started_at.to_rfc3339(),
        duration_ms: record.duration_ms,
    });
    if let Some(error) = &record.error {
        handler.emit(OutputEvent::Info {
            message: format!("error: {}", error),
        });
    }
    for checkpoint in store.checkpoint_history(run_id)? {
        handler.emit(OutputEvent::Checkpoint {
            tokens: checkpoint.total_tokens(),
            node_id: checkpoint.node_id,
            status: checkpoint.status.as_str().to_string(),
            duration_ms: checkpoint.duration_ms,
            created_at: checkpoint.created_at.to_rfc3339(),
        });
    }
    Ok(0)
}

/// List the most recent runs
pub fn list_runs(store: &SqliteStore, limit: usize, handler: &dyn OutputHandler) -> Result<i32> {
    let runs = store.recent_runs(limit)?;
    if runs.is_empty() {
        handler.emit(OutputEvent::Info {
            message: "(no runs recorded)".into(),
        });
    }
    for record in runs {
        handler.emit(OutputEvent::Run {
            status: record.status.to_string(),
            started_at: record.started_at.to_rfc3339(),
            run_id: record.run_id,
            workflow: record.workflow_name,
            duration_ms: record.duration_ms,
        });
    }
    Ok(0)
}

/// Parse `key=value` run inputs. Values of `str` fields are taken verbatim;
/// anything else is read as JSON, falling back to a plain string.
pub fn parse_inputs(args: &[String], spec: &WorkflowSpec) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for arg in args {
        let Some((key, raw)) = arg.split_once('=') else {
            bail!("input '{}' must be written as key=value", arg);
        };
        let is_str = spec
            .state
            .fields
            .get(key)
            .is_some_and(|field| field.type_name == "str");
        let value = if is_str {
            Value::String(raw.to_string())
        } else {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        };
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

fn invalid(error: &ValidationError) -> OutputEvent {
    OutputEvent::WorkflowInvalid {
        stage: error.stage.to_string(),
        message: error.message.clone(),
        location: error.location.clone(),
        suggestion: error.suggestion.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::output::tests::RecordingHandler;
    use serde_json::json;
    use tempfile::TempDir;

    const WORKFLOW: &str = r#"
        [flow]
        name = "totals"

        [state.fields.nums]
        type = "list[int]"
        required = true

        [state.fields.label]
        type = "str"
        default = "sum"

        [state.fields.total]
        type = "int"

        [[nodes]]
        id = "add"
        inputs = { nums = "{nums}" }
        code = "result = sum(inputs[\"nums\"])"
        outputs = ["total"]
        output_schema = { type = "int" }

        [[edges]]
        from = "START"
        to = "add"

        [[edges]]
        from = "add"
        to = "END"
    "#;

    fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_parse_inputs_uses_field_types() {
        let spec: WorkflowSpec = toml::from_str(WORKFLOW).unwrap();
        let args = vec!["nums=[1,2]".to_string(), "label=42".to_string()];
        let inputs = parse_inputs(&args, &spec).unwrap();
        assert_eq!(inputs["nums"], json!([1, 2]));
        assert_eq!(inputs["label"], json!("42"));

        assert!(parse_inputs(&["oops".to_string()], &spec).is_err());
    }

    #[test]
    fn test_validate_reports_result() {
        let dir = TempDir::new().unwrap();
        let good = write(&dir, "good.toml", WORKFLOW);
        let handler = RecordingHandler::default();
        assert_eq!(
            validate_workflow(&good, &EngineConfig::default(), &handler).unwrap(),
            0
        );
        assert!(matches!(
            handler.events()[0],
            OutputEvent::WorkflowValid { nodes: 1, edges: 2, .. }
        ));

        let bad = write(&dir, "bad.toml", &WORKFLOW.replace("to = \"END\"", "to = \"ENDD\""));
        let handler = RecordingHandler::default();
        assert_eq!(
            validate_workflow(&bad, &EngineConfig::default(), &handler).unwrap(),
            1
        );
        assert!(matches!(
            &handler.events()[0],
            OutputEvent::WorkflowInvalid { stage, .. } if stage == "edge_endpoints"
        ));
    }

    #[test]
    fn test_validate_reports_duplicate_field_as_document_error() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "dup.json",
            r#"{
                "flow": {"name": "dup"},
                "state": {"fields": {"topic": {"type": "str"}, "topic": {"type": "int"}}},
                "nodes": [],
                "edges": [{"from": "START", "to": "END"}]
            }"#,
        );
        let handler = RecordingHandler::default();
        assert_eq!(
            validate_workflow(&path, &EngineConfig::default(), &handler).unwrap(),
            1
        );
        assert!(matches!(
            &handler.events()[0],
            OutputEvent::WorkflowInvalid { stage, message, .. }
                if stage == "document" && message.contains("duplicate state field 'topic'")
        ));
    }

    #[tokio::test]
    async fn test_run_then_history() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "totals.toml", WORKFLOW);
        let store = Arc::new(SqliteStore::open(&dir.path().join("runs.db")).unwrap());
        let handler = RecordingHandler::default();

        let code = run_workflow(
            &path,
            &["nums=[4,5,6]".to_string()],
            &EngineConfig::default(),
            store.clone(),
            &handler,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let results = handler.results.lock().unwrap().clone();
        let (success, output) = &results[0];
        assert!(success);
        let state: Value = serde_json::from_str(output.as_deref().unwrap()).unwrap();
        assert_eq!(state["total"], 15);

        let run_id = handler
            .events()
            .into_iter()
            .find_map(|e| match e {
                OutputEvent::RunComplete { run_id, .. } => Some(run_id),
                _ => None,
            })
            .unwrap();
        let history = RecordingHandler::default();
        assert_eq!(show_history(&store, &run_id, &history).unwrap(), 0);
        let checkpoints = history
            .events()
            .into_iter()
            .filter(|e| matches!(e, OutputEvent::Checkpoint { .. }))
            .count();
        assert_eq!(checkpoints, 1);

        let listing = RecordingHandler::default();
        list_runs(&store, 10, &listing).unwrap();
        assert!(matches!(&listing.events()[0], OutputEvent::Run { status, .. } if status == "completed"));
    }

    #[test]
    fn test_history_of_unknown_run() {
        let store = SqliteStore::open_in_memory().unwrap();
        let handler = RecordingHandler::default();
        assert_eq!(show_history(&store, "nope", &handler).unwrap(), 1);
    }
}

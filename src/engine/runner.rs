//! Workflow engine - walks the graph and records the run

use super::{CancellationToken, EngineError};
use crate::config::{
    EdgeTarget, EngineConfig, END, LoopSpec, NodeSpec, ParallelSpec, RouteSpec, START,
    WorkflowSpec,
};
use crate::executor::{NodeExecutionError, NodeExecutor, NodeStage};
use crate::llm::{LlmClient, TokenUsage};
use crate::sandbox::Sandboxes;
use crate::state::{RuntimeState, StateFactory};
use crate::storage::{
    AgentMemory, CheckpointStatus, CheckpointStore, MemoryKey, RunCompletion, RunRegistry,
    RunStatus, SqliteStore,
};
use crate::template::evaluate_condition;
use crate::tools::ToolRegistry;
use crate::validation::validate;
use futures::future::join_all;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Collaborators shared by every run of an engine
#[derive(Clone)]
pub struct EngineDeps {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolRegistry>,
    pub sandboxes: Sandboxes,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub runs: Arc<dyn RunRegistry>,
    pub memory: Arc<dyn AgentMemory>,
}

impl EngineDeps {
    /// Use one SQLite store for checkpoints, the run registry and memory
    pub fn with_store(
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolRegistry>,
        sandboxes: Sandboxes,
        store: Arc<SqliteStore>,
    ) -> Self {
        Self {
            llm,
            tools,
            sandboxes,
            checkpoints: store.clone(),
            runs: store.clone(),
            memory: store,
        }
    }
}

/// Wall time spent in one node execution (or one fan-out)
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTiming {
    pub node_id: String,
    pub duration: Duration,
}

/// Result of one run
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// Last state reached; the final state when the run completed
    pub state: RuntimeState,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub duration: Duration,
    /// Node executions in order
    pub timings: Vec<NodeTiming>,
    /// Why the run failed
    pub error: Option<EngineError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Mutable bookkeeping of one walk
struct Walk {
    state: RuntimeState,
    usage: TokenUsage,
    cost_usd: f64,
    timings: Vec<NodeTiming>,
    iterations: HashMap<String, u32>,
}

impl Walk {
    fn new(state: RuntimeState) -> Self {
        Self {
            state,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            timings: Vec::new(),
            iterations: HashMap::new(),
        }
    }

    fn record(&mut self, node_id: &str, usage: TokenUsage, cost_usd: f64, duration: Duration) {
        self.usage.add(usage);
        self.cost_usd += cost_usd;
        self.timings.push(NodeTiming {
            node_id: node_id.to_string(),
            duration,
        });
    }

    /// Slowest node by total time across its executions
    fn bottleneck(&self) -> Option<String> {
        let mut totals: Vec<(&str, Duration)> = Vec::new();
        for timing in &self.timings {
            match totals.iter_mut().find(|(id, _)| *id == timing.node_id) {
                Some((_, total)) => *total += timing.duration,
                None => totals.push((&timing.node_id, timing.duration)),
            }
        }
        let overall: Duration = totals.iter().map(|(_, d)| *d).sum();
        let (node_id, slowest) = totals.into_iter().max_by_key(|(_, d)| *d)?;
        let share = if overall.is_zero() {
            0.0
        } else {
            slowest.as_secs_f64() / overall.as_secs_f64()
        };
        Some(
            json!({
                "node_id": node_id,
                "duration_ms": slowest.as_millis() as u64,
                "share": share,
            })
            .to_string(),
        )
    }
}

/// A compiled workflow bound to its collaborators
pub struct WorkflowEngine {
    spec: WorkflowSpec,
    factory: StateFactory,
    executor: NodeExecutor,
    runs: Arc<dyn RunRegistry>,
    memory: Arc<dyn AgentMemory>,
}

impl WorkflowEngine {
    /// Validate `spec` and build its state factory. Nothing is registered
    /// or persisted when this fails.
    pub fn compile(
        mut spec: WorkflowSpec,
        config: &EngineConfig,
        deps: EngineDeps,
    ) -> Result<Self, EngineError> {
        config.apply_defaults(&mut spec);
        validate(&spec)?;
        let factory = StateFactory::build(&spec.state.fields)?;

        let effective = config.for_workflow(&spec);
        let executor = NodeExecutor::new(deps.llm, deps.tools, deps.sandboxes, deps.checkpoints)
            .with_llm_config(effective.llm)
            .with_max_retries(effective.defaults.max_retries())
            .with_trace_prompts(spec.config.observability.trace_prompts);

        tracing::debug!(
            workflow = %spec.flow.name,
            nodes = spec.nodes.len(),
            mode = ?spec.execution_mode(),
            "Compiled workflow"
        );

        Ok(Self {
            spec,
            factory,
            executor,
            runs: deps.runs,
            memory: deps.memory,
        })
    }

    pub fn spec(&self) -> &WorkflowSpec {
        &self.spec
    }

    /// Execute the workflow once. Invalid inputs fail before the run is
    /// registered; anything after that is reported in the outcome.
    pub async fn run(
        &self,
        inputs: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let initial = self.factory.create(inputs)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let workflow = self.spec.flow.name.as_str();

        self.runs.register_run(&run_id, workflow)?;
        self.runs.mark_running(&run_id)?;
        tracing::info!(run_id = %run_id, workflow, "Run started");

        let started = Instant::now();
        let mut walk = Walk::new(initial);
        let result = self.walk(&run_id, &mut walk, cancel).await;
        let duration = started.elapsed();

        let status = match result {
            Ok(()) => RunStatus::Completed,
            Err(_) => RunStatus::Failed,
        };
        let completion = RunCompletion {
            status,
            duration_ms: duration.as_millis() as u64,
            total_tokens: walk.usage.total(),
            total_cost_usd: walk.cost_usd,
            outputs: Some(walk.state.to_json()),
            error: result.as_ref().err().map(|e| e.to_string()),
            bottleneck: walk.bottleneck(),
        };
        if let Err(e) = self.runs.complete_run(&run_id, &completion) {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to record run completion");
        }

        match &result {
            Ok(()) => tracing::info!(
                run_id = %run_id,
                duration_ms = completion.duration_ms,
                tokens = completion.total_tokens,
                cost_usd = completion.total_cost_usd,
                "Run completed"
            ),
            Err(e) => tracing::error!(run_id = %run_id, error = %e, "Run failed"),
        }

        Ok(RunOutcome {
            run_id,
            status,
            state: walk.state,
            usage: walk.usage,
            cost_usd: walk.cost_usd,
            duration,
            timings: walk.timings,
            error: result.err(),
        })
    }

    async fn walk(
        &self,
        run_id: &str,
        walk: &mut Walk,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut current = START.to_string();
        loop {
            let edge = self
                .spec
                .edge_from(&current)
                .ok_or_else(|| EngineError::NoEdge {
                    node: current.clone(),
                })?;

            let next = match &edge.target {
                EdgeTarget::To(target) => target.clone(),
                EdgeTarget::Routes(routes) => route(&current, routes, &walk.state)?,
                EdgeTarget::Loop(spec) => next_iteration(&current, spec, walk)?,
                EdgeTarget::Parallel(spec) => {
                    check_cancelled(cancel, &spec.target_node)?;
                    self.fan_out(run_id, spec, walk).await?;
                    // Continue from the target's own edge
                    current = spec.target_node.clone();
                    continue;
                }
            };

            if next == END {
                return Ok(());
            }
            check_cancelled(cancel, &next)?;
            self.run_node(run_id, &next, walk).await?;
            current = next;
        }
    }

    async fn run_node(&self, run_id: &str, id: &str, walk: &mut Walk) -> Result<(), EngineError> {
        let node = self.node(id)?;
        let outcome = self
            .executor
            .run(run_id, node, &walk.state, &Map::new())
            .await?;
        walk.record(id, outcome.usage, outcome.cost_usd, outcome.duration);
        self.remember(node, &outcome.patch);
        walk.state = outcome.state;
        Ok(())
    }

    /// Run the target once per item against the same snapshot, then write
    /// the results to the collect field in item order
    async fn fan_out(
        &self,
        run_id: &str,
        spec: &ParallelSpec,
        walk: &mut Walk,
    ) -> Result<(), EngineError> {
        let node = self.node(&spec.target_node)?;
        let items = match walk.state.get(&spec.items_field) {
            Some(Value::Array(items)) => items.clone(),
            None | Some(Value::Null) => Vec::new(),
            Some(_) => {
                return Err(EngineError::NotAList {
                    field: spec.items_field.clone(),
                });
            }
        };

        tracing::info!(
            node = %node.id,
            branches = items.len(),
            "Fanning out"
        );
        let started = Instant::now();
        let snapshot = &walk.state;
        let branches = items.into_iter().enumerate().map(|(index, item)| {
            let mut locals = Map::new();
            locals.insert("item".to_string(), item);
            locals.insert("index".to_string(), json!(index));
            async move { self.executor.execute(node, snapshot, &locals).await }
        });
        let results = join_all(branches).await;

        let mut usage = TokenUsage::default();
        let mut cost_usd = 0.0;
        let mut collected = Vec::with_capacity(results.len());
        for result in results {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(error) => {
                    self.checkpoint_failure(run_id, &node.id, &walk.state, started.elapsed());
                    return Err(error.into());
                }
            };
            usage.add(outcome.usage);
            cost_usd += outcome.cost_usd;
            collected.push(branch_value(node, outcome.patch));
        }

        let mut patch = Map::new();
        patch.insert(spec.collect_field.clone(), Value::Array(collected));
        let next = walk.state.with_fields(patch.clone()).map_err(|e| {
            NodeExecutionError::new(node.id.clone(), NodeStage::ValidatingOutput, e)
        })?;

        let duration = started.elapsed();
        if let Err(e) = self.executor.checkpoint(
            run_id,
            &node.id,
            &next,
            CheckpointStatus::Completed,
            usage,
            cost_usd,
            duration,
        ) {
            tracing::warn!(run_id = %run_id, node = %node.id, error = %e, "Failed to write checkpoint");
        }

        walk.record(&node.id, usage, cost_usd, duration);
        self.remember(node, &patch);
        walk.state = next;
        Ok(())
    }

    fn checkpoint_failure(&self, run_id: &str, node_id: &str, state: &RuntimeState, elapsed: Duration) {
        if let Err(e) = self.executor.checkpoint(
            run_id,
            node_id,
            state,
            CheckpointStatus::Failed,
            TokenUsage::default(),
            0.0,
            elapsed,
        ) {
            tracing::warn!(run_id = %run_id, node = %node_id, error = %e, "Failed to write failure checkpoint");
        }
    }

    /// Write a node's outputs to agent memory when the workflow asks for it
    fn remember(&self, node: &NodeSpec, patch: &Map<String, Value>) {
        if !self.spec.config.execution.persist_memory {
            return;
        }
        let agent_id = self.spec.agent_id();
        for (field, value) in patch {
            let key = MemoryKey::new(agent_id, &self.spec.flow.name, &node.id, field);
            if let Err(e) = self.memory.remember(&key, value) {
                tracing::warn!(node = %node.id, field = %field, error = %e, "Failed to write agent memory");
            }
        }
    }

    fn node(&self, id: &str) -> Result<&NodeSpec, EngineError> {
        self.spec
            .node(id)
            .ok_or_else(|| EngineError::UnknownNode(id.to_string()))
    }
}

fn check_cancelled(cancel: &CancellationToken, next: &str) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        tracing::warn!(next, "Run cancelled");
        return Err(EngineError::Cancelled {
            next: next.to_string(),
        });
    }
    Ok(())
}

/// First route whose condition holds; an empty condition always holds
fn route(from: &str, routes: &[RouteSpec], state: &RuntimeState) -> Result<String, EngineError> {
    for route in routes {
        let matched = evaluate_condition(&route.condition, state).map_err(|source| {
            EngineError::Condition {
                node: from.to_string(),
                source,
            }
        })?;
        if matched {
            tracing::debug!(from, to = %route.to, condition = %route.condition, "Route taken");
            return Ok(route.to.clone());
        }
    }
    Err(EngineError::NoRoute {
        node: from.to_string(),
    })
}

fn next_iteration(from: &str, spec: &LoopSpec, walk: &mut Walk) -> Result<String, EngineError> {
    let again = matches!(walk.state.get(&spec.condition_field), Some(Value::Bool(true)));
    if !again {
        return Ok(spec.exit_to.clone());
    }

    let count = walk.iterations.entry(from.to_string()).or_insert(0);
    *count += 1;
    if *count > spec.max_iterations {
        return Err(EngineError::LoopLimit {
            node: from.to_string(),
            max_iterations: spec.max_iterations,
        });
    }
    tracing::debug!(from, iteration = *count, "Loop iteration");
    Ok(spec.reenter.clone().unwrap_or_else(|| from.to_string()))
}

/// Single-output nodes contribute the bare value, others the whole patch
fn branch_value(node: &NodeSpec, mut patch: Map<String, Value>) -> Value {
    match node.outputs.as_slice() {
        [name] => patch.remove(name).unwrap_or(Value::Null),
        _ => Value::Object(patch),
    }
}

//! Single-node execution: inputs, prompt, model or sandbox, validation,
//! checkpoint

use super::error::{NodeExecutionError, NodeFailure, NodeStage};
use crate::config::{LlmConfig, NodeSpec};
use crate::llm::{
    ChatMessage, LlmClient, LlmError, LlmRequest, OutputContract, RetryPolicy, TokenUsage,
    ToolCall, with_retry,
};
use crate::sandbox::Sandboxes;
use crate::state::RuntimeState;
use crate::storage::{CheckpointStatus, CheckpointStore, ExecutionCheckpoint, StoreError};
use crate::template::{resolve, resolve_string};
use crate::tools::{Tool, ToolRegistry, validate_arguments};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Model turns allowed to request tools before a final answer is required
pub const MAX_TOOL_ROUNDS: usize = 5;

/// What a successful node execution produced
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub node_id: String,
    /// Declared outputs written by the node
    pub patch: Map<String, Value>,
    /// State with `patch` applied
    pub state: RuntimeState,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub duration: Duration,
    /// Model attempts; zero for code nodes
    pub attempts: u32,
}

/// Runs nodes against a state snapshot
pub struct NodeExecutor {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolRegistry>,
    sandboxes: Sandboxes,
    checkpoints: Arc<dyn CheckpointStore>,
    /// Engine and workflow LLM settings; node settings are layered on top
    llm_config: LlmConfig,
    max_retries: u32,
    trace_prompts: bool,
}

impl NodeExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolRegistry>,
        sandboxes: Sandboxes,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            llm,
            tools,
            sandboxes,
            checkpoints,
            llm_config: LlmConfig::default(),
            max_retries: crate::config::Defaults::default().max_retries(),
            trace_prompts: false,
        }
    }

    pub fn with_llm_config(mut self, config: LlmConfig) -> Self {
        self.llm_config = config;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_trace_prompts(mut self, trace_prompts: bool) -> Self {
        self.trace_prompts = trace_prompts;
        self
    }

    /// Execute `node` and checkpoint the result. On failure a `failed`
    /// checkpoint of the input state is written best-effort before the
    /// error is returned.
    pub async fn run(
        &self,
        run_id: &str,
        node: &NodeSpec,
        state: &RuntimeState,
        locals: &Map<String, Value>,
    ) -> Result<NodeOutcome, NodeExecutionError> {
        let started = Instant::now();
        match self.execute(node, state, locals).await {
            Ok(outcome) => {
                if let Err(e) = self.checkpoint(
                    run_id,
                    &node.id,
                    &outcome.state,
                    CheckpointStatus::Completed,
                    outcome.usage,
                    outcome.cost_usd,
                    outcome.duration,
                ) {
                    tracing::warn!(
                        run_id = %run_id,
                        node = %node.id,
                        stage = %NodeStage::Persisting,
                        error = %e,
                        "Failed to write checkpoint"
                    );
                }
                Ok(outcome)
            }
            Err(error) => {
                if let Err(e) = self.checkpoint(
                    run_id,
                    &node.id,
                    state,
                    CheckpointStatus::Failed,
                    TokenUsage::default(),
                    0.0,
                    started.elapsed(),
                ) {
                    tracing::warn!(
                        run_id = %run_id,
                        node = %node.id,
                        error = %e,
                        "Failed to write failure checkpoint"
                    );
                }
                Err(error)
            }
        }
    }

    /// Execute `node` without persisting anything
    pub async fn execute(
        &self,
        node: &NodeSpec,
        state: &RuntimeState,
        locals: &Map<String, Value>,
    ) -> Result<NodeOutcome, NodeExecutionError> {
        let started = Instant::now();
        let fail = |stage: NodeStage, failure: NodeFailure| NodeExecutionError {
            node_id: node.id.clone(),
            stage,
            failure,
        };

        let kind = if node.is_code_node() { "code" } else { "llm" };
        tracing::info!(node = %node.id, kind, "Node started");

        let inputs = resolve_inputs(node, state, locals)
            .map_err(|f| fail(NodeStage::ResolvingInputs, f))?;
        let contract = OutputContract::for_node(node)
            .map_err(|e| fail(NodeStage::ValidatingOutput, e.into()))?;

        let merged = self
            .llm_config
            .merged_with(node.llm.as_ref().unwrap_or(&LlmConfig::default()));

        let (patch, usage, attempts) = match &node.code {
            Some(code) => {
                let patch = self
                    .run_sandbox(node, code, &inputs, &contract)
                    .await
                    .map_err(|(stage, f)| fail(stage, f))?;
                (patch, TokenUsage::default(), 0)
            }
            None => {
                let template = node.prompt.as_deref().unwrap_or_default();
                let prompt = resolve_string(template, &inputs, state)
                    .map_err(|e| fail(NodeStage::ResolvingPrompt, e.into()))?;
                let system = node
                    .system_prompt
                    .as_deref()
                    .map(|t| resolve_string(t, &inputs, state))
                    .transpose()
                    .map_err(|e| fail(NodeStage::ResolvingPrompt, e.into()))?;
                if self.trace_prompts {
                    tracing::debug!(node = %node.id, prompt = %prompt, "Resolved prompt");
                }

                self.invoke(node, &merged, system, prompt, &contract)
                    .await
                    .map_err(|f| fail(NodeStage::Invoking, f))?
            }
        };

        for name in &node.outputs {
            if !patch.contains_key(name) {
                return Err(fail(
                    NodeStage::ValidatingOutput,
                    NodeFailure::MissingOutput(name.clone()),
                ));
            }
        }
        let next = state
            .with_fields(patch.clone())
            .map_err(|e| fail(NodeStage::ValidatingOutput, e.into()))?;

        let cost_usd = merged.estimate_cost(usage.prompt_tokens, usage.completion_tokens);
        let duration = started.elapsed();
        tracing::info!(
            node = %node.id,
            duration_ms = duration.as_millis() as u64,
            tokens = usage.total(),
            attempts,
            "Node finished"
        );

        Ok(NodeOutcome {
            node_id: node.id.clone(),
            patch,
            state: next,
            usage,
            cost_usd,
            duration,
            attempts,
        })
    }

    /// Append a checkpoint for `state`
    #[allow(clippy::too_many_arguments)]
    pub fn checkpoint(
        &self,
        run_id: &str,
        node_id: &str,
        state: &RuntimeState,
        status: CheckpointStatus,
        usage: TokenUsage,
        cost_usd: f64,
        duration: Duration,
    ) -> Result<i64, StoreError> {
        let mut checkpoint = ExecutionCheckpoint::new(run_id, node_id, state.to_json(), status);
        checkpoint.prompt_tokens = usage.prompt_tokens;
        checkpoint.completion_tokens = usage.completion_tokens;
        checkpoint.cost_usd = cost_usd;
        checkpoint.duration_ms = duration.as_millis() as u64;
        self.checkpoints.save_checkpoint(&checkpoint)
    }

    async fn run_sandbox(
        &self,
        node: &NodeSpec,
        code: &str,
        inputs: &Map<String, Value>,
        contract: &OutputContract,
    ) -> Result<Map<String, Value>, (NodeStage, NodeFailure)> {
        let spec = node.sandbox.as_ref();
        let mode = self.sandboxes.mode_for(spec);
        let backend = self.sandboxes.backend(mode).ok_or_else(|| {
            (
                NodeStage::RunningSandbox,
                NodeFailure::SandboxUnavailable(format!("{:?}", mode).to_lowercase()),
            )
        })?;
        let limits = self.sandboxes.limits_for(spec);

        let result = backend
            .execute(code, inputs, limits.timeout(), Some(&limits))
            .await;
        tracing::debug!(
            node = %node.id,
            backend = backend.name(),
            success = result.success,
            seconds = result.execution_time_seconds,
            "Sandbox finished"
        );
        if !result.success {
            return Err((
                NodeStage::RunningSandbox,
                NodeFailure::Sandbox {
                    backend: backend.name().to_string(),
                    message: result.error.unwrap_or_else(|| "unknown error".to_string()),
                },
            ));
        }

        contract
            .from_value(result.output)
            .map_err(|e| (NodeStage::ValidatingOutput, e.into()))
    }

    async fn invoke(
        &self,
        node: &NodeSpec,
        config: &LlmConfig,
        system: Option<String>,
        prompt: String,
        contract: &OutputContract,
    ) -> Result<(Map<String, Value>, TokenUsage, u32), NodeFailure> {
        let tools = node
            .tools
            .iter()
            .map(|name| self.tools.get(name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(format!(
            "{}\n\n{}",
            prompt,
            contract.format_instructions()
        )));
        let request = LlmRequest::new(config.model(), messages)
            .with_config(config)
            .with_response_schema(contract.json_schema())
            .with_tools(tools.iter().map(|t| t.definition()).collect());

        let retries = node
            .llm
            .as_ref()
            .and_then(|l| l.max_retries)
            .unwrap_or(self.max_retries);
        let policy = RetryPolicy::from_config(config).with_max_retries(retries);

        let tools = tools.as_slice();
        let ((patch, usage), attempts) = with_retry(&policy, |attempt| {
            let request = request.clone();
            async move {
                if attempt > 0 {
                    tracing::debug!(node = %node.id, attempt = attempt + 1, "Retrying model call");
                }
                self.converse(request, tools, contract).await
            }
        })
        .await?;

        Ok((patch, usage, attempts))
    }

    /// One attempt: call the model, serve tool calls, extract the outputs
    async fn converse(
        &self,
        mut request: LlmRequest,
        tools: &[Arc<dyn Tool>],
        contract: &OutputContract,
    ) -> Result<(Map<String, Value>, TokenUsage), LlmError> {
        let mut usage = TokenUsage::default();
        for _ in 0..=MAX_TOOL_ROUNDS {
            let response = self.llm.complete(&request).await?;
            usage.add(response.usage);

            if response.tool_calls.is_empty() {
                let patch = contract.extract(&response.text)?;
                return Ok((patch, usage));
            }

            request.messages.push(ChatMessage::assistant(
                response.text.clone(),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let content = call_tool(tools, call).await;
                request
                    .messages
                    .push(ChatMessage::tool_result(call.id.clone(), content));
            }
        }
        Err(LlmError::contract(format!(
            "model still requesting tools after {} rounds",
            MAX_TOOL_ROUNDS
        )))
    }
}

/// Result text sent back to the model; failures are reported, not raised
async fn call_tool(tools: &[Arc<dyn Tool>], call: &ToolCall) -> String {
    let Some(tool) = tools.iter().find(|t| t.name() == call.name) else {
        return format!("error: tool '{}' is not available to this node", call.name);
    };
    if let Err(e) = validate_arguments(tool.as_ref(), &call.arguments) {
        return format!("error: {}", e);
    }
    match tool.invoke(call.arguments.clone()).await {
        Ok(Value::String(s)) => s,
        Ok(value) => value.to_string(),
        Err(e) => {
            tracing::debug!(tool = %call.name, error = %e, "Tool call failed");
            format!("error: {}", e)
        }
    }
}

/// Resolve every declared input against state plus `locals`
fn resolve_inputs(
    node: &NodeSpec,
    state: &RuntimeState,
    locals: &Map<String, Value>,
) -> Result<Map<String, Value>, NodeFailure> {
    let mut inputs = locals.clone();
    for (local, template) in &node.inputs {
        let value = resolve(template, locals, state).map_err(|source| NodeFailure::Input {
            local: local.clone(),
            template: template.clone(),
            source,
        })?;
        inputs.insert(local.clone(), value);
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldSpec, SandboxDefaults};
    use crate::llm::mock::{ScriptedLlm, usage};
    use crate::llm::{LlmResponse, ToolDefinition};
    use crate::state::StateFactory;
    use crate::storage::{RunRegistry, SqliteStore};
    use crate::tools::{StaticToolRegistry, ToolError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn state() -> RuntimeState {
        let schema: BTreeMap<String, FieldSpec> = serde_json::from_value(json!({
            "topic": {"type": "str", "required": true},
            "nums": {"type": "list[int]", "default": [1, 2, 3]},
            "a": {"type": "int"},
            "b": {"type": "str"},
            "total": {"type": "int"},
            "summary": {"type": "str"}
        }))
        .unwrap();
        let factory = StateFactory::build(&schema).unwrap();
        let values = json!({"topic": "rust"}).as_object().cloned().unwrap();
        factory.create(values).unwrap()
    }

    fn node(json: Value) -> NodeSpec {
        serde_json::from_value(json).unwrap()
    }

    fn fast_config() -> LlmConfig {
        LlmConfig {
            retry_delay_ms: Some(1),
            cost_per_1k_prompt: Some(1.0),
            cost_per_1k_completion: Some(2.0),
            ..Default::default()
        }
    }

    fn executor(llm: Arc<ScriptedLlm>, store: Arc<SqliteStore>) -> NodeExecutor {
        NodeExecutor::new(
            llm,
            Arc::new(StaticToolRegistry::new()),
            Sandboxes::restricted_only(&SandboxDefaults::default()),
            store,
        )
        .with_llm_config(fast_config())
    }

    #[tokio::test]
    async fn test_llm_node_writes_declared_output() {
        let llm = Arc::new(ScriptedLlm::new("A short summary."));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.register_run("run-1", "test").unwrap();
        let summarize = node(json!({
            "id": "summarize",
            "prompt": "Summarize {topic}",
            "outputs": ["summary"],
            "output_schema": {"type": "str"}
        }));

        let outcome = executor(llm.clone(), store.clone())
            .run("run-1", &summarize, &state(), &Map::new())
            .await
            .unwrap();

        assert_eq!(outcome.state.get("summary"), Some(&json!("A short summary.")));
        assert_eq!(outcome.attempts, 1);
        assert!((outcome.cost_usd - 0.02).abs() < 1e-9);
        let sent = &llm.requests()[0];
        assert!(sent.messages[0].content.starts_with("Summarize rust"));
        assert!(sent.response_schema.is_some());
        assert_eq!(store.checkpoint_history("run-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_contract_mismatch_is_retried_then_fails() {
        let llm = Arc::new(ScriptedLlm::new(r#"{"a": 1}"#));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.register_run("run-1", "test").unwrap();
        let pair = node(json!({
            "id": "pair",
            "prompt": "Give a and b",
            "outputs": ["a", "b"],
            "output_schema": {
                "type": "object",
                "fields": {"a": {"type": "int"}, "b": {"type": "str"}}
            }
        }));

        let err = executor(llm.clone(), store.clone())
            .with_max_retries(2)
            .run("run-1", &pair, &state(), &Map::new())
            .await
            .unwrap_err();

        assert_eq!(err.stage, NodeStage::Invoking);
        assert!(err.to_string().contains("'b'"));
        assert_eq!(llm.requests().len(), 3);
        let history = store.checkpoint_history("run-1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, CheckpointStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_error() {
        let llm = Arc::new(
            ScriptedLlm::new("fine")
                .then(Err(LlmError::network("connection reset")))
                .then_text("not json but prose"),
        );
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let summarize = node(json!({
            "id": "summarize",
            "prompt": "Summarize {topic}",
            "outputs": ["summary"],
            "output_schema": {"type": "str"}
        }));

        let outcome = executor(llm, store)
            .execute(&summarize, &state(), &Map::new())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.patch.get("summary"), Some(&json!("not json but prose")));
    }

    #[tokio::test]
    async fn test_auth_error_is_not_retried() {
        let llm = Arc::new(ScriptedLlm::new("unused").then(Err(LlmError::auth("bad key"))));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let summarize = node(json!({
            "id": "summarize",
            "prompt": "Summarize {topic}",
            "outputs": ["summary"],
            "output_schema": {"type": "str"}
        }));

        let err = executor(llm.clone(), store)
            .execute(&summarize, &state(), &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err.failure, NodeFailure::Llm(LlmError::Auth { .. })));
        assert_eq!(llm.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_input_names_local_and_template() {
        let llm = Arc::new(ScriptedLlm::new("x"));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bad = node(json!({
            "id": "bad",
            "inputs": {"subject": "{topc}"},
            "prompt": "About {subject}",
            "outputs": ["summary"],
            "output_schema": {"type": "str"}
        }));

        let err = executor(llm.clone(), store)
            .execute(&bad, &state(), &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, NodeStage::ResolvingInputs);
        let message = err.to_string();
        assert!(message.contains("subject"));
        assert!(message.contains("{topc}"));
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_write_failure_does_not_fail_node() {
        let llm = Arc::new(ScriptedLlm::new("A short summary."));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let summarize = node(json!({
            "id": "summarize",
            "prompt": "Summarize {topic}",
            "outputs": ["summary"],
            "output_schema": {"type": "str"}
        }));

        // The run was never registered, so the checkpoint insert is refused
        let outcome = executor(llm, store.clone())
            .run("unregistered", &summarize, &state(), &Map::new())
            .await
            .unwrap();

        assert_eq!(outcome.state.get("summary"), Some(&json!("A short summary.")));
        assert!(store.checkpoint_history("unregistered").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_checkpoint_write_keeps_original_error() {
        let llm = Arc::new(ScriptedLlm::new("x"));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bad = node(json!({
            "id": "bad",
            "inputs": {"subject": "{topc}"},
            "prompt": "About {subject}",
            "outputs": ["summary"],
            "output_schema": {"type": "str"}
        }));

        let err = executor(llm, store.clone())
            .run("unregistered", &bad, &state(), &Map::new())
            .await
            .unwrap_err();

        assert_eq!(err.node_id, "bad");
        assert_eq!(err.stage, NodeStage::ResolvingInputs);
        assert!(matches!(err.failure, NodeFailure::Input { ref local, .. } if local == "subject"));
        assert!(store.checkpoint_history("unregistered").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_code_node_uses_sandbox() {
        let llm = Arc::new(ScriptedLlm::new("unused"));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let total = node(json!({
            "id": "total",
            "inputs": {"nums": "{nums}"},
            "code": "result = sum(inputs[\"nums\"])",
            "outputs": ["total"],
            "output_schema": {"type": "int"}
        }));

        let outcome = executor(llm.clone(), store)
            .execute(&total, &state(), &Map::new())
            .await
            .unwrap();
        assert_eq!(outcome.state.get("total"), Some(&json!(6)));
        assert_eq!(outcome.attempts, 0);
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_failed_sandbox_is_not_retried() {
        let llm = Arc::new(ScriptedLlm::new("unused"));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let broken = node(json!({
            "id": "broken",
            "code": "result = 1 / 0",
            "outputs": ["total"],
            "output_schema": {"type": "int"}
        }));

        let err = executor(llm, store)
            .execute(&broken, &state(), &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, NodeStage::RunningSandbox);
        assert!(err.to_string().contains("ZeroDivisionError"));
    }

    struct Word;

    #[async_trait]
    impl Tool for Word {
        fn name(&self) -> &str {
            "word_count"
        }

        fn description(&self) -> &str {
            "Count words"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }

        async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
            let text = arguments["text"].as_str().unwrap_or_default();
            Ok(json!(text.split_whitespace().count()))
        }
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let call = ToolCall {
            id: "call-1".into(),
            name: "word_count".into(),
            arguments: json!({"text": "one two three"}),
        };
        let llm = Arc::new(
            ScriptedLlm::new("unused")
                .then(Ok(LlmResponse::text("")
                    .with_tool_calls(vec![call])
                    .with_usage(usage(5, 1))))
                .then_text(r#"{"total": 3}"#),
        );
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let tools = StaticToolRegistry::new().with_tool(Arc::new(Word));
        let counting = node(json!({
            "id": "count",
            "prompt": "Count the words in {topic}",
            "tools": ["word_count"],
            "outputs": ["total"],
            "output_schema": {"type": "int"}
        }));

        let executor = NodeExecutor::new(
            llm.clone(),
            Arc::new(tools),
            Sandboxes::restricted_only(&SandboxDefaults::default()),
            store,
        );
        let outcome = executor
            .execute(&counting, &state(), &Map::new())
            .await
            .unwrap();

        assert_eq!(outcome.patch.get("total"), Some(&json!(3)));
        assert_eq!(outcome.usage.total(), 21);
        let requests = llm.requests();
        let expected: Vec<ToolDefinition> = vec![Word.definition()];
        assert_eq!(requests[0].tools, expected);
        let last = requests[1].messages.last().unwrap();
        assert_eq!(last.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(last.content, "3");
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_node() {
        let llm = Arc::new(ScriptedLlm::new("unused"));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let counting = node(json!({
            "id": "count",
            "prompt": "Count",
            "tools": ["word_cont"],
            "outputs": ["total"],
            "output_schema": {"type": "int"}
        }));

        let err = executor(llm, store)
            .execute(&counting, &state(), &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err.failure, NodeFailure::Tool(ToolError::NotFound { .. })));
    }
}

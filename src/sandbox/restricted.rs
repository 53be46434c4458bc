//! Sandbox backend running scripts on the in-process interpreter

use super::interpreter::{self, Limits};
use super::{ResourceLimits, SandboxExecutor, SandboxResult, check_code};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct RestrictedExecutor {
    max_code_bytes: usize,
    limits: Limits,
}

impl RestrictedExecutor {
    pub fn new(max_code_bytes: usize) -> Self {
        Self {
            max_code_bytes,
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

#[async_trait]
impl SandboxExecutor for RestrictedExecutor {
    async fn execute(
        &self,
        code: &str,
        inputs: &Map<String, Value>,
        timeout: Duration,
        _resources: Option<&ResourceLimits>,
    ) -> SandboxResult {
        let started = Instant::now();

        if let Err(e) = check_code(code, self.max_code_bytes) {
            return SandboxResult::failure(e.to_string(), started.elapsed());
        }
        let program = match interpreter::compile(code) {
            Ok(program) => program,
            Err(e) => return SandboxResult::failure(e.to_string(), started.elapsed()),
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let inputs = inputs.clone();
        let limits = self.limits;
        let handle = tokio::task::spawn_blocking(move || {
            interpreter::run(&program, &inputs, &flag, limits)
        });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(output))) => {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Script finished");
                SandboxResult::success(output.result, started.elapsed()).with_stdout(output.stdout)
            }
            Ok(Ok(Err(failure))) => {
                SandboxResult::failure(failure.error.to_string(), started.elapsed())
                    .with_stdout(failure.stdout)
            }
            Ok(Err(e)) => SandboxResult::failure(
                format!("interpreter worker failed: {}", e),
                started.elapsed(),
            ),
            Err(_) => {
                // The worker stops at its next statement boundary
                cancel.store(true, Ordering::Relaxed);
                warn!(timeout_secs = timeout.as_secs_f64(), "Script timed out");
                SandboxResult::failure(
                    format!("execution timed out after {:.1}s", timeout.as_secs_f64()),
                    started.elapsed(),
                )
            }
        }
    }

    fn name(&self) -> &str {
        "restricted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_sum_inputs() {
        let executor = RestrictedExecutor::new(10_000);
        let result = executor
            .execute(
                "result = sum(inputs[\"nums\"])",
                &inputs(json!({"nums": [1, 2, 3]})),
                Duration::from_secs(5),
                None,
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output, json!(6));
        assert!(result.execution_time_seconds >= 0.0);
    }

    #[tokio::test]
    async fn test_runtime_error_goes_to_stderr() {
        let executor = RestrictedExecutor::new(10_000);
        let result = executor
            .execute("print('hi')\nresult = 1 / 0", &Map::new(), Duration::from_secs(5), None)
            .await;
        assert!(!result.success);
        assert_eq!(result.stdout, "hi\n");
        assert!(result.stderr.contains("ZeroDivisionError"));
        assert_eq!(result.error.as_deref(), Some(result.stderr.as_str()));
    }

    #[tokio::test]
    async fn test_safety_check_runs_first() {
        let executor = RestrictedExecutor::new(10);
        let result = executor
            .execute("result = 12345678901", &Map::new(), Duration::from_secs(5), None)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("limit"));
    }

    #[tokio::test]
    async fn test_timeout_cancels_worker() {
        let executor = RestrictedExecutor::new(10_000).with_limits(Limits {
            max_steps: u64::MAX,
            ..Limits::default()
        });
        let result = executor
            .execute(
                "while True:\n    pass",
                &Map::new(),
                Duration::from_millis(100),
                None,
            )
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }
}

//! Sandboxed execution of code nodes
//!
//! Two interchangeable backends share one surface: the in-process restricted
//! interpreter and a hardened Docker container. Neither raises past the
//! boundary; every outcome is a [`SandboxResult`].

mod container;
pub mod interpreter;
mod resources;
mod restricted;
mod safety;

pub use container::ContainerExecutor;
pub use resources::{ResourceLimits, ResourcePreset};
pub use restricted::RestrictedExecutor;
pub use safety::{SafetyError, check_code};

use crate::config::{SandboxDefaults, SandboxMode, SandboxSpec};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Outcome of one sandboxed execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxResult {
    pub success: bool,
    /// The script's `result` binding, null when unset
    pub output: Value,
    pub error: Option<String>,
    /// Wall time including the safety check and setup
    pub execution_time_seconds: f64,
    pub stdout: String,
    pub stderr: String,
}

impl SandboxResult {
    pub fn success(output: Value, elapsed: Duration) -> Self {
        Self {
            success: true,
            output,
            error: None,
            execution_time_seconds: elapsed.as_secs_f64(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Errors are also written to captured stderr
    pub fn failure(error: impl Into<String>, elapsed: Duration) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: Value::Null,
            stderr: error.clone(),
            error: Some(error),
            execution_time_seconds: elapsed.as_secs_f64(),
            stdout: String::new(),
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

/// Common surface of every sandbox backend
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        inputs: &Map<String, Value>,
        timeout: Duration,
        resources: Option<&ResourceLimits>,
    ) -> SandboxResult;

    fn name(&self) -> &str;
}

/// Backends available to the node executor, picked per node by mode
#[derive(Clone)]
pub struct Sandboxes {
    restricted: Arc<dyn SandboxExecutor>,
    container: Option<Arc<dyn SandboxExecutor>>,
    defaults: SandboxDefaults,
}

impl Sandboxes {
    /// Restricted backend always; the container backend when a Docker
    /// client can be created
    pub fn from_defaults(defaults: &SandboxDefaults) -> Self {
        let container = match ContainerExecutor::connect(defaults.image(), defaults.max_code_bytes()) {
            Ok(executor) => Some(Arc::new(executor) as Arc<dyn SandboxExecutor>),
            Err(e) => {
                warn!(error = %e, "Docker unavailable; container sandbox disabled");
                None
            }
        };
        Self {
            restricted: Arc::new(RestrictedExecutor::new(defaults.max_code_bytes())),
            container,
            defaults: defaults.clone(),
        }
    }

    /// Restricted backend only
    pub fn restricted_only(defaults: &SandboxDefaults) -> Self {
        Self {
            restricted: Arc::new(RestrictedExecutor::new(defaults.max_code_bytes())),
            container: None,
            defaults: defaults.clone(),
        }
    }

    pub fn with_container(mut self, executor: Arc<dyn SandboxExecutor>) -> Self {
        self.container = Some(executor);
        self
    }

    pub fn mode_for(&self, spec: Option<&SandboxSpec>) -> SandboxMode {
        spec.and_then(|s| s.mode).unwrap_or(self.defaults.mode())
    }

    pub fn backend(&self, mode: SandboxMode) -> Option<Arc<dyn SandboxExecutor>> {
        match mode {
            SandboxMode::Restricted => Some(Arc::clone(&self.restricted)),
            SandboxMode::Container => self.container.clone(),
        }
    }

    /// Preset from the node or the defaults, then per-node overrides
    pub fn limits_for(&self, spec: Option<&SandboxSpec>) -> ResourceLimits {
        let preset = spec.and_then(|s| s.preset).unwrap_or(self.defaults.preset());
        let limits = preset
            .limits()
            .with_timeout_secs(self.defaults.timeout_secs);
        match spec {
            Some(spec) => limits
                .with_cpus(spec.cpus)
                .with_memory_mb(spec.memory_mb)
                .with_timeout_secs(spec.timeout_secs)
                .with_network(spec.network),
            None => limits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nums() -> Map<String, Value> {
        json!({"nums": [1, 2, 3]}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_restricted_backend_sums_inputs() {
        let sandboxes = Sandboxes::restricted_only(&SandboxDefaults::default());
        let backend = sandboxes.backend(SandboxMode::Restricted).unwrap();
        let result = backend
            .execute(
                "result = sum(inputs[\"nums\"])",
                &nums(),
                Duration::from_secs(5),
                None,
            )
            .await;
        assert!(result.success);
        assert_eq!(result.output, json!(6));
    }

    #[tokio::test]
    async fn test_dangerous_code_is_rejected() {
        let sandboxes = Sandboxes::restricted_only(&SandboxDefaults::default());
        let backend = sandboxes.backend(SandboxMode::Restricted).unwrap();
        for code in [
            "import os\nresult = 1",
            "result = eval('1 + 1')",
            "result = open('/etc/passwd').read()",
        ] {
            let result = backend
                .execute(code, &nums(), Duration::from_secs(5), None)
                .await;
            assert!(!result.success, "{} should fail", code);
            assert!(result.error.is_some());
        }
    }

    #[test]
    fn test_limits_resolution() {
        let sandboxes = Sandboxes::restricted_only(&SandboxDefaults::default());
        let default_limits = sandboxes.limits_for(None);
        assert_eq!(default_limits, ResourcePreset::Medium.limits());

        let spec = SandboxSpec {
            preset: Some(ResourcePreset::High),
            memory_mb: Some(768),
            network: Some(true),
            ..Default::default()
        };
        let limits = sandboxes.limits_for(Some(&spec));
        assert_eq!(limits.cpus, 2.0);
        assert_eq!(limits.memory_mb, 768);
        assert_eq!(limits.timeout_secs, 60);
        assert!(limits.network);
    }

    #[test]
    fn test_container_mode_without_docker() {
        let sandboxes = Sandboxes::restricted_only(&SandboxDefaults::default());
        assert!(sandboxes.backend(SandboxMode::Container).is_none());
        let spec = SandboxSpec {
            mode: Some(SandboxMode::Container),
            ..Default::default()
        };
        assert_eq!(sandboxes.mode_for(Some(&spec)), SandboxMode::Container);
        assert_eq!(sandboxes.mode_for(None), SandboxMode::Restricted);
    }
}

//! Sandbox backend running scripts in a throwaway Docker container

use super::{ResourceLimits, SandboxExecutor, SandboxResult, check_code};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, LogOutput, LogsOptions, RemoveContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Runs the user code with `inputs` bound and prints a JSON envelope last
const WRAPPER: &str = r#"
import contextlib, io, json, os, sys
code = os.environ["FLOWSTATE_CODE"]
inputs = json.loads(os.environ.get("FLOWSTATE_INPUTS", "{}"))
buffer = io.StringIO()
scope = {"inputs": inputs, "_print": print}
try:
    with contextlib.redirect_stdout(buffer):
        exec(compile(code, "<node>", "exec"), scope)
    envelope = {"success": True, "output": scope.get("result"), "stdout": buffer.getvalue()}
except BaseException as exc:
    envelope = {"success": False, "error": f"{type(exc).__name__}: {exc}", "stdout": buffer.getvalue()}
sys.stdout.write("\n" + json.dumps(envelope, default=str) + "\n")
"#;

/// Unprivileged `nobody` user
const SANDBOX_USER: &str = "65534:65534";

#[derive(Debug, Error)]
enum ContainerError {
    #[error("Docker {stage} failed: {source}")]
    Docker {
        stage: &'static str,
        source: bollard::errors::Error,
    },

    #[error("execution timed out after {0:.1}s")]
    Timeout(f64),

    #[error("failed to encode inputs: {0}")]
    Encode(#[from] serde_json::Error),
}

fn docker_err(stage: &'static str) -> impl FnOnce(bollard::errors::Error) -> ContainerError {
    move |source| ContainerError::Docker { stage, source }
}

/// Raw result of one container run
struct ContainerRun {
    exit_code: i64,
    stdout: String,
    stderr: String,
}

pub struct ContainerExecutor {
    docker: Docker,
    image: String,
    max_code_bytes: usize,
}

impl ContainerExecutor {
    /// Connect to the local Docker daemon (socket or `DOCKER_HOST`)
    pub fn connect(
        image: impl Into<String>,
        max_code_bytes: usize,
    ) -> Result<Self, bollard::errors::Error> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
            image: image.into(),
            max_code_bytes,
        })
    }

    async fn run_container(
        &self,
        code: &str,
        inputs: &Map<String, Value>,
        timeout: Duration,
        limits: &ResourceLimits,
    ) -> Result<ContainerRun, ContainerError> {
        let inputs_json = serde_json::to_string(inputs)?;
        let config = container_config(&self.image, code, inputs_json, limits);

        let container = self
            .docker
            .create_container::<&str, String>(None, config)
            .await
            .map_err(docker_err("create"))?;
        debug!(container = %container.id, image = %self.image, "Created sandbox container");

        let outcome = self.drive(&container.id, timeout).await;

        let remove = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(&container.id, Some(remove)).await {
            warn!(container = %container.id, error = %e, "Failed to remove sandbox container");
        }

        outcome
    }

    /// Start, wait with a deadline, then collect logs
    async fn drive(&self, id: &str, timeout: Duration) -> Result<ContainerRun, ContainerError> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(docker_err("start"))?;

        let waited = tokio::time::timeout(timeout, async {
            let mut stream = self
                .docker
                .wait_container::<String>(id, None::<WaitContainerOptions<String>>);
            stream.next().await
        })
        .await;

        let exit_code = match waited {
            Ok(Some(Ok(exit))) => exit.status_code,
            // Non-zero exits surface as wait errors; logs still hold the envelope
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(e))) => return Err(docker_err("wait")(e)),
            Ok(None) => 0,
            Err(_) => {
                self.docker.kill_container::<String>(id, None).await.ok();
                return Err(ContainerError::Timeout(timeout.as_secs_f64()));
            }
        };

        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = self.docker.logs(id, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(Ok(chunk)) = logs.next().await {
            match chunk {
                LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                other => stdout.push_str(&other.to_string()),
            }
        }

        Ok(ContainerRun {
            exit_code,
            stdout,
            stderr,
        })
    }
}

fn container_config(
    image: &str,
    code: &str,
    inputs_json: String,
    limits: &ResourceLimits,
) -> Config<String> {
    let network_mode = if limits.network { "bridge" } else { "none" };
    Config {
        image: Some(image.to_string()),
        cmd: Some(vec![
            "python".to_string(),
            "-c".to_string(),
            WRAPPER.to_string(),
        ]),
        env: Some(vec![
            format!("FLOWSTATE_CODE={}", code),
            format!("FLOWSTATE_INPUTS={}", inputs_json),
        ]),
        user: Some(SANDBOX_USER.to_string()),
        working_dir: Some("/tmp".to_string()),
        network_disabled: Some(!limits.network),
        host_config: Some(HostConfig {
            memory: Some(limits.memory_bytes()),
            nano_cpus: Some(limits.nano_cpus()),
            pids_limit: Some(limits.pids),
            network_mode: Some(network_mode.to_string()),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                "rw,noexec,nosuid,size=64m".to_string(),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Find the envelope the wrapper prints as its last JSON line
fn parse_envelope(stdout: &str) -> Option<Map<String, Value>> {
    stdout.lines().rev().find_map(|line| {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) if map.contains_key("success") => Some(map),
            _ => None,
        }
    })
}

fn into_result(run: ContainerRun, elapsed: Duration) -> SandboxResult {
    match parse_envelope(&run.stdout) {
        Some(mut envelope) => {
            let stdout = match envelope.remove("stdout") {
                Some(Value::String(s)) => s,
                _ => String::new(),
            };
            if envelope.get("success").and_then(Value::as_bool) == Some(true) {
                let output = envelope.remove("output").unwrap_or(Value::Null);
                SandboxResult::success(output, elapsed)
                    .with_stdout(stdout)
                    .with_stderr(run.stderr)
            } else {
                let error = match envelope.remove("error") {
                    Some(Value::String(s)) => s,
                    _ => "script failed".to_string(),
                };
                let mut result = SandboxResult::failure(error, elapsed).with_stdout(stdout);
                if !run.stderr.is_empty() {
                    result.stderr = format!("{}\n{}", run.stderr.trim_end(), result.stderr);
                }
                result
            }
        }
        // No envelope: the wrapper itself died, keep whatever was printed
        None if run.exit_code == 0 => {
            SandboxResult::success(Value::String(run.stdout.trim().to_string()), elapsed)
                .with_stdout(run.stdout)
                .with_stderr(run.stderr)
        }
        None => {
            let detail = if run.stderr.trim().is_empty() {
                run.stdout.trim().to_string()
            } else {
                run.stderr.trim().to_string()
            };
            SandboxResult::failure(
                format!("container exited with code {}: {}", run.exit_code, detail),
                elapsed,
            )
            .with_stdout(run.stdout)
        }
    }
}

#[async_trait]
impl SandboxExecutor for ContainerExecutor {
    async fn execute(
        &self,
        code: &str,
        inputs: &Map<String, Value>,
        timeout: Duration,
        resources: Option<&ResourceLimits>,
    ) -> SandboxResult {
        let started = Instant::now();

        if let Err(e) = check_code(code, self.max_code_bytes) {
            return SandboxResult::failure(e.to_string(), started.elapsed());
        }

        let limits = resources.cloned().unwrap_or_default();
        match self.run_container(code, inputs, timeout, &limits).await {
            Ok(run) => into_result(run, started.elapsed()),
            Err(e) => SandboxResult::failure(e.to_string(), started.elapsed()),
        }
    }

    fn name(&self) -> &str {
        "container"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(stdout: &str, stderr: &str, exit_code: i64) -> ContainerRun {
        ContainerRun {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_envelope_success() {
        let stdout = "\n{\"success\": true, \"output\": 6, \"stdout\": \"hi\\n\"}\n";
        let result = into_result(run(stdout, "", 0), Duration::from_millis(5));
        assert!(result.success);
        assert_eq!(result.output, json!(6));
        assert_eq!(result.stdout, "hi\n");
    }

    #[test]
    fn test_envelope_failure() {
        let stdout = "{\"success\": false, \"error\": \"KeyError: 'x'\", \"stdout\": \"\"}";
        let result = into_result(run(stdout, "", 0), Duration::from_millis(5));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("KeyError: 'x'"));
    }

    #[test]
    fn test_raw_text_fallback() {
        let result = into_result(run("plain output\n", "", 0), Duration::ZERO);
        assert!(result.success);
        assert_eq!(result.output, json!("plain output"));

        let result = into_result(run("", "Traceback: boom", 1), Duration::ZERO);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("boom"));
    }

    #[test]
    fn test_hardened_host_config() {
        let config = container_config(
            "python:3.11-slim",
            "result = 1",
            "{}".into(),
            &ResourceLimits::default(),
        );
        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(config.user.as_deref(), Some(SANDBOX_USER));
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon"]
    async fn test_container_sum_inputs() {
        let executor = ContainerExecutor::connect("python:3.11-slim", 10_000).unwrap();
        let inputs = json!({"nums": [1, 2, 3]}).as_object().cloned().unwrap();
        let result = executor
            .execute(
                "result = sum(inputs[\"nums\"])",
                &inputs,
                Duration::from_secs(60),
                None,
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output, json!(6));
    }
}

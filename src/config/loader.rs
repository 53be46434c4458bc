//! Configuration loading with multi-layer merge

use super::{ExecutionMode, LlmConfig, SandboxMode, WorkflowSpec};
use crate::sandbox::ResourcePreset;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Global defaults
    #[serde(default)]
    pub defaults: Defaults,

    /// Model provider defaults
    #[serde(default)]
    pub llm: LlmConfig,

    /// Code node defaults
    #[serde(default)]
    pub sandbox: SandboxDefaults,

    /// Checkpoint database
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Global default settings. Fields stay `None` until some layer sets them,
/// so a later layer can restore a built-in value over an earlier override.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Retries after the first model attempt
    pub max_retries: Option<u32>,

    /// Topology accepted when a workflow does not say
    pub mode: Option<ExecutionMode>,

    /// Seconds a model call or script may take when neither the `llm` nor
    /// the `sandbox` section sets its own timeout
    pub node_timeout_secs: Option<u64>,
}

const DEFAULT_MAX_RETRIES: u32 = 3;

impl Defaults {
    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode.unwrap_or_default()
    }

    fn merge(&mut self, other: Defaults) {
        self.max_retries = other.max_retries.or(self.max_retries);
        self.mode = other.mode.or(self.mode);
        self.node_timeout_secs = other.node_timeout_secs.or(self.node_timeout_secs);
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxDefaults {
    pub mode: Option<SandboxMode>,

    /// Container image for the container backend
    pub image: Option<String>,

    /// Code larger than this is rejected before execution
    pub max_code_bytes: Option<usize>,

    pub preset: Option<ResourcePreset>,

    /// Seconds; falls back to the preset's limit when unset
    pub timeout_secs: Option<u64>,
}

const DEFAULT_IMAGE: &str = "python:3.11-slim";
const DEFAULT_MAX_CODE_BYTES: usize = 100_000;

impl SandboxDefaults {
    pub fn mode(&self) -> SandboxMode {
        self.mode.unwrap_or_default()
    }

    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    pub fn max_code_bytes(&self) -> usize {
        self.max_code_bytes.unwrap_or(DEFAULT_MAX_CODE_BYTES)
    }

    pub fn preset(&self) -> ResourcePreset {
        self.preset.unwrap_or_default()
    }

    fn merge(&mut self, other: SandboxDefaults) {
        self.mode = other.mode.or(self.mode);
        self.image = other.image.or(self.image.take());
        self.max_code_bytes = other.max_code_bytes.or(self.max_code_bytes);
        self.preset = other.preset.or(self.preset);
        self.timeout_secs = other.timeout_secs.or(self.timeout_secs);
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// SQLite database path; `~` is expanded
    pub database: Option<String>,
}

impl StorageConfig {
    /// Resolve the database path, defaulting to the user config dir
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database {
            Some(path) => {
                let expanded = shellexpand::tilde(path);
                Ok(PathBuf::from(expanded.as_ref()))
            }
            None => {
                let dir = dirs::config_dir()
                    .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
                Ok(dir.join("flowstate").join("runs.db"))
            }
        }
    }
}

impl EngineConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/flowstate/config.toml
    /// 3. .flowstate/config.toml (project)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        // Load user config
        if let Some(user_config_path) = Self::user_config_path() {
            if user_config_path.exists() {
                let user_config = Self::load_file(&user_config_path)
                    .with_context(|| format!("loading {}", user_config_path.display()))?;
                config.merge(user_config);
            }
        }

        // Load project config
        let project_config_path = project_dir
            .map(|p| p.join(".flowstate/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".flowstate/config.toml"));

        if project_config_path.exists() {
            let project_config = Self::load_file(&project_config_path)
                .with_context(|| format!("loading {}", project_config_path.display()))?;
            config.merge(project_config);
        }

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Get the user config path (~/.config/flowstate/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("flowstate/config.toml"))
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: Self) {
        self.defaults.merge(other.defaults);
        self.llm = self.llm.merged_with(&other.llm);
        self.sandbox.merge(other.sandbox);
        if other.storage.database.is_some() {
            self.storage.database = other.storage.database;
        }
    }

    /// Apply a workflow's own `config` section on top of the engine config.
    /// The node timeout fills in whichever of the model and sandbox
    /// timeouts is still unset.
    pub fn for_workflow(&self, spec: &WorkflowSpec) -> EngineConfig {
        let mut config = self.clone();
        config.llm = self.llm.merged_with(&spec.config.llm);
        if let Some(max_retries) = spec.config.execution.max_retries {
            config.defaults.max_retries = Some(max_retries);
        }
        if let Some(timeout) = config.defaults.node_timeout_secs {
            config.llm.timeout_secs.get_or_insert(timeout);
            config.sandbox.timeout_secs.get_or_insert(timeout);
        }
        config
    }

    /// Fill workflow settings the document left unset
    pub fn apply_defaults(&self, spec: &mut WorkflowSpec) {
        if spec.config.execution.mode.is_none() {
            spec.config.execution.mode = Some(self.defaults.mode());
        }
    }
}

/// Load a workflow document; the format is picked from the extension
/// (`.json` is JSON, anything else is TOML)
pub fn load_workflow_file(path: &Path) -> Result<WorkflowSpec> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let spec: WorkflowSpec = if is_json {
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?
    } else {
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?
    };

    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_load_empty_config() {
        let config = EngineConfig::default();
        assert_eq!(config.defaults.max_retries(), 3);
        assert_eq!(config.sandbox.image(), "python:3.11-slim");
        assert!(config.storage.database.is_none());
    }

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
            [defaults]
            max_retries = 1
            mode = "extended"

            [llm]
            model = "gpt-4o"
            cost_per_1k_prompt = 0.005

            [sandbox]
            mode = "container"
            preset = "high"
        "#
        )
        .unwrap();

        let config = EngineConfig::load_file(&config_path).unwrap();
        assert_eq!(config.defaults.max_retries(), 1);
        assert_eq!(config.defaults.mode(), ExecutionMode::Extended);
        assert_eq!(config.llm.model(), "gpt-4o");
        assert_eq!(config.sandbox.mode(), SandboxMode::Container);
        assert_eq!(config.sandbox.preset(), ResourcePreset::High);
    }

    #[test]
    fn test_load_project_layer() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".flowstate")).unwrap();
        std::fs::write(
            dir.path().join(".flowstate/config.toml"),
            "[storage]\ndatabase = \"runs.db\"\n",
        )
        .unwrap();

        let config = EngineConfig::load(Some(dir.path())).unwrap();
        assert_eq!(config.storage.database.as_deref(), Some("runs.db"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: std::result::Result<EngineConfig, _> = toml::from_str("[defaults]\nretries = 2\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_merge() {
        let mut base = EngineConfig::default();
        base.llm.model = Some("base-model".into());
        base.llm.temperature = Some(0.1);

        let mut override_config = EngineConfig::default();
        override_config.llm.model = Some("project-model".into());
        override_config.sandbox.max_code_bytes = Some(2048);
        override_config.storage.database = Some("/tmp/x.db".into());

        base.merge(override_config);

        assert_eq!(base.llm.model(), "project-model");
        assert_eq!(base.llm.temperature, Some(0.1));
        assert_eq!(base.sandbox.max_code_bytes(), 2048);
        assert_eq!(base.storage.database.as_deref(), Some("/tmp/x.db"));
    }

    #[test]
    fn test_later_layer_restores_builtin_values() {
        let mut user: EngineConfig = toml::from_str(
            "[defaults]\nmax_retries = 0\nmode = \"extended\"\n[sandbox]\npreset = \"high\"\n",
        )
        .unwrap();
        let project: EngineConfig = toml::from_str(
            "[defaults]\nmax_retries = 3\nmode = \"linear\"\n[sandbox]\npreset = \"medium\"\n",
        )
        .unwrap();

        user.merge(project);

        assert_eq!(user.defaults.max_retries(), 3);
        assert_eq!(user.defaults.mode(), ExecutionMode::Linear);
        assert_eq!(user.sandbox.preset(), ResourcePreset::Medium);

        // Layers that say nothing leave earlier values alone
        user.merge(EngineConfig::default());
        assert_eq!(user.defaults.mode, Some(ExecutionMode::Linear));
    }

    #[test]
    fn test_node_timeout_fills_unset_timeouts() {
        let mut engine = EngineConfig::default();
        engine.defaults.node_timeout_secs = Some(45);
        engine.sandbox.timeout_secs = Some(5);
        let spec: WorkflowSpec =
            toml::from_str("[flow]\nname = \"w\"\n[state.fields.x]\ntype = \"int\"\n").unwrap();

        let effective = engine.for_workflow(&spec);
        assert_eq!(effective.llm.timeout_secs(), 45);
        assert_eq!(effective.sandbox.timeout_secs, Some(5));
    }

    #[test]
    fn test_database_path_expands_tilde() {
        let storage = StorageConfig {
            database: Some("~/flowstate.db".into()),
        };
        let path = storage.database_path().unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));

        let absolute = StorageConfig {
            database: Some("/var/lib/flowstate.db".into()),
        };
        assert_eq!(
            absolute.database_path().unwrap(),
            PathBuf::from("/var/lib/flowstate.db")
        );
    }

    #[test]
    fn test_load_workflow_by_extension() {
        let dir = TempDir::new().unwrap();
        let json_path = dir.path().join("flow.json");
        std::fs::write(
            &json_path,
            r#"{
                "flow": {"name": "j"},
                "state": {"fields": {"x": {"type": "str"}}},
                "nodes": [],
                "edges": [{"from": "START", "to": "END"}]
            }"#,
        )
        .unwrap();
        let spec = load_workflow_file(&json_path).unwrap();
        assert_eq!(spec.flow.name, "j");
        assert_eq!(spec.schema_version, "1.0");

        let toml_path = dir.path().join("flow.toml");
        std::fs::write(
            &toml_path,
            "[flow]\nname = \"t\"\n[state.fields.x]\ntype = \"int\"\n",
        )
        .unwrap();
        let spec = load_workflow_file(&toml_path).unwrap();
        assert_eq!(spec.flow.name, "t");
        assert!(spec.edges.is_empty());
    }

    #[test]
    fn test_workflow_overrides_engine_llm() {
        let mut engine = EngineConfig::default();
        engine.llm.model = Some("engine".into());
        engine.llm.timeout_secs = Some(10);

        let mut spec: WorkflowSpec =
            toml::from_str("[flow]\nname = \"w\"\n[state.fields.x]\ntype = \"int\"\n").unwrap();
        spec.config.llm.model = Some("workflow".into());
        spec.config.execution.max_retries = Some(0);

        let merged = engine.for_workflow(&spec);
        assert_eq!(merged.llm.model(), "workflow");
        assert_eq!(merged.llm.timeout_secs(), 10);
        assert_eq!(merged.defaults.max_retries(), 0);
    }

    #[test]
    fn test_apply_default_mode() {
        let mut engine = EngineConfig::default();
        engine.defaults.mode = Some(ExecutionMode::Extended);

        let mut spec: WorkflowSpec =
            toml::from_str("[flow]\nname = \"w\"\n[state.fields.x]\ntype = \"int\"\n").unwrap();
        engine.apply_defaults(&mut spec);
        assert_eq!(spec.execution_mode(), ExecutionMode::Extended);

        let mut explicit: WorkflowSpec = toml::from_str(
            "[flow]\nname = \"w\"\n[state.fields.x]\ntype = \"int\"\n[config.execution]\nmode = \"linear\"\n",
        )
        .unwrap();
        engine.apply_defaults(&mut explicit);
        assert_eq!(explicit.execution_mode(), ExecutionMode::Linear);
    }
}

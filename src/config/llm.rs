//! Model provider configuration

use serde::{Deserialize, Serialize};

/// LLM settings, used both as the engine/global default and as a per-node
/// override. Every field is optional so overrides can be merged field by
/// field.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL (e.g. `https://api.openai.com/v1`)
    pub base_url: Option<String>,

    /// Model name
    pub model: Option<String>,

    /// Environment variable holding the API key
    pub api_key_env: Option<String>,

    /// Sampling temperature
    pub temperature: Option<f32>,

    /// Completion token cap
    pub max_tokens: Option<u32>,

    /// Per-call timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Retries after the first attempt
    pub max_retries: Option<u32>,

    /// Base delay in milliseconds for exponential backoff
    pub retry_delay_ms: Option<u64>,

    /// USD per 1000 prompt tokens
    pub cost_per_1k_prompt: Option<f64>,

    /// USD per 1000 completion tokens
    pub cost_per_1k_completion: Option<f64>,
}

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

impl LlmConfig {
    /// Overlay `other` on top of `self`; fields set in `other` win
    pub fn merged_with(&self, other: &LlmConfig) -> LlmConfig {
        LlmConfig {
            base_url: other.base_url.clone().or_else(|| self.base_url.clone()),
            model: other.model.clone().or_else(|| self.model.clone()),
            api_key_env: other
                .api_key_env
                .clone()
                .or_else(|| self.api_key_env.clone()),
            temperature: other.temperature.or(self.temperature),
            max_tokens: other.max_tokens.or(self.max_tokens),
            timeout_secs: other.timeout_secs.or(self.timeout_secs),
            max_retries: other.max_retries.or(self.max_retries),
            retry_delay_ms: other.retry_delay_ms.or(self.retry_delay_ms),
            cost_per_1k_prompt: other.cost_per_1k_prompt.or(self.cost_per_1k_prompt),
            cost_per_1k_completion: other
                .cost_per_1k_completion
                .or(self.cost_per_1k_completion),
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn api_key_env(&self) -> &str {
        self.api_key_env.as_deref().unwrap_or(DEFAULT_API_KEY_ENV)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn retry_delay_ms(&self) -> u64 {
        self.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS)
    }

    /// Estimated USD cost for a call with the given token counts
    pub fn estimate_cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let prompt = self.cost_per_1k_prompt.unwrap_or(0.0) * prompt_tokens as f64 / 1000.0;
        let completion =
            self.cost_per_1k_completion.unwrap_or(0.0) * completion_tokens as f64 / 1000.0;
        prompt + completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_field_by_field() {
        let global = LlmConfig {
            model: Some("gpt-4o".into()),
            temperature: Some(0.2),
            max_retries: Some(5),
            ..Default::default()
        };
        let node = LlmConfig {
            temperature: Some(0.9),
            max_tokens: Some(256),
            ..Default::default()
        };

        let merged = global.merged_with(&node);
        assert_eq!(merged.model(), "gpt-4o");
        assert_eq!(merged.temperature, Some(0.9));
        assert_eq!(merged.max_tokens, Some(256));
        assert_eq!(merged.max_retries(), 5);
    }

    #[test]
    fn test_defaults() {
        let config = LlmConfig::default();
        assert_eq!(config.base_url(), DEFAULT_BASE_URL);
        assert_eq!(config.api_key_env(), "OPENAI_API_KEY");
        assert_eq!(config.max_retries(), 3);
    }

    #[test]
    fn test_estimate_cost() {
        let config = LlmConfig {
            cost_per_1k_prompt: Some(0.5),
            cost_per_1k_completion: Some(1.5),
            ..Default::default()
        };
        let cost = config.estimate_cost(2000, 1000);
        assert!((cost - 2.5).abs() < 1e-9);
        assert_eq!(LlmConfig::default().estimate_cost(1000, 1000), 0.0);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            model = "llama3"
            base_url = "http://localhost:11434/v1"
            timeout_secs = 30
        "#;
        let config: LlmConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.model(), "llama3");
        assert_eq!(config.timeout_secs(), 30);

        let bad = r#"modle = "typo""#;
        assert!(toml::from_str::<LlmConfig>(bad).is_err());
    }
}

//! Core types and traits for model calls

use crate::config::LlmConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Error types that can occur during a model call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    /// Request timed out
    #[error("timeout after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// Rate limited by the provider
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit { retry_after: Option<Duration> },

    /// Authentication failed
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Network error
    #[error("network error: {message}")]
    Network { message: String },

    /// Failed to parse the provider response
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Model output did not satisfy the node's output contract
    #[error("output contract violated: {message}")]
    Contract { message: String },

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl LlmError {
    /// Transport faults and malformed structured output are retried;
    /// credential and configuration faults are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout { .. }
                | LlmError::RateLimit { .. }
                | LlmError::Network { .. }
                | LlmError::Parse { .. }
                | LlmError::Contract { .. }
        )
    }

    /// Server-suggested delay for rate limit errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self::Timeout { elapsed }
    }

    pub fn rate_limit(retry_after: Option<Duration>) -> Self {
        Self::RateLimit { retry_after }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub arguments: Value,
}

/// One message of a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,

    /// Calls issued by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Set on tool result messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// Function definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

/// Request sent to a model provider
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout: Option<Duration>,

    /// JSON schema the reply must satisfy (structured output)
    pub response_schema: Option<Value>,

    pub tools: Vec<ToolDefinition>,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: model.into(),
            temperature: None,
            max_tokens: None,
            timeout: None,
            response_schema: None,
            tools: Vec::new(),
        }
    }

    /// Apply sampling and timeout settings from a merged config
    pub fn with_config(mut self, config: &LlmConfig) -> Self {
        self.temperature = config.temperature;
        self.max_tokens = config.max_tokens;
        self.timeout = Some(Duration::from_secs(config.timeout_secs()));
        self
    }

    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Response from a model call
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    /// Raw text output
    pub text: String,

    /// Tool calls the model asked for, if any
    pub tool_calls: Vec<ToolCall>,

    /// Model that produced the reply (if reported)
    pub model: Option<String>,

    pub usage: TokenUsage,

    /// Time taken by the call
    pub duration: Duration,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            model: None,
            usage: TokenUsage::default(),
            duration: Duration::ZERO,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// Chat-completion provider
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Provider name
    fn name(&self) -> &str;
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy from a merged LLM config
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            initial_delay: Duration::from_millis(config.retry_delay_ms()),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            // Up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25 * capped_delay;
            capped_delay + jitter
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(LlmError::timeout(Duration::from_secs(30)).is_retryable());
        assert!(LlmError::rate_limit(None).is_retryable());
        assert!(LlmError::network("connection reset").is_retryable());
        assert!(LlmError::contract("missing field 'b'").is_retryable());

        assert!(!LlmError::auth("invalid token").is_retryable());
        assert!(!LlmError::config("no model").is_retryable());
    }

    #[test]
    fn test_request_builder() {
        let config = LlmConfig {
            temperature: Some(0.3),
            timeout_secs: Some(45),
            ..Default::default()
        };
        let request = LlmRequest::new("gpt-4o", vec![ChatMessage::user("hi")])
            .with_config(&config)
            .with_response_schema(serde_json::json!({"type": "object"}));

        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.temperature, Some(0.3));
        assert_eq!(request.timeout, Some(Duration::from_secs(45)));
        assert!(request.response_schema.is_some());
        assert!(request.tools.is_empty());
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
        });
        total.add(TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
        });
        assert_eq!(total.total(), 18);
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_policy_with_jitter() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            jitter: true,
            ..Default::default()
        };

        let delay = policy.delay_for_attempt(0);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_millis(1250));
    }

    #[test]
    fn test_policy_from_config() {
        let config = LlmConfig {
            max_retries: Some(1),
            retry_delay_ms: Some(50),
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
    }
}

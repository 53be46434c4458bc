//! Model provider layer
//!
//! Provides a unified interface for chat-completion providers:
//! - OpenAI-compatible HTTP APIs
//! - Output contracts and JSON extraction from model text
//! - Retry with jittered exponential backoff

mod contract;
mod http;
#[cfg(test)]
pub(crate) mod mock;
mod output_parser;
mod retry;
mod types;

pub use contract::OutputContract;
pub use http::OpenAiClient;
pub use output_parser::extract_json;
pub use retry::with_retry;
pub use types::{
    ChatMessage, LlmClient, LlmError, LlmRequest, LlmResponse, RetryPolicy, Role, TokenUsage,
    ToolCall, ToolDefinition,
};

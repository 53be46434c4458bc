//! OpenAI-compatible chat completions client

use super::types::{
    ChatMessage, LlmClient, LlmError, LlmRequest, LlmResponse, Role, TokenUsage, ToolCall,
};
use crate::config::LlmConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::debug;

/// Client for HTTP chat-completion APIs speaking the OpenAI wire format
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    /// Default timeout when the request carries none
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: Role,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

impl OpenAiClient {
    /// Build a client from a merged LLM config. The API key is read from
    /// the configured environment variable; endpoints without auth work
    /// when it is unset.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let timeout = Duration::from_secs(config.timeout_secs());
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url().to_string(),
            api_key: std::env::var(config.api_key_env()).ok(),
            timeout,
            client,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn chat_completion_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_body<'a>(&self, request: &'a LlmRequest) -> ChatCompletionRequest<'a> {
        let response_format = request.response_schema.as_ref().map(|schema| {
            json!({
                "type": "json_schema",
                "json_schema": {"name": "node_output", "schema": schema}
            })
        });
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();

        ChatCompletionRequest {
            model: &request.model,
            messages: request.messages.iter().map(wire_message).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format,
            tools,
        }
    }

    fn map_http_error(&self, status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::auth(format!("HTTP {}: {}", status, body)),
            429 => LlmError::rate_limit(parse_retry_after(body)),
            408 | 504 => LlmError::timeout(self.timeout),
            400..=499 => LlmError::config(format!("HTTP {}: {}", status, body)),
            500..=599 => LlmError::network(format!("HTTP {}: {}", status, body)),
            _ => LlmError::network(format!("unexpected HTTP {}: {}", status, body)),
        }
    }
}

fn wire_message(message: &ChatMessage) -> WireMessage {
    WireMessage {
        role: message.role,
        content: message.content.clone(),
        tool_calls: message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments.to_string()}
                })
            })
            .collect(),
        tool_call_id: message.tool_call_id.clone(),
    }
}

/// Look for a `retry_after` seconds field in an error body
fn parse_retry_after(body: &str) -> Option<Duration> {
    let json = serde_json::from_str::<Value>(body).ok()?;
    let seconds = json.get("retry_after").and_then(|v| v.as_f64())?;
    Some(Duration::from_secs_f64(seconds))
}

fn into_response(
    completion: ChatCompletionResponse,
    elapsed: Duration,
) -> Result<LlmResponse, LlmError> {
    let message = completion
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| LlmError::parse("response has no choices"))?;

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|call| {
            let arguments = serde_json::from_str(&call.function.arguments).map_err(|e| {
                LlmError::parse(format!(
                    "tool call '{}' has malformed arguments: {}",
                    call.function.name, e
                ))
            })?;
            Ok(ToolCall {
                id: call.id,
                name: call.function.name,
                arguments,
            })
        })
        .collect::<Result<Vec<_>, LlmError>>()?;

    let usage = completion
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens.unwrap_or(0),
            completion_tokens: u.completion_tokens.unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(LlmResponse {
        text: message.content.unwrap_or_default(),
        tool_calls,
        model: completion.model,
        usage,
        duration: elapsed,
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let start = Instant::now();
        let body = self.request_body(request);

        let mut http_request = self.client.post(self.chat_completion_url()).json(&body);
        if let Some(ref key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", key));
        }

        debug!(model = %request.model, messages = request.messages.len(), "sending chat completion");

        let timeout = request.timeout.unwrap_or(self.timeout);
        let result = tokio::time::timeout(timeout, http_request.send()).await;
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(response)) => {
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(self.map_http_error(status, &body));
                }
                let completion: ChatCompletionResponse = response
                    .json()
                    .await
                    .map_err(|e| LlmError::parse(format!("failed to parse response: {}", e)))?;
                into_response(completion, start.elapsed())
            }
            Ok(Err(e)) if e.is_timeout() => Err(LlmError::timeout(elapsed)),
            Ok(Err(e)) if e.is_connect() => {
                Err(LlmError::network(format!("connection failed: {}", e)))
            }
            Ok(Err(e)) => Err(LlmError::network(format!("request failed: {}", e))),
            Err(_) => Err(LlmError::timeout(elapsed)),
        }
    }

    fn name(&self) -> &str {
        "openai"
    }
}

//! Scripted model client for tests

use super::types::{LlmClient, LlmError, LlmRequest, LlmResponse, TokenUsage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Replays queued replies in order, then repeats `fallback`
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    fallback: String,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, reply: Result<LlmResponse, LlmError>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn then_text(self, text: &str) -> Self {
        self.then(Ok(LlmResponse::text(text).with_usage(usage(10, 5))))
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn usage(prompt_tokens: u64, completion_tokens: u64) -> TokenUsage {
    TokenUsage {
        prompt_tokens,
        completion_tokens,
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.replies.lock().unwrap().pop_front() {
            Some(reply) => reply,
            None => Ok(LlmResponse::text(self.fallback.clone()).with_usage(usage(10, 5))),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

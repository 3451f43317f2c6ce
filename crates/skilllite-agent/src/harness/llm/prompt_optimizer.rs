//! Injects a tool-call format hint and a thinking-mode directive into the
//! outgoing system message. Pure transform — never touches the network.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::middleware::{LLMRequest, Middleware, Next};
use crate::harness::types::LLMResponse;

const TOOL_FORMAT_HINT: &str = "When you need to call a tool, respond with ONLY a JSON object \
of the form {\"tool\": \"<name>\", \"args\": {...}} and nothing else.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingMode {
    Always,
    Auto,
    Never,
}

impl ThinkingMode {
    fn hint(&self) -> Option<&'static str> {
        match self {
            ThinkingMode::Always => {
                Some("Think step by step inside <think>...</think> before answering.")
            }
            ThinkingMode::Auto => Some(
                "Use <think>...</think> to reason through non-trivial steps before answering.",
            ),
            ThinkingMode::Never => None,
        }
    }
}

pub struct PromptOptimizerMiddleware {
    pub thinking_mode: ThinkingMode,
}

impl PromptOptimizerMiddleware {
    pub fn new(thinking_mode: ThinkingMode) -> Self {
        Self { thinking_mode }
    }

    fn extract_tool_names(request: &LLMRequest) -> Vec<String> {
        let Some(tools) = &request.tools else { return Vec::new() };
        tools
            .iter()
            .filter_map(|t| {
                t.get("function")
                    .and_then(|f| f.get("name"))
                    .or_else(|| t.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect()
    }

    fn inject_into_system_prompt(&self, mut request: LLMRequest) -> LLMRequest {
        let tool_names = Self::extract_tool_names(&request);
        if tool_names.is_empty() && self.thinking_mode.hint().is_none() {
            return request;
        }

        let mut injection = String::new();
        if let Some(hint) = self.thinking_mode.hint() {
            injection.push_str(hint);
            injection.push('\n');
        }
        if !tool_names.is_empty() {
            injection.push_str(TOOL_FORMAT_HINT);
            injection.push('\n');
            injection.push_str(&format!("Available tools: {}", tool_names.join(", ")));
        }

        if let Some(system_msg) = request.messages.iter_mut().find(|m| m.role == "system") {
            system_msg.content = format!("{}\n\n{}", system_msg.content, injection.trim_end());
        } else {
            request.messages.insert(
                0,
                crate::harness::context::ContextMessage::new("system", injection.trim_end()),
            );
        }
        request
    }
}

#[async_trait]
impl Middleware for PromptOptimizerMiddleware {
    async fn process(&self, request: LLMRequest, next: Next) -> Result<LLMResponse> {
        let request = self.inject_into_system_prompt(request);
        next(request).await
    }
}

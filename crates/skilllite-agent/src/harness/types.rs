//! Shared data model for the agent harness: tool calls/results, LLM
//! responses, and the event-bus vocabulary.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Describes one parameter of a [`crate::harness::tools::base::Tool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub enum_values: Option<Vec<String>>,
}

/// A tool invocation extracted from an LLM response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, Value>,
    /// The raw text this call was parsed from, kept for diagnostics.
    #[serde(default)]
    pub raw: String,
}

/// The outcome of executing a [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn err_with_output(error: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }

    /// Render as the text stored in the working context layer.
    pub fn to_message(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            let error = self.error.as_deref().unwrap_or("unknown error");
            if self.output.is_empty() {
                format!("[Tool Error] {error}")
            } else {
                format!("[Tool Error] {error}\n{}", self.output)
            }
        }
    }
}

/// Token usage reported by an LLM call, when the backend provides it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A single LLM response, normalized across the openai/native dialects.
#[derive(Debug, Clone, Default)]
pub struct LLMResponse {
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub model: String,
    pub raw_response: Option<Value>,
    pub latency_ms: u64,
}

impl LLMResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Events emitted onto the [`crate::harness::events::EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStarted,
    AgentDone,
    AgentError,
    AgentCancelled,
    LlmRequest,
    LlmResponse,
    LlmStreaming,
    LlmThinking,
    LlmError,
    ToolExecuting,
    ToolExecuted,
    ToolError,
    ReasonerDecision,
    ContextCompressed,
    PolicyViolation,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentStarted => "agent_started",
            EventType::AgentDone => "agent_done",
            EventType::AgentError => "agent_error",
            EventType::AgentCancelled => "agent_cancelled",
            EventType::LlmRequest => "llm_request",
            EventType::LlmResponse => "llm_response",
            EventType::LlmStreaming => "llm_streaming",
            EventType::LlmThinking => "llm_thinking",
            EventType::LlmError => "llm_error",
            EventType::ToolExecuting => "tool_executing",
            EventType::ToolExecuted => "tool_executed",
            EventType::ToolError => "tool_error",
            EventType::ReasonerDecision => "reasoner_decision",
            EventType::ContextCompressed => "context_compressed",
            EventType::PolicyViolation => "policy_violation",
        }
    }
}

/// One entry in the event bus's history, and the payload handed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub data: Value,
    pub timestamp: u64,
}

impl AgentEvent {
    pub fn new(event_type: EventType, data: Value) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            event_type,
            data,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_message_success_is_bare_output() {
        let r = ToolResult::ok("hello");
        assert_eq!(r.to_message(), "hello");
    }

    #[test]
    fn to_message_failure_with_output() {
        let r = ToolResult::err_with_output("boom", "partial");
        assert_eq!(r.to_message(), "[Tool Error] boom\npartial");
    }

    #[test]
    fn to_message_failure_without_output() {
        let r = ToolResult::err("boom");
        assert_eq!(r.to_message(), "[Tool Error] boom");
    }

    #[test]
    fn has_tool_calls_reflects_vec() {
        let mut r = LLMResponse::default();
        assert!(!r.has_tool_calls());
        r.tool_calls.push(ToolCall {
            name: "read_file".into(),
            arguments: serde_json::Map::new(),
            raw: String::new(),
        });
        assert!(r.has_tool_calls());
    }
}

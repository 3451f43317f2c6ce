//! Turns one [`LLMResponse`] into a decision. Pure and synchronous — no
//! I/O, no knowledge of tools or context, just the step-budget rule.

use super::types::{LLMResponse, ToolCall};

#[derive(Clone)]
pub enum ReasonerDecision {
    /// Run these tool calls and loop back with their results.
    ExecuteTools(Vec<ToolCall>),
    /// The model produced a final answer with no further tool calls.
    Done(String),
    /// `max_steps` was reached before the model produced a final answer.
    StepLimitReached,
    /// The response itself signals a terminal error: an explicit
    /// `finish_reason == "error"`, or empty content with no tool calls.
    Error(String),
}

pub struct Reasoner {
    pub max_steps: u32,
    step_count: u32,
}

impl Reasoner {
    pub fn new(max_steps: u32) -> Self {
        Self { max_steps, step_count: 0 }
    }

    pub fn reset(&mut self) {
        self.step_count = 0;
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    /// Increments the step counter before checking the budget, so a
    /// `max_steps = 3` reasoner makes exactly 3 decisions before refusing a
    /// fourth.
    pub fn decide(&mut self, response: &LLMResponse) -> ReasonerDecision {
        self.step_count += 1;
        if self.step_count > self.max_steps {
            return ReasonerDecision::StepLimitReached;
        }
        if response.finish_reason.as_deref() == Some("error") {
            return ReasonerDecision::Error(response.content.clone());
        }
        if response.has_tool_calls() {
            return ReasonerDecision::ExecuteTools(response.tool_calls.clone());
        }
        if response.content.trim().is_empty() {
            return ReasonerDecision::Error("Empty response".to_string());
        }
        ReasonerDecision::Done(response.content.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_tool_call() -> LLMResponse {
        LLMResponse {
            tool_calls: vec![ToolCall {
                name: "read_file".into(),
                arguments: serde_json::Map::new(),
                raw: String::new(),
            }],
            ..Default::default()
        }
    }

    fn final_response(content: &str) -> LLMResponse {
        LLMResponse { content: content.to_string(), ..Default::default() }
    }

    #[test]
    fn tool_calls_route_to_execute() {
        let mut reasoner = Reasoner::new(5);
        match reasoner.decide(&response_with_tool_call()) {
            ReasonerDecision::ExecuteTools(calls) => assert_eq!(calls.len(), 1),
            other => panic!("expected ExecuteTools, got {other:?}"),
        }
    }

    #[test]
    fn no_tool_calls_routes_to_done() {
        let mut reasoner = Reasoner::new(5);
        match reasoner.decide(&final_response("all set")) {
            ReasonerDecision::Done(text) => assert_eq!(text, "all set"),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn max_steps_three_allows_exactly_three_decisions() {
        let mut reasoner = Reasoner::new(3);
        for _ in 0..3 {
            assert!(!matches!(
                reasoner.decide(&response_with_tool_call()),
                ReasonerDecision::StepLimitReached
            ));
        }
        assert!(matches!(
            reasoner.decide(&response_with_tool_call()),
            ReasonerDecision::StepLimitReached
        ));
    }

    #[test]
    fn explicit_error_finish_reason_routes_to_error() {
        let mut reasoner = Reasoner::new(5);
        let response = LLMResponse {
            content: "rate limited".to_string(),
            finish_reason: Some("error".to_string()),
            ..Default::default()
        };
        match reasoner.decide(&response) {
            ReasonerDecision::Error(text) => assert_eq!(text, "rate limited"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn empty_content_with_no_tool_calls_routes_to_error() {
        let mut reasoner = Reasoner::new(5);
        match reasoner.decide(&final_response("   ")) {
            ReasonerDecision::Error(text) => assert_eq!(text, "Empty response"),
            other => panic!("expected Error, got {other:?}"),
        }
    }
}

impl std::fmt::Debug for ReasonerDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReasonerDecision::ExecuteTools(calls) => {
                write!(f, "ExecuteTools({} calls)", calls.len())
            }
            ReasonerDecision::Done(text) => write!(f, "Done({text:?})"),
            ReasonerDecision::StepLimitReached => write!(f, "StepLimitReached"),
            ReasonerDecision::Error(text) => write!(f, "Error({text:?})"),
        }
    }
}

//! Classifies a failed tool-calling turn and retries with an escalating
//! set of corrective strategies before giving up.

use anyhow::Result;
use async_trait::async_trait;

#[cfg(test)]
use std::sync::Arc;

use super::middleware::{LLMRequest, Middleware, Next};
use super::response_parser::parse_tool_calls_from_text;
use crate::harness::context::ContextMessage;
use crate::harness::types::LLMResponse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    EmptyResponse,
    MalformedJson,
    WrongToolName(String),
    MissingArgs,
    ProseWrapped,
    Unknown,
}

pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify a response that produced no usable tool call even though
    /// tools were offered. Returns `None` when the response is actually fine.
    pub fn classify(content: &str, known_tools: &[String]) -> Option<ErrorKind> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Some(ErrorKind::EmptyResponse);
        }

        let parsed = parse_tool_calls_from_text(trimmed, known_tools);
        if !parsed.is_empty() {
            return None;
        }

        let looks_like_json = trimmed.starts_with('{') && trimmed.ends_with('}');
        if looks_like_json {
            if serde_json::from_str::<serde_json::Value>(trimmed).is_err() {
                return Some(ErrorKind::MalformedJson);
            }
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
                if let Some(name) = v.get("tool").and_then(|n| n.as_str()) {
                    if !known_tools.iter().any(|t| t == name) {
                        return Some(ErrorKind::WrongToolName(name.to_string()));
                    }
                    if v.get("args").map(|a| a.is_object()).unwrap_or(false) {
                        return Some(ErrorKind::MissingArgs);
                    }
                }
            }
            return Some(ErrorKind::Unknown);
        }

        if trimmed.contains('{') && trimmed.contains("\"tool\"") {
            return Some(ErrorKind::ProseWrapped);
        }

        Some(ErrorKind::Unknown)
    }

    /// Longest substring/superstring match wins; ties broken by a shared
    /// 4-character prefix, scored below any substring match.
    pub fn suggest_tool(offending: &str, known_tools: &[String]) -> Option<String> {
        let offending_lower = offending.to_lowercase();
        let mut best: Option<(usize, &String)> = None;
        for tool in known_tools {
            let tool_lower = tool.to_lowercase();
            if tool_lower.contains(&offending_lower) || offending_lower.contains(&tool_lower) {
                let score = tool_lower.len().min(offending_lower.len());
                if best.map(|(s, _)| score > s).unwrap_or(true) {
                    best = Some((score, tool));
                }
            }
        }
        if let Some((_, tool)) = best {
            return Some(tool.clone());
        }
        let prefix: String = offending_lower.chars().take(4).collect();
        known_tools
            .iter()
            .find(|t| t.to_lowercase().starts_with(&prefix) && prefix.len() == 4)
            .cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RefinePrompt,
    AddExamples,
    EscalateModel,
}

const DEFAULT_STRATEGIES: [Strategy; 3] =
    [Strategy::RefinePrompt, Strategy::AddExamples, Strategy::EscalateModel];

fn refine_prompt_message(kind: &ErrorKind, known_tools: &[String]) -> String {
    match kind {
        ErrorKind::EmptyResponse => {
            "Your last response was empty. Reply with a tool call or a final answer.".to_string()
        }
        ErrorKind::MalformedJson => {
            "Your last response was not valid JSON. Reply with exactly one well-formed \
            {\"tool\": \"...\", \"args\": {...}} object.".to_string()
        }
        ErrorKind::WrongToolName(name) => {
            let suggestion = ErrorClassifier::suggest_tool(name, known_tools);
            match suggestion {
                Some(s) => format!(
                    "\"{name}\" is not a registered tool. Did you mean \"{s}\"? Registered \
                    tools: {}",
                    known_tools.join(", ")
                ),
                None => format!(
                    "\"{name}\" is not a registered tool. Registered tools: {}",
                    known_tools.join(", ")
                ),
            }
        }
        ErrorKind::MissingArgs => {
            "Your tool call is missing required arguments. Check the tool's parameter list \
            and retry with all required fields.".to_string()
        }
        ErrorKind::ProseWrapped | ErrorKind::Unknown => {
            "Reply with ONLY the JSON tool call, no surrounding prose.".to_string()
        }
    }
}

fn add_examples_message(known_tools: &[String]) -> String {
    let example_tool = known_tools.first().map(|s| s.as_str()).unwrap_or("read_file");
    format!(
        "Example of a correct tool call: {{\"tool\": \"{example_tool}\", \"args\": {{}}}}"
    )
}

/// Wraps the pipeline so a malformed tool-calling turn gets corrected and
/// retried instead of surfacing a bad response to the caller.
pub struct ErrorRecoveryMiddleware {
    pub max_retries: u32,
    pub tool_names: Vec<String>,
    pub strategies: Vec<Strategy>,
    pub on_escalate: Option<Box<dyn Fn(&str) -> String + Send + Sync>>,
}

impl ErrorRecoveryMiddleware {
    pub fn new(tool_names: Vec<String>) -> Self {
        Self {
            max_retries: 3,
            tool_names,
            strategies: DEFAULT_STRATEGIES.to_vec(),
            on_escalate: None,
        }
    }

    fn needs_recovery(&self, response: &LLMResponse) -> Option<ErrorKind> {
        if response.has_tool_calls() || self.tool_names.is_empty() {
            return None;
        }
        ErrorClassifier::classify(&response.content, &self.tool_names)
    }

    fn pick_strategy(&self, attempt: u32, kind: &ErrorKind) -> Strategy {
        if matches!(kind, ErrorKind::WrongToolName(_) | ErrorKind::MissingArgs) && attempt == 0 {
            return Strategy::RefinePrompt;
        }
        if matches!(kind, ErrorKind::EmptyResponse) {
            if self.strategies.contains(&Strategy::EscalateModel) && self.on_escalate.is_some() {
                return Strategy::EscalateModel;
            }
        }
        self.strategies
            .get(attempt as usize)
            .copied()
            .unwrap_or(Strategy::RefinePrompt)
    }

    fn apply_strategy(&self, strategy: Strategy, kind: &ErrorKind, mut request: LLMRequest) -> LLMRequest {
        let correction = match strategy {
            Strategy::RefinePrompt => refine_prompt_message(kind, &self.tool_names),
            Strategy::AddExamples => add_examples_message(&self.tool_names),
            Strategy::EscalateModel => {
                if let Some(on_escalate) = &self.on_escalate {
                    request.model = on_escalate(&request.model);
                }
                "Retrying with a stronger model.".to_string()
            }
        };
        request.messages.push(ContextMessage::new("system", correction));
        request
    }
}

#[async_trait]
impl Middleware for ErrorRecoveryMiddleware {
    async fn process(&self, request: LLMRequest, next: Next) -> Result<LLMResponse> {
        let mut current_request = request;
        let mut attempt = 0;
        loop {
            let response = next(current_request.clone()).await?;

            let Some(kind) = self.needs_recovery(&response) else {
                return Ok(response);
            };
            if matches!(kind, ErrorKind::ProseWrapped) || attempt >= self.max_retries {
                return Ok(response);
            }

            let strategy = self.pick_strategy(attempt, &kind);
            current_request = self.apply_strategy(strategy, &kind, current_request);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_empty_response() {
        let tools = vec!["read_file".to_string()];
        assert_eq!(ErrorClassifier::classify("", &tools), Some(ErrorKind::EmptyResponse));
    }

    #[test]
    fn classifies_malformed_json() {
        let tools = vec!["read_file".to_string()];
        assert_eq!(
            ErrorClassifier::classify("{\"tool\": \"read_file\",}", &tools),
            Some(ErrorKind::MalformedJson)
        );
    }

    #[test]
    fn classifies_wrong_tool_name() {
        let tools = vec!["read_file".to_string()];
        let kind = ErrorClassifier::classify("{\"tool\": \"readfile\", \"args\": {}}", &tools);
        assert_eq!(kind, Some(ErrorKind::WrongToolName("readfile".to_string())));
    }

    #[test]
    fn suggest_tool_prefers_substring_match() {
        let tools = vec!["read_file".to_string(), "write_file".to_string()];
        assert_eq!(
            ErrorClassifier::suggest_tool("readfile", &tools),
            Some("read_file".to_string())
        );
    }

    #[test]
    fn valid_tool_call_needs_no_recovery() {
        let tools = vec!["read_file".to_string()];
        assert_eq!(
            ErrorClassifier::classify("{\"tool\": \"read_file\", \"args\": {\"path\": \"a\"}}", &tools),
            None
        );
    }

    #[tokio::test]
    async fn retries_until_valid_tool_call_then_stops() {
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_for_next = calls.clone();
        let next: Next = Arc::new(move |_req| {
            let calls = calls_for_next.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < 2 {
                    Ok(LLMResponse { content: String::new(), ..Default::default() })
                } else {
                    Ok(LLMResponse {
                        content: "{\"tool\": \"read_file\", \"args\": {}}".to_string(),
                        tool_calls: vec![crate::harness::types::ToolCall {
                            name: "read_file".into(),
                            arguments: serde_json::Map::new(),
                            raw: String::new(),
                        }],
                        ..Default::default()
                    })
                }
            })
        });

        let mw = ErrorRecoveryMiddleware::new(vec!["read_file".to_string()]);
        let request = LLMRequest::new("m", vec![]);
        let response = mw.process(request, next).await.unwrap();
        assert!(response.has_tool_calls());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_for_next = calls.clone();
        let next: Next = Arc::new(move |_req| {
            let calls = calls_for_next.clone();
            Box::pin(async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(LLMResponse { content: String::new(), ..Default::default() })
            })
        });

        let mw = ErrorRecoveryMiddleware::new(vec!["read_file".to_string()]);
        let request = LLMRequest::new("m", vec![]);
        let response = mw.process(request, next).await.unwrap();
        assert!(!response.has_tool_calls());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), mw.max_retries + 1);
    }
}

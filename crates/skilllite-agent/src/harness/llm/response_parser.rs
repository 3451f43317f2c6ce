//! Tool-call extraction from free-form LLM text and the streaming state
//! machine that separates `<think>` blocks, prose, and buffered tool calls.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::harness::types::ToolCall;

/// Split out `<think>...</think>` blocks. Returns (thinking, cleaned).
pub fn extract_thinking(text: &str) -> (String, String) {
    let re = Regex::new(r"(?s)<think>(.*?)</think>").unwrap();
    let thinking: Vec<&str> = re.captures_iter(text).map(|c| c.get(1).unwrap().as_str()).collect();
    let thinking = thinking.join("\n").trim().to_string();
    let cleaned = re.replace_all(text, "").trim().to_string();
    (thinking, cleaned)
}

/// Extract a balanced `{ ... }` object starting at `start` (must be `{`),
/// string- and escape-aware so nested braces inside quoted values don't
/// confuse the depth count.
pub fn extract_balanced_json(text: &str, start: usize) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    if start >= chars.len() || chars[start] != '{' {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for i in start..chars.len() {
        let ch = chars[i];
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(chars[start..=i].iter().collect());
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_fences(raw: &str) -> String {
    let mut cleaned = raw.trim().to_string();
    for prefix in ["```json", "```"] {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest.to_string();
            break;
        }
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest.to_string();
    }
    cleaned.trim().to_string()
}

fn args_from_value(args: Value) -> serde_json::Map<String, Value> {
    match args {
        Value::Object(map) => map,
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => map,
            _ => {
                let mut map = serde_json::Map::new();
                map.insert("prompt".to_string(), Value::String(s));
                map
            }
        },
        _ => serde_json::Map::new(),
    }
}

/// Try to parse one JSON blob as a `{"tool": ..., "args": ...}` call, or
/// the alternate `{"tool_call": {"name"/"tool": ..., "arguments"/"args": ...}}`
/// shape. A single repair pass strips markdown fences before giving up.
fn try_parse_tool_json(raw: &str) -> Option<ToolCall> {
    let data: Value = serde_json::from_str(raw).or_else(|_| {
        let cleaned = strip_fences(raw);
        serde_json::from_str(&cleaned)
    }).ok()?;

    if let (Some(tool), Some(args)) = (data.get("tool"), data.get("args")) {
        let name = tool.as_str()?.to_string();
        return Some(ToolCall { name, arguments: args_from_value(args.clone()), raw: raw.to_string() });
    }
    if let Some(tc) = data.get("tool_call") {
        let name = tc
            .get("name")
            .or_else(|| tc.get("tool"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let args = tc.get("arguments").or_else(|| tc.get("args")).cloned().unwrap_or(Value::Object(Default::default()));
        return Some(ToolCall { name, arguments: args_from_value(args), raw: raw.to_string() });
    }
    None
}

/// Extract tool calls from free-form text: fenced code block, bare
/// `{"tool": ...}`, whole-text JSON, then the alternate `tool_call` shape.
/// Short-circuits on the first strategy that finds candidates.
pub fn parse_tool_calls_from_text(text: &str, _known_tools: &[String]) -> Vec<ToolCall> {
    let mut matches: Vec<String> = Vec::new();

    let fence_re = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap();
    matches.extend(fence_re.captures_iter(text).map(|c| c.get(1).unwrap().as_str().to_string()));

    if matches.is_empty() {
        let bare_re = Regex::new(r#"\{"tool"\s*:"#).unwrap();
        for m in bare_re.find_iter(text) {
            if let Some(obj) = extract_balanced_json(text, m.start()) {
                matches.push(obj);
            }
        }
    }

    if matches.is_empty() {
        let stripped = text.trim();
        if stripped.starts_with('{') && stripped.ends_with('}') {
            matches.push(stripped.to_string());
        }
    }

    if matches.is_empty() {
        let alt_re = Regex::new(r#"\{"tool_call"\s*:"#).unwrap();
        for m in alt_re.find_iter(text) {
            if let Some(obj) = extract_balanced_json(text, m.start()) {
                matches.push(obj);
            }
        }
    }

    // The reasoner expects at most one tool call per step; return only the
    // first candidate that actually parses instead of every match found.
    matches.iter().find_map(|m| try_parse_tool_json(m)).into_iter().collect()
}

/// Schema-aware parser: pre-builds a regex over known tool names so the
/// common case (one well-formed call for a registered tool) short-circuits
/// a full text scan.
pub struct ToolCallParser {
    known_tool_pattern: Option<Regex>,
}

impl ToolCallParser {
    pub fn new(tool_names: &[String]) -> Self {
        let known_tool_pattern = if tool_names.is_empty() {
            None
        } else {
            let escaped: Vec<String> = tool_names.iter().map(|n| regex::escape(n)).collect();
            Regex::new(&format!(r#"\{{\s*"tool"\s*:\s*"({})"#, escaped.join("|"))).ok()
        };
        Self { known_tool_pattern }
    }

    pub fn parse(&self, text: &str, known_tools: &[String]) -> Vec<ToolCall> {
        if let Some(pattern) = &self.known_tool_pattern {
            if let Some(m) = pattern.find(text) {
                let brace_pos = text[..m.end()].rfind('{');
                if let Some(pos) = brace_pos {
                    if let Some(obj) = extract_balanced_json(text, pos) {
                        if let Some(call) = try_parse_tool_json(&obj) {
                            return vec![call];
                        }
                    }
                }
            }
        }
        parse_tool_calls_from_text(text, known_tools)
    }
}

/// Accumulates OpenAI-style streamed `tool_calls` deltas (chunks keyed by
/// `index`, `function.name` on the first chunk, `function.arguments`
/// fragments concatenated across chunks) into finished [`ToolCall`]s.
#[derive(Default)]
pub struct NativeToolCallAccumulator {
    calls: HashMap<u64, (String, String)>,
}

impl NativeToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, delta: &Value) {
        let Some(tc_list) = delta.get("tool_calls").and_then(Value::as_array) else { return };
        for tc in tc_list {
            let idx = tc.get("index").and_then(Value::as_u64).unwrap_or(0);
            let entry = self.calls.entry(idx).or_insert_with(|| (String::new(), String::new()));
            if let Some(func) = tc.get("function") {
                if let Some(name) = func.get("name").and_then(Value::as_str) {
                    entry.0 = name.to_string();
                }
                if let Some(args) = func.get("arguments").and_then(Value::as_str) {
                    entry.1.push_str(args);
                }
            }
        }
    }

    pub fn has_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    pub fn finalize(self) -> Vec<ToolCall> {
        let mut indices: Vec<u64> = self.calls.keys().copied().collect();
        indices.sort_unstable();
        let mut result = Vec::new();
        for idx in indices {
            let (name, raw_args) = &self.calls[&idx];
            if name.is_empty() {
                continue;
            }
            let arguments = if raw_args.is_empty() {
                serde_json::Map::new()
            } else {
                serde_json::from_str::<Value>(raw_args)
                    .ok()
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default()
            };
            let raw = serde_json::json!({"function": {"name": name, "arguments": raw_args}}).to_string();
            result.push(ToolCall { name: name.clone(), arguments, raw });
        }
        result
    }
}

/// One chunk out of [`StreamProcessor::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Thinking(String),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Init,
    Thinking,
    Detecting,
    Text,
    Tool,
}

const FENCE_PREFIXES: [&str; 3] = ["```json", "```\n{", "```{"];
const THINKING_YIELD_INTERVAL: usize = 200;

/// Processes SSE text chunks from a streaming response, separating a
/// leading `<think>` block from the answer and detecting early whether the
/// answer is prose (streamed live) or a tool call (buffered until complete).
pub struct StreamProcessor {
    buffer: String,
    thinking: String,
    content_start: usize,
    displayed_up_to: usize,
    state: StreamState,
    thinking_yielded_at: usize,
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProcessor {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            thinking: String::new(),
            content_start: 0,
            displayed_up_to: 0,
            state: StreamState::Init,
            thinking_yielded_at: 0,
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        let mut changed = true;
        while changed {
            changed = false;
            match self.state {
                StreamState::Init => {
                    let stripped = self.buffer.trim_start();
                    if stripped.starts_with("<think>") {
                        self.state = StreamState::Thinking;
                        changed = true;
                    } else if stripped.chars().count() >= 7 || (!stripped.is_empty() && !stripped.starts_with('<')) {
                        self.content_start = self.buffer.len() - stripped.len();
                        self.displayed_up_to = self.content_start;
                        self.state = StreamState::Detecting;
                        changed = true;
                    }
                }
                StreamState::Thinking => {
                    if let Some(end_idx) = self.buffer.find("</think>") {
                        let think_start = self.buffer.find("<think>").unwrap() + "<think>".len();
                        self.thinking = self.buffer[think_start..end_idx].trim().to_string();
                        self.content_start = end_idx + "</think>".len();
                        self.displayed_up_to = self.content_start;
                        events.push(StreamEvent::Thinking(self.thinking.clone()));
                        self.state = StreamState::Detecting;
                        changed = true;
                    } else if let Some(think_start) = self.buffer.find("<think>") {
                        let partial_len = self.buffer.len() - think_start - "<think>".len();
                        if partial_len.saturating_sub(self.thinking_yielded_at) >= THINKING_YIELD_INTERVAL {
                            self.thinking_yielded_at = partial_len;
                            let snippet = self.buffer[think_start + "<think>".len()..].trim();
                            let last_line: String = snippet.lines().last().unwrap_or("").chars().take(80).collect();
                            events.push(StreamEvent::Thinking(last_line));
                        }
                    }
                }
                StreamState::Detecting => {
                    let content = self.buffer[self.content_start..].trim_start();
                    if content.is_empty() {
                        break;
                    }
                    if content.starts_with('{') || FENCE_PREFIXES.iter().any(|p| content.starts_with(p)) {
                        self.state = StreamState::Tool;
                    } else if content.chars().count() > 8 {
                        self.state = StreamState::Text;
                        changed = true;
                    }
                }
                StreamState::Text => {
                    if self.displayed_up_to < self.buffer.len() {
                        let new = self.buffer[self.displayed_up_to..].to_string();
                        self.displayed_up_to = self.buffer.len();
                        events.push(StreamEvent::Text(new));
                    }
                }
                StreamState::Tool => break,
            }
        }
        events
    }

    /// Call when the stream ends. Returns (thinking, content, tool_calls).
    pub fn finish(mut self, known_tools: &[String]) -> (String, String, Vec<ToolCall>) {
        let mut content = self.buffer[self.content_start..].trim().to_string();

        if self.state == StreamState::Thinking {
            if let Some(think_start) = self.buffer.find("<think>") {
                self.thinking = self.buffer[think_start + "<think>".len()..].trim().to_string();
            }
            content.clear();
        }

        let mut tool_calls = if self.state == StreamState::Tool {
            parse_tool_calls_from_text(&content, known_tools)
        } else {
            Vec::new()
        };

        if tool_calls.is_empty() && !content.is_empty() {
            tool_calls = parse_tool_calls_from_text(&content, known_tools);
        }

        (self.thinking, content, tool_calls)
    }

    /// Text fed in but not yet surfaced via a `Text` event.
    pub fn undisplayed_text(&self) -> String {
        self.buffer[self.displayed_up_to..].trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_thinking_block() {
        let (thinking, cleaned) = extract_thinking("<think>step one</think>the answer");
        assert_eq!(thinking, "step one");
        assert_eq!(cleaned, "the answer");
    }

    #[test]
    fn balanced_json_handles_nested_braces_and_strings() {
        let text = r#"{"tool": "x", "args": {"k": "}v{"}} trailing"#;
        let obj = extract_balanced_json(text, 0).unwrap();
        assert_eq!(obj, r#"{"tool": "x", "args": {"k": "}v{"}}"#);
    }

    #[test]
    fn parses_bare_tool_call() {
        let text = r#"Sure, calling: {"tool": "read_file", "args": {"path": "a.txt"}}"#;
        let calls = parse_tool_calls_from_text(text, &["read_file".to_string()]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
    }

    #[test]
    fn parses_fenced_tool_call() {
        let text = "```json\n{\"tool\": \"shell\", \"args\": {\"command\": \"ls\"}}\n```";
        let calls = parse_tool_calls_from_text(text, &["shell".to_string()]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "shell");
    }

    #[test]
    fn only_the_first_tool_call_is_returned() {
        let text = r#"{"tool": "read_file", "args": {"path": "a.txt"}}
        {"tool": "write_file", "args": {"path": "b.txt", "content": "x"}}"#;
        let calls = parse_tool_calls_from_text(text, &["read_file".to_string(), "write_file".to_string()]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
    }

    #[test]
    fn string_args_with_json_body_are_parsed() {
        let text = r#"{"tool": "shell", "args": "{\"command\": \"ls\"}"}"#;
        let calls = parse_tool_calls_from_text(text, &["shell".to_string()]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments.get("command").unwrap(), "ls");
    }

    #[test]
    fn tool_call_parser_short_circuits_on_known_tool() {
        let parser = ToolCallParser::new(&["read_file".to_string()]);
        let text = r#"{"tool": "read_file", "args": {"path": "a"}}"#;
        let calls = parser.parse(text, &["read_file".to_string()]);
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn native_accumulator_merges_fragmented_arguments() {
        let mut acc = NativeToolCallAccumulator::new();
        acc.feed(&serde_json::json!({"tool_calls": [{"index": 0, "function": {"name": "read_file"}}]}));
        acc.feed(&serde_json::json!({"tool_calls": [{"index": 0, "function": {"arguments": "{\"path\""}}]}));
        acc.feed(&serde_json::json!({"tool_calls": [{"index": 0, "function": {"arguments": ": \"a\"}"}}]}));
        assert!(acc.has_calls());
        let calls = acc.finalize();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments.get("path").unwrap(), "a");
    }

    #[test]
    fn stream_processor_surfaces_thinking_then_text() {
        let mut sp = StreamProcessor::new();
        let mut events = sp.feed("<think>reasoning</think>");
        events.extend(sp.feed("Hello there, how are you"));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Thinking(t) if t == "reasoning")));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Text(_))));
    }

    #[test]
    fn stream_processor_buffers_tool_call_until_finish() {
        let mut sp = StreamProcessor::new();
        let events = sp.feed(r#"{"tool": "read_file", "args": {"path": "a"}}"#);
        assert!(events.is_empty());
        let (_, _, calls) = sp.finish(&["read_file".to_string()]);
        assert_eq!(calls.len(), 1);
    }
}

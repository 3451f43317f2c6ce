//! Layered context assembly: a never-compressed system layer, a plan
//! window, compressible history, and a per-turn working layer.

use regex::Regex;
use serde::Serialize;

/// A single chat-style message as it will be sent to the LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

impl ContextMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

/// `max(1, chars/4)` — the reference's token estimate.
fn estimate_tokens(content: &str) -> usize {
    (content.chars().count() / 4).max(1)
}

fn messages_tokens(messages: &[ContextMessage]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

#[derive(Debug, Clone, Default)]
pub struct SystemLayer {
    pub role_text: String,
    pub tools_description: String,
    pub project_context: String,
}

impl SystemLayer {
    pub fn render(&self) -> ContextMessage {
        let mut parts = vec![self.role_text.clone()];
        if !self.tools_description.is_empty() {
            parts.push(format!("## Available Tools\n{}", self.tools_description));
        }
        if !self.project_context.is_empty() {
            parts.push(format!("## Project Context\n{}", self.project_context));
        }
        ContextMessage::new("system", parts.join("\n\n"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanLayer {
    pub steps: Vec<String>,
    pub current_step: usize,
    pub lookahead: usize,
}

impl PlanLayer {
    pub fn new() -> Self {
        Self { steps: Vec::new(), current_step: 0, lookahead: 2 }
    }

    pub fn render(&self) -> Option<ContextMessage> {
        if self.steps.is_empty() {
            return None;
        }
        let total = self.steps.len();
        let end = (self.current_step + self.lookahead + 1).min(total);
        let mut lines = vec![format!("## Current Plan (step {}/{})", self.current_step + 1, total)];
        for (i, step) in self.steps[self.current_step..end].iter().enumerate() {
            let idx = self.current_step + i;
            let marker = if idx == self.current_step { "→ " } else { "  " };
            lines.push(format!("{marker}{}. {step}", idx + 1));
        }
        Some(ContextMessage::new("system", lines.join("\n")))
    }
}

const TOOL_RESULT_PREFIX: &str = "[Tool Result for ";
const TOOL_ERROR_MARKER: &str = "[Tool Error]";

#[derive(Debug, Clone)]
pub struct HistoryLayer {
    pub messages: Vec<ContextMessage>,
    pub protected_tail: usize,
}

impl Default for HistoryLayer {
    fn default() -> Self {
        Self { messages: Vec::new(), protected_tail: 6 }
    }
}

fn tool_name_from_result_content(content: &str) -> Option<&str> {
    content
        .strip_prefix(TOOL_RESULT_PREFIX)
        .and_then(|rest| rest.split(']').next())
}

fn tool_name_from_call_content(content: &str, re: &Regex) -> Option<String> {
    re.captures(content).map(|c| c[1].to_string())
}

impl HistoryLayer {
    /// Collapse adjacent assistant(tool-call) + user(tool-result) pairs into
    /// `[Tool: <name> → OK|error]`. Status is derived from whether the
    /// result text carries the `[Tool Error]` marker — see DESIGN.md's Open
    /// Question decision for why this diverges from a literal port.
    pub fn compress_l1(&mut self) {
        let tool_name_re = Regex::new(r#""tool"\s*:\s*"([^"]+)""#).unwrap();
        let mut compressed = Vec::with_capacity(self.messages.len());
        let mut i = 0;
        while i < self.messages.len() {
            let current = &self.messages[i];
            let next = self.messages.get(i + 1);
            let is_pair = current.role == "assistant"
                && next.map(|n| n.role == "user" && n.content.starts_with(TOOL_RESULT_PREFIX))
                    .unwrap_or(false);
            if is_pair {
                let next = &self.messages[i + 1];
                let name = tool_name_from_result_content(&next.content)
                    .map(|s| s.to_string())
                    .or_else(|| tool_name_from_call_content(&current.content, &tool_name_re))
                    .unwrap_or_else(|| "unknown".to_string());
                let status = if next.content.contains(TOOL_ERROR_MARKER) { "error" } else { "OK" };
                compressed.push(ContextMessage::new(
                    "system",
                    format!("[Tool: {name} → {status}]"),
                ));
                i += 2;
            } else {
                compressed.push(current.clone());
                i += 1;
            }
        }
        self.messages = compressed;
    }

    /// Merge consecutive L1 summary lines into one `[N tool calls summarized]`
    /// entry. Idempotent: a second call on already-merged history is a no-op.
    pub fn compress_l2(&mut self) {
        let is_l1 = |m: &ContextMessage| m.role == "system" && m.content.starts_with("[Tool: ");
        let mut compressed = Vec::with_capacity(self.messages.len());
        let mut i = 0;
        while i < self.messages.len() {
            if is_l1(&self.messages[i]) {
                let mut run = 1;
                while i + run < self.messages.len() && is_l1(&self.messages[i + run]) {
                    run += 1;
                }
                if run > 1 {
                    compressed.push(ContextMessage::new(
                        "system",
                        format!("[{run} tool calls summarized]"),
                    ));
                } else {
                    compressed.push(self.messages[i].clone());
                }
                i += run;
            } else {
                compressed.push(self.messages[i].clone());
                i += 1;
            }
        }
        self.messages = compressed;
    }

    /// Compress older entries (L1 then L2) until under `budget` tokens or
    /// nothing older than `protected_tail` remains; as a last resort, drop
    /// the oldest compressed entries.
    pub fn compress_to_budget(&mut self, budget: usize) {
        if messages_tokens(&self.messages) <= budget {
            return;
        }
        let split = self.messages.len().saturating_sub(self.protected_tail);
        let mut head: HistoryLayer = HistoryLayer {
            messages: self.messages[..split].to_vec(),
            protected_tail: 0,
        };
        let tail = self.messages[split..].to_vec();

        head.compress_l1();
        if messages_tokens(&head.messages) + messages_tokens(&tail) > budget {
            head.compress_l2();
        }

        self.messages = head.messages;
        self.messages.extend(tail);

        while messages_tokens(&self.messages) > budget && self.messages.len() > self.protected_tail {
            self.messages.remove(0);
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkingLayer {
    pub messages: Vec<ContextMessage>,
    pub max_per_result: usize,
}

impl Default for WorkingLayer {
    fn default() -> Self {
        Self { messages: Vec::new(), max_per_result: 3000 }
    }
}

impl WorkingLayer {
    pub fn add_tool_result(&mut self, name: &str, text: &str) {
        let char_count = text.chars().count();
        let truncated = if char_count > self.max_per_result {
            let half = self.max_per_result / 2;
            let head: String = text.chars().take(half).collect();
            let tail: String = text.chars().skip(char_count - half).collect();
            let omitted = char_count - 2 * half;
            format!("{head}\n[...{omitted} chars truncated...]\n{tail}")
        } else {
            text.to_string()
        };
        self.messages.push(ContextMessage::new(
            "user",
            format!("{TOOL_RESULT_PREFIX}{name}]\n{truncated}"),
        ));
    }

    /// Move the working layer's content into history at the end of a turn.
    pub fn cycle_into(&mut self, history: &mut HistoryLayer) {
        history.messages.append(&mut self.messages);
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub system: SystemLayer,
    pub plan: PlanLayer,
    pub history: HistoryLayer,
    pub working: WorkingLayer,
}

impl AgentContext {
    pub fn add_user_message(&mut self, text: impl Into<String>) {
        self.history.messages.push(ContextMessage::new("user", text));
    }

    pub fn add_assistant_message(&mut self, text: impl Into<String>) {
        self.history.messages.push(ContextMessage::new("assistant", text));
    }

    pub fn add_tool_result(&mut self, name: &str, text: &str) {
        self.working.add_tool_result(name, text);
    }

    /// Move the working layer's content into history at the end of a turn.
    pub fn cycle_working(&mut self) {
        let mut working = std::mem::take(&mut self.working.messages);
        self.history.messages.append(&mut working);
    }

    /// Render the full message list, compressing history as needed to fit
    /// `budget` tokens. The system/plan/working layers are never compressed.
    pub fn to_messages(&mut self, budget: usize) -> Vec<ContextMessage> {
        let system = self.system.render();
        let plan = self.plan.render();
        let fixed_tokens = estimate_tokens(&system.content)
            + plan.as_ref().map(|p| estimate_tokens(&p.content)).unwrap_or(0)
            + messages_tokens(&self.working.messages);
        let history_budget = budget.saturating_sub(fixed_tokens);
        self.history.compress_to_budget(history_budget);

        let mut out = vec![system];
        out.extend(plan);
        out.extend(self.history.messages.clone());
        out.extend(self.working.messages.clone());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_layer_omits_empty_sections() {
        let layer = SystemLayer { role_text: "You are an agent.".into(), ..Default::default() };
        let rendered = layer.render();
        assert_eq!(rendered.content, "You are an agent.");
    }

    #[test]
    fn plan_layer_marks_current_step() {
        let layer = PlanLayer {
            steps: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            current_step: 1,
            lookahead: 2,
        };
        let rendered = layer.render().unwrap();
        assert!(rendered.content.contains("step 2/4"));
        assert!(rendered.content.contains("→ 2. b"));
        assert!(rendered.content.contains("4. d"));
    }

    #[test]
    fn plan_layer_empty_renders_nothing() {
        assert!(PlanLayer::new().render().is_none());
    }

    #[test]
    fn compress_l1_reflects_failure_status() {
        let mut history = HistoryLayer {
            messages: vec![
                ContextMessage::new("assistant", r#"{"tool":"shell","args":{}}"#),
                ContextMessage::new("user", "[Tool Result for shell]\n[Tool Error] boom"),
            ],
            protected_tail: 0,
        };
        history.compress_l1();
        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].content, "[Tool: shell → error]");
    }

    #[test]
    fn compress_l1_reflects_success_status() {
        let mut history = HistoryLayer {
            messages: vec![
                ContextMessage::new("assistant", r#"{"tool":"git_status","args":{}}"#),
                ContextMessage::new("user", "[Tool Result for git_status]\nclean"),
            ],
            protected_tail: 0,
        };
        history.compress_l1();
        assert_eq!(history.messages[0].content, "[Tool: git_status → OK]");
    }

    #[test]
    fn compress_l2_merges_consecutive_summaries() {
        let mut history = HistoryLayer {
            messages: vec![
                ContextMessage::new("system", "[Tool: a → OK]"),
                ContextMessage::new("system", "[Tool: b → OK]"),
                ContextMessage::new("system", "[Tool: c → error]"),
            ],
            protected_tail: 0,
        };
        history.compress_l2();
        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].content, "[3 tool calls summarized]");
    }

    #[test]
    fn compress_l2_is_idempotent() {
        let mut history = HistoryLayer {
            messages: vec![ContextMessage::new("system", "[3 tool calls summarized]")],
            protected_tail: 0,
        };
        let before = history.messages.clone();
        history.compress_l2();
        assert_eq!(history.messages, before);
    }

    #[test]
    fn working_layer_truncates_long_results() {
        let mut working = WorkingLayer { max_per_result: 10, ..Default::default() };
        working.add_tool_result("read_file", &"x".repeat(50));
        assert!(working.messages[0].content.contains("truncated"));
    }
}

//! Tool registration, lookup, schema export, and the smart-truncation
//! post-filter applied to every tool result before it re-enters context.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::harness::types::ToolResult;

use super::base::Tool;

/// Head/tail truncation: keep the first 25% and last 75% of the budget
/// (rounded), with a marker noting how much was dropped in between.
pub fn smart_truncate(text: &str, max_length: usize) -> String {
    if text.chars().count() <= max_length {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    let head_len = max_length / 4;
    let tail_len = max_length - head_len;
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[chars.len() - tail_len..].iter().collect();
    let omitted = chars.len() - max_length;
    format!("{head}\n... [{omitted} chars truncated] ...\n{tail}")
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn list_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.values().cloned().collect()
    }

    /// Execute a tool by name and apply its `max_output` truncation to the
    /// resulting text before returning it.
    pub async fn execute(&self, name: &str, args: &serde_json::Map<String, Value>) -> ToolResult {
        let Some(tool) = self.get(name) else {
            let mut available = self.tool_names();
            available.sort();
            return ToolResult::err(format!(
                "unknown tool: {name}. available tools: {}",
                available.join(", ")
            ));
        };
        let mut result = tool.execute(args).await;
        let max_output = tool.max_output();
        if max_output > 0 {
            result.output = smart_truncate(&result.output, max_output);
        }
        result
    }

    pub fn get_openai_schemas(&self) -> Vec<Value> {
        self.tools.values().map(|t| t.to_openai_schema()).collect()
    }

    pub fn get_prompt_description(&self) -> String {
        self.tools
            .values()
            .map(|t| t.to_prompt_description())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn get_compact_prompt_description(&self) -> String {
        self.tools
            .values()
            .map(|t| t.to_compact_description())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

//! The `Tool` trait every built-in and extension tool implements.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::harness::types::{ToolParameter, ToolResult};

/// Default cap (in characters) applied by [`super::registry::smart_truncate`]
/// when a tool doesn't override it.
pub const DEFAULT_MAX_OUTPUT: usize = 5000;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Vec<ToolParameter>;

    /// Output length cap consumed by the registry's truncation pass.
    fn max_output(&self) -> usize {
        DEFAULT_MAX_OUTPUT
    }

    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult;

    /// OpenAI-style function-calling schema.
    fn to_openai_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in self.parameters() {
            let mut prop = json!({
                "type": p.param_type,
                "description": p.description,
            });
            if let Some(values) = &p.enum_values {
                prop["enum"] = json!(values);
            }
            properties.insert(p.name.clone(), prop);
            if p.required {
                required.push(p.name.clone());
            }
        }
        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description(),
                "parameters": {
                    "type": "object",
                    "properties": Value::Object(properties),
                    "required": required,
                }
            }
        })
    }

    /// Human-readable, multi-line description for a verbose system prompt.
    fn to_prompt_description(&self) -> String {
        let mut lines = vec![format!("### {}", self.name()), self.description().to_string()];
        for p in self.parameters() {
            let req = if p.required { "required" } else { "optional" };
            lines.push(format!("- {} ({}, {}): {}", p.name, p.param_type, req, p.description));
        }
        lines.join("\n")
    }

    /// `name(p1:string, p2:int?)` — the compact one-liner used once the
    /// prompt needs to fit many tools.
    fn to_compact_description(&self) -> String {
        let params: Vec<String> = self
            .parameters()
            .iter()
            .map(|p| {
                if p.required {
                    format!("{}:{}", p.name, p.param_type)
                } else {
                    format!("{}:{}?", p.name, p.param_type)
                }
            })
            .collect();
        format!("{}({})", self.name(), params.join(", "))
    }
}

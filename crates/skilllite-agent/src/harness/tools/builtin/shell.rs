//! Subprocess execution with a sanitized environment — credential-shaped
//! variables never reach the child process.

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::Duration;

use crate::harness::tools::base::Tool;
use crate::harness::types::{ToolParameter, ToolResult};

const SENSITIVE_PREFIXES: &[&str] = &["AWS_", "OPENAI_", "ANTHROPIC_", "GITHUB_", "AZURE_", "GCP_"];
const SENSITIVE_NAMES: &[&str] = &["API_KEY", "SECRET", "TOKEN", "PASSWORD"];

fn is_sensitive(name: &str) -> bool {
    let upper = name.to_uppercase();
    SENSITIVE_PREFIXES.iter().any(|p| upper.starts_with(p))
        || SENSITIVE_NAMES.iter().any(|n| upper == *n || upper.ends_with(&format!("_{n}")))
}

fn build_safe_env() -> Vec<(String, String)> {
    std::env::vars().filter(|(k, _)| !is_sensitive(k)).collect()
}

const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }
    fn description(&self) -> &str {
        "Run a shell command with a sanitized environment (no cloud/API credentials \
        forwarded). Stdout and stderr are combined in the output."
    }
    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter {
                name: "command".into(),
                param_type: "string".into(),
                description: "the command line to run".into(),
                required: true,
                enum_values: None,
            },
            ToolParameter {
                name: "timeout_secs".into(),
                param_type: "int".into(),
                description: "kill the command after this many seconds (default 120)".into(),
                required: false,
                enum_values: None,
            },
            ToolParameter {
                name: "cwd".into(),
                param_type: "string".into(),
                description: "working directory".into(),
                required: false,
                enum_values: None,
            },
        ]
    }
    fn max_output(&self) -> usize {
        8000
    }
    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult {
        let Some(command) = args.get("command").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing required argument: command");
        };
        let timeout_secs = args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let cwd = args.get("cwd").and_then(|v| v.as_str());

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.env_clear();
        cmd.envs(build_safe_env());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("failed to spawn shell: {e}")),
        };

        match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await
        {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !combined.is_empty() {
                        combined.push('\n');
                    }
                    combined.push_str(&stderr);
                }
                if output.status.success() {
                    ToolResult::ok(combined)
                } else {
                    let code = output.status.code().unwrap_or(-1);
                    ToolResult::err_with_output(format!("exit status {code}"), combined)
                }
            }
            Ok(Err(e)) => ToolResult::err(format!("shell command failed: {e}")),
            Err(_) => ToolResult::err(format!("shell command timed out after {timeout_secs}s")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_prefixes_are_detected() {
        assert!(is_sensitive("OPENAI_API_KEY"));
        assert!(is_sensitive("AWS_SECRET_ACCESS_KEY"));
        assert!(is_sensitive("API_KEY"));
        assert!(is_sensitive("DB_PASSWORD"));
        assert!(!is_sensitive("PATH"));
        assert!(!is_sensitive("HOME"));
    }

    #[tokio::test]
    async fn echo_succeeds_and_captures_stdout() {
        let args: serde_json::Map<String, Value> =
            [("command".to_string(), Value::String("echo hi".into()))]
                .into_iter()
                .collect();
        let result = ShellTool.execute(&args).await;
        assert!(result.success);
        assert!(result.output.contains("hi"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_failure() {
        let args: serde_json::Map<String, Value> =
            [("command".to_string(), Value::String("exit 3".into()))]
                .into_iter()
                .collect();
        let result = ShellTool.execute(&args).await;
        assert!(!result.success);
    }
}

//! Thin wrappers over the `git` CLI: status, diff, log, commit, branch.

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::harness::tools::base::Tool;
use crate::harness::types::{ToolParameter, ToolResult};

async fn git(args: &[&str], cwd: Option<&str>) -> ToolResult {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    match cmd.output().await {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            if output.status.success() {
                ToolResult::ok(stdout)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                ToolResult::err_with_output(stderr, stdout)
            }
        }
        Err(e) => ToolResult::err(format!("failed to run git: {e}")),
    }
}

fn cwd_param() -> ToolParameter {
    ToolParameter {
        name: "cwd".into(),
        param_type: "string".into(),
        description: "repository directory (default: current directory)".into(),
        required: false,
        enum_values: None,
    }
}

pub struct GitStatusTool;

#[async_trait]
impl Tool for GitStatusTool {
    fn name(&self) -> &str {
        "git_status"
    }
    fn description(&self) -> &str {
        "Show `git status --porcelain` for the repository."
    }
    fn parameters(&self) -> Vec<ToolParameter> {
        vec![cwd_param()]
    }
    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult {
        let cwd = args.get("cwd").and_then(|v| v.as_str());
        git(&["status", "--porcelain"], cwd).await
    }
}

pub struct GitDiffTool;

#[async_trait]
impl Tool for GitDiffTool {
    fn name(&self) -> &str {
        "git_diff"
    }
    fn description(&self) -> &str {
        "Show the working-tree diff, optionally for one path."
    }
    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            cwd_param(),
            ToolParameter {
                name: "path".into(),
                param_type: "string".into(),
                description: "limit the diff to this path".into(),
                required: false,
                enum_values: None,
            },
        ]
    }
    fn max_output(&self) -> usize {
        8000
    }
    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult {
        let cwd = args.get("cwd").and_then(|v| v.as_str());
        match args.get("path").and_then(|v| v.as_str()) {
            Some(path) => git(&["diff", "--", path], cwd).await,
            None => git(&["diff"], cwd).await,
        }
    }
}

pub struct GitLogTool;

#[async_trait]
impl Tool for GitLogTool {
    fn name(&self) -> &str {
        "git_log"
    }
    fn description(&self) -> &str {
        "Show recent commits, one line each."
    }
    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            cwd_param(),
            ToolParameter {
                name: "limit".into(),
                param_type: "int".into(),
                description: "number of commits to show (default 20)".into(),
                required: false,
                enum_values: None,
            },
        ]
    }
    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult {
        let cwd = args.get("cwd").and_then(|v| v.as_str());
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(20);
        let n = format!("-{limit}");
        git(&["log", "--oneline", &n], cwd).await
    }
}

pub struct GitCommitTool;

#[async_trait]
impl Tool for GitCommitTool {
    fn name(&self) -> &str {
        "git_commit"
    }
    fn description(&self) -> &str {
        "Stage all changes and create a commit with the given message."
    }
    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            cwd_param(),
            ToolParameter {
                name: "message".into(),
                param_type: "string".into(),
                description: "commit message".into(),
                required: true,
                enum_values: None,
            },
        ]
    }
    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult {
        let cwd = args.get("cwd").and_then(|v| v.as_str());
        let Some(message) = args.get("message").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing required argument: message");
        };
        let add = git(&["add", "-A"], cwd).await;
        if !add.success {
            return add;
        }
        git(&["commit", "-m", message], cwd).await
    }
}

pub struct GitBranchTool;

#[async_trait]
impl Tool for GitBranchTool {
    fn name(&self) -> &str {
        "git_branch"
    }
    fn description(&self) -> &str {
        "List branches, or create and switch to a new one when `name` is given."
    }
    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            cwd_param(),
            ToolParameter {
                name: "name".into(),
                param_type: "string".into(),
                description: "create and checkout this branch".into(),
                required: false,
                enum_values: None,
            },
        ]
    }
    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult {
        let cwd = args.get("cwd").and_then(|v| v.as_str());
        match args.get("name").and_then(|v| v.as_str()) {
            Some(name) => git(&["checkout", "-b", name], cwd).await,
            None => git(&["branch"], cwd).await,
        }
    }
}

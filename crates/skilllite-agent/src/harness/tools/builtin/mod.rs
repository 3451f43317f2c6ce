pub mod file_ops;
pub mod git_tools;
pub mod shell;

use std::sync::Arc;

use super::registry::ToolRegistry;

/// The default tool roster every [`crate::harness::orchestrator::Orchestrator`]
/// registers unless the caller opts out.
pub fn register_defaults(registry: &mut ToolRegistry) {
    registry.register(Arc::new(file_ops::ReadFileTool));
    registry.register(Arc::new(file_ops::WriteFileTool));
    registry.register(Arc::new(file_ops::EditFileTool));
    registry.register(Arc::new(file_ops::ListDirectoryTool));
    registry.register(Arc::new(file_ops::SearchFilesTool));
    registry.register(Arc::new(shell::ShellTool));
    registry.register(Arc::new(git_tools::GitStatusTool));
    registry.register(Arc::new(git_tools::GitDiffTool));
    registry.register(Arc::new(git_tools::GitLogTool));
    registry.register(Arc::new(git_tools::GitCommitTool));
    registry.register(Arc::new(git_tools::GitBranchTool));
}

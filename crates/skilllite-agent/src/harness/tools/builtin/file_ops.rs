//! File-system tools: read, write, fuzzy-match edit, list, recursive search.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use crate::harness::tools::base::Tool;
use crate::harness::types::{ToolParameter, ToolResult};

fn param(name: &str, ty: &str, desc: &str, required: bool) -> ToolParameter {
    ToolParameter {
        name: name.into(),
        param_type: ty.into(),
        description: desc.into(),
        required,
        enum_values: None,
    }
}

fn str_arg<'a>(args: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read the contents of a text file."
    }
    fn parameters(&self) -> Vec<ToolParameter> {
        vec![param("path", "string", "path to the file", true)]
    }
    fn max_output(&self) -> usize {
        8000
    }
    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult {
        let Some(path) = str_arg(args, "path") else {
            return ToolResult::err("missing required argument: path");
        };
        match tokio::fs::read_to_string(path).await {
            Ok(content) => ToolResult::ok(content),
            Err(e) => ToolResult::err(format!("failed to read {path}: {e}")),
        }
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Write (overwrite) a file with the given content, creating parent directories."
    }
    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            param("path", "string", "path to the file", true),
            param("content", "string", "full file content", true),
        ]
    }
    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult {
        let (Some(path), Some(content)) = (str_arg(args, "path"), str_arg(args, "content")) else {
            return ToolResult::err("missing required argument: path or content");
        };
        if let Some(parent) = Path::new(path).parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::err(format!("failed to create parent dirs for {path}: {e}"));
            }
        }
        match tokio::fs::write(path, content).await {
            Ok(()) => ToolResult::ok(format!("wrote {} bytes to {path}", content.len())),
            Err(e) => ToolResult::err(format!("failed to write {path}: {e}")),
        }
    }
}

/// Collapse runs of whitespace to a single space, for fuzzy matching.
fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Find all byte-offset matches of `needle` in `haystack` after whitespace
/// normalization of both sides, mapping normalized offsets back to an exact
/// substring of the original text.
fn fuzzy_find(haystack: &str, needle: &str) -> Vec<(usize, usize)> {
    let normalized_needle = normalize_ws(needle);
    if normalized_needle.is_empty() {
        return Vec::new();
    }
    // Exact match first (fast path, and avoids spurious fuzzy hits).
    let mut exact = Vec::new();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        exact.push((abs, abs + needle.len()));
        start = abs + needle.len().max(1);
    }
    if !exact.is_empty() {
        return exact;
    }

    // Fuzzy fallback: slide a normalized window. Built by scanning words.
    let mut matches = Vec::new();
    let words: Vec<&str> = haystack.split_whitespace().collect();
    let needle_words: Vec<&str> = normalized_needle.split(' ').collect();
    if needle_words.is_empty() || words.len() < needle_words.len() {
        return matches;
    }
    // Recover byte offsets of each word in the original haystack.
    let mut offsets = Vec::with_capacity(words.len());
    let mut cursor = 0;
    for w in &words {
        let rel = haystack[cursor..].find(w).unwrap_or(0);
        let abs = cursor + rel;
        offsets.push((abs, abs + w.len()));
        cursor = abs + w.len();
    }
    for i in 0..=(words.len() - needle_words.len()) {
        let window = &words[i..i + needle_words.len()];
        if window == needle_words.as_slice() {
            let (start, _) = offsets[i];
            let (_, end) = offsets[i + needle_words.len() - 1];
            matches.push((start, end));
        }
    }
    matches
}

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }
    fn description(&self) -> &str {
        "Replace one occurrence of `old_text` with `new_text` in a file. Falls back to a \
        whitespace-insensitive match when no exact match exists; rejects ambiguous matches."
    }
    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            param("path", "string", "path to the file", true),
            param("old_text", "string", "text to replace", true),
            param("new_text", "string", "replacement text", true),
        ]
    }
    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult {
        let (Some(path), Some(old_text), Some(new_text)) = (
            str_arg(args, "path"),
            str_arg(args, "old_text"),
            str_arg(args, "new_text"),
        ) else {
            return ToolResult::err("missing required argument: path, old_text, or new_text");
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("failed to read {path}: {e}")),
        };

        let matches = fuzzy_find(&content, old_text);
        match matches.len() {
            0 => ToolResult::err(format!("old_text not found in {path}")),
            1 => {
                let (start, end) = matches[0];
                let mut updated = String::with_capacity(content.len());
                updated.push_str(&content[..start]);
                updated.push_str(new_text);
                updated.push_str(&content[end..]);
                match tokio::fs::write(path, &updated).await {
                    Ok(()) => ToolResult::ok(format!("edited {path}")),
                    Err(e) => ToolResult::err(format!("failed to write {path}: {e}")),
                }
            }
            n => ToolResult::err(format!(
                "old_text matches {n} locations in {path}; make it more specific"
            )),
        }
    }
}

pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_dir"
    }
    fn description(&self) -> &str {
        "List the entries of a directory (non-recursive)."
    }
    fn parameters(&self) -> Vec<ToolParameter> {
        vec![param("path", "string", "directory to list", true)]
    }
    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult {
        let Some(path) = str_arg(args, "path") else {
            return ToolResult::err("missing required argument: path");
        };
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(e) => e,
            Err(e) => return ToolResult::err(format!("failed to list {path}: {e}")),
        };
        let mut names = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let suffix = if entry.path().is_dir() { "/" } else { "" };
                    names.push(format!("{}{suffix}", entry.file_name().to_string_lossy()));
                }
                Ok(None) => break,
                Err(e) => return ToolResult::err(format!("failed to list {path}: {e}")),
            }
        }
        names.sort();
        ToolResult::ok(names.join("\n"))
    }
}

const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    ".venv",
    "venv",
    "__pycache__",
    "dist",
    "build",
    ".cache",
];
const SEARCH_MATCH_CAP: usize = 200;
const SEARCH_FILE_SIZE_CAP: u64 = 1_000_000;

pub struct SearchFilesTool;

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }
    fn description(&self) -> &str {
        "Recursively search files under a directory for a regex pattern, capped at \
        200 matches; skips .git/node_modules/target/etc. and files over 1MB."
    }
    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            param("path", "string", "directory to search", true),
            param("pattern", "string", "regex pattern", true),
        ]
    }
    async fn execute(&self, args: &serde_json::Map<String, Value>) -> ToolResult {
        let (Some(root), Some(pattern)) = (str_arg(args, "path"), str_arg(args, "pattern")) else {
            return ToolResult::err("missing required argument: path or pattern");
        };
        let re = match regex::Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return ToolResult::err(format!("invalid regex: {e}")),
        };
        let root = root.to_string();
        let matches = tokio::task::spawn_blocking(move || search_dir(&root, &re)).await;
        match matches {
            Ok(Ok(lines)) => ToolResult::ok(lines.join("\n")),
            Ok(Err(e)) => ToolResult::err(e),
            Err(e) => ToolResult::err(format!("search task panicked: {e}")),
        }
    }
}

fn search_dir(root: &str, re: &regex::Regex) -> Result<Vec<String>, String> {
    let mut results = Vec::new();
    let mut stack = vec![std::path::PathBuf::from(root)];
    while let Some(dir) = stack.pop() {
        if results.len() >= SEARCH_MATCH_CAP {
            break;
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            if results.len() >= SEARCH_MATCH_CAP {
                break;
            }
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !SKIP_DIRS.contains(&name.as_ref()) {
                    stack.push(path);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                if meta.len() > SEARCH_FILE_SIZE_CAP {
                    continue;
                }
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => continue,
            };
            for (lineno, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    results.push(format!("{}:{}: {}", path.display(), lineno + 1, line.trim()));
                    if results.len() >= SEARCH_MATCH_CAP {
                        break;
                    }
                }
            }
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let args: serde_json::Map<String, Value> = [
            ("path".to_string(), Value::String(path.to_string_lossy().to_string())),
            ("content".to_string(), Value::String("hello world".into())),
        ]
        .into_iter()
        .collect();
        let result = WriteFileTool.execute(&args).await;
        assert!(result.success);

        let read_args: serde_json::Map<String, Value> = [(
            "path".to_string(),
            Value::String(path.to_string_lossy().to_string()),
        )]
        .into_iter()
        .collect();
        let read = ReadFileTool.execute(&read_args).await;
        assert_eq!(read.output, "hello world");
    }

    #[tokio::test]
    async fn edit_exact_match_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, "fn main() {\n    println!(\"hi\");\n}\n").await.unwrap();
        let args: serde_json::Map<String, Value> = [
            ("path".to_string(), Value::String(path.to_string_lossy().to_string())),
            ("old_text".to_string(), Value::String("println!(\"hi\")".into())),
            ("new_text".to_string(), Value::String("println!(\"bye\")".into())),
        ]
        .into_iter()
        .collect();
        let result = EditFileTool.execute(&args).await;
        assert!(result.success);
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("bye"));
    }

    #[tokio::test]
    async fn edit_ambiguous_match_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, "x\nx\n").await.unwrap();
        let args: serde_json::Map<String, Value> = [
            ("path".to_string(), Value::String(path.to_string_lossy().to_string())),
            ("old_text".to_string(), Value::String("x".into())),
            ("new_text".to_string(), Value::String("y".into())),
        ]
        .into_iter()
        .collect();
        let result = EditFileTool.execute(&args).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("matches"));
    }

    #[test]
    fn fuzzy_find_ignores_whitespace_differences() {
        let haystack = "fn main()   {\n  println!(\"hi\");\n}";
        let matches = fuzzy_find(haystack, "fn main() {");
        assert_eq!(matches.len(), 1);
    }
}

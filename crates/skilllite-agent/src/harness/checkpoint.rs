//! Transactional checkpoint engine: stash pre-goal work onto a throwaway
//! branch, snapshot progress as lightweight commits, roll back on test
//! failure, and squash-merge (or discard) at the end of the goal.
//!
//! Every operation shells out to `git`. These are short, local
//! invocations, so this runs synchronously rather than through tokio —
//! callers on the async orchestrator path pay a small, bounded blocking
//! cost per checkpoint rather than threading an executor through here.

use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub commit_hash: String,
    pub description: String,
    pub timestamp: u64,
}

fn git(cwd: &str, args: &[&str]) -> (bool, String, String) {
    match Command::new("git").args(args).current_dir(cwd).output() {
        Ok(out) => (
            out.status.success(),
            String::from_utf8_lossy(&out.stdout).trim().to_string(),
            String::from_utf8_lossy(&out.stderr).trim().to_string(),
        ),
        Err(e) => (false, String::new(), e.to_string()),
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Probe whether `project_root` is a git checkout with a usable `git`
/// binary on `PATH`. Feeds [`CheckpointEngine::new`]'s `has_git` flag.
pub fn detect_git(project_root: &str) -> bool {
    git(project_root, &["rev-parse", "--is-inside-work-tree"]).0
}

/// Manages git-based checkpoints for one autonomous goal's execution.
///
/// Once constructed with `has_git = false`, every method is a no-op that
/// returns a descriptive status string — never an error — for the
/// lifetime of the instance.
pub struct CheckpointEngine {
    cwd: String,
    has_git: bool,
    original_branch: Option<String>,
    work_branch: Option<String>,
    stashed: bool,
    snapshots: Vec<Snapshot>,
    active: bool,
}

impl CheckpointEngine {
    pub fn new(project_root: impl Into<String>, has_git: bool) -> Self {
        Self {
            cwd: project_root.into(),
            has_git,
            original_branch: None,
            work_branch: None,
            stashed: false,
            snapshots: Vec::new(),
            active: false,
        }
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Start a checkpoint session: stash uncommitted work, switch to a
    /// throwaway `harness/goal-<ts>` branch. Call before autonomous work.
    pub fn begin(&mut self) -> String {
        if !self.has_git {
            return "no git".to_string();
        }
        if self.active {
            return "already active".to_string();
        }
        self.active = true;

        let (ok, branch, _) = git(&self.cwd, &["rev-parse", "--abbrev-ref", "HEAD"]);
        self.original_branch = Some(if ok { branch } else { "main".to_string() });

        let (_, status, _) = git(&self.cwd, &["status", "--porcelain"]);
        if !status.is_empty() {
            let (ok, out, _) = git(&self.cwd, &["stash", "push", "-m", "skilllite: pre-goal checkpoint"]);
            if ok && !out.contains("No local changes") {
                self.stashed = true;
            }
        }

        let ts = now_unix();
        let mut work_branch = format!("harness/goal-{ts}");
        let (ok, _, _) = git(&self.cwd, &["checkout", "-b", &work_branch]);
        if !ok {
            work_branch = format!("harness/goal-{ts}-retry");
            git(&self.cwd, &["checkout", "-b", &work_branch]);
        }
        self.work_branch = Some(work_branch.clone());

        let mut parts = Vec::new();
        if self.stashed {
            parts.push("stashed uncommitted changes".to_string());
        }
        parts.push(format!("branch: {work_branch}"));
        parts.join(", ")
    }

    /// Stage and commit all current changes as a lightweight snapshot.
    /// Returns `None` if the session isn't active or there's nothing to
    /// commit.
    pub fn snapshot(&mut self, description: &str) -> Option<Snapshot> {
        if !self.active || !self.has_git {
            return None;
        }
        let (_, status, _) = git(&self.cwd, &["status", "--porcelain"]);
        if status.is_empty() {
            return None;
        }

        git(&self.cwd, &["add", "-A"]);
        let message = format!("harness-snapshot: {description}");
        let (ok, _, _) = git(&self.cwd, &["commit", "-m", &message, "--allow-empty"]);
        if !ok {
            return None;
        }

        let (_, commit_hash, _) = git(&self.cwd, &["rev-parse", "--short", "HEAD"]);
        let snap = Snapshot { commit_hash, description: description.to_string(), timestamp: now_unix() };
        self.snapshots.push(snap.clone());
        Some(snap)
    }

    /// Roll back to `to_snapshot`, or to the latest snapshot (falling back
    /// to pre-goal state) when `None`.
    pub fn rollback(&mut self, to_snapshot: Option<&Snapshot>) -> String {
        if !self.active || !self.has_git {
            return "no active checkpoint".to_string();
        }

        let target = to_snapshot.cloned().or_else(|| self.snapshots.last().cloned());

        if let Some(target) = target {
            let (ok, _, _) = git(&self.cwd, &["reset", "--hard", &target.commit_hash]);
            if ok {
                if let Some(idx) = self.snapshots.iter().position(|s| s.commit_hash == target.commit_hash) {
                    self.snapshots.truncate(idx + 1);
                }
                return format!("rolled back to {}: {}", target.commit_hash, target.description);
            }
            return "rollback failed".to_string();
        }

        let ok = git(&self.cwd, &["reset", "--hard", "HEAD"]).0;
        if ok {
            self.snapshots.clear();
            "rolled back all goal changes".to_string()
        } else {
            "rollback failed".to_string()
        }
    }

    /// End the checkpoint session. `keep_changes` squash-merges the work
    /// branch back into the original branch; otherwise it's discarded.
    pub fn finish(&mut self, keep_changes: bool) -> String {
        if !self.active || !self.has_git {
            self.active = false;
            return "no active checkpoint".to_string();
        }
        self.active = false;
        let mut parts = Vec::new();

        let original = self.original_branch.clone().unwrap_or_else(|| "main".to_string());
        let work_branch = self.work_branch.clone();

        if keep_changes && !self.snapshots.is_empty() {
            let (_, status, _) = git(&self.cwd, &["status", "--porcelain"]);
            if !status.is_empty() {
                git(&self.cwd, &["add", "-A"]);
                git(&self.cwd, &["commit", "-m", "harness-snapshot: uncommitted changes at finish"]);
            }

            let (ok, _, _) = git(&self.cwd, &["checkout", &original]);
            if !ok {
                let (ok, _, stderr2) = git(&self.cwd, &["checkout", "-f", &original]);
                if !ok {
                    parts.push(format!("checkout failed: {}", truncate(&stderr2, 100)));
                    self.cleanup_stash(&mut parts);
                    self.snapshots.clear();
                    self.work_branch = None;
                    return parts.join(", ");
                }
            }

            if let Some(work_branch) = &work_branch {
                let (ok, _, stderr) = git(&self.cwd, &["merge", "--squash", work_branch]);
                if ok {
                    let (_, status, _) = git(&self.cwd, &["status", "--porcelain"]);
                    if !status.is_empty() {
                        parts.push(format!("merged {} snapshots", self.snapshots.len()));
                    } else {
                        parts.push("no net changes to merge".to_string());
                    }
                } else {
                    parts.push(format!("merge conflict: {}", truncate(&stderr, 100)));
                }
                git(&self.cwd, &["branch", "-D", work_branch]);
            }
        } else if let Some(work_branch) = &work_branch {
            git(&self.cwd, &["checkout", "-f", &original]);
            git(&self.cwd, &["branch", "-D", work_branch]);
            parts.push("discarded goal changes".to_string());
        }

        self.cleanup_stash(&mut parts);
        self.snapshots.clear();
        self.work_branch = None;
        if parts.is_empty() { "clean finish".to_string() } else { parts.join(", ") }
    }

    fn cleanup_stash(&mut self, parts: &mut Vec<String>) {
        if self.stashed {
            let (ok, _, stderr) = git(&self.cwd, &["stash", "pop"]);
            if ok {
                parts.push("restored stashed changes".to_string());
            } else {
                parts.push(format!("stash pop failed: {}", truncate(&stderr, 80)));
            }
            self.stashed = false;
        }
    }

    /// Summary of all changes since the goal started (`git diff --stat`
    /// against the parent of the first snapshot).
    pub fn diff_since_start(&self) -> String {
        if !self.active || !self.has_git || self.snapshots.is_empty() {
            return String::new();
        }
        let range = format!("HEAD~{}", self.snapshots.len());
        let (ok, out, _) = git(&self.cwd, &["diff", "--stat", &range, "HEAD"]);
        if ok { out } else { String::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(tmp: &std::path::Path) -> String {
        let cwd = tmp.to_string_lossy().to_string();
        git(&cwd, &["init"]);
        git(&cwd, &["config", "user.email", "t@example.com"]);
        git(&cwd, &["config", "user.name", "tester"]);
        std::fs::write(tmp.join("a.txt"), "one").unwrap();
        git(&cwd, &["add", "-A"]);
        git(&cwd, &["commit", "-m", "initial"]);
        cwd
    }

    #[test]
    fn begin_on_non_git_directory_is_a_noop() {
        let mut engine = CheckpointEngine::new("/tmp", false);
        assert_eq!(engine.begin(), "no git");
        assert!(!engine.active());
        assert!(engine.snapshot("x").is_none());
        assert_eq!(engine.finish(true), "no active checkpoint");
    }

    #[test]
    fn double_begin_reports_already_active() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = init_repo(tmp.path());

        let mut engine = CheckpointEngine::new(&cwd, true);
        engine.begin();
        assert!(engine.active());
        assert_eq!(engine.begin(), "already active");
    }

    #[test]
    fn snapshot_returns_none_with_no_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = init_repo(tmp.path());

        let mut engine = CheckpointEngine::new(&cwd, true);
        engine.begin();
        assert!(engine.snapshot("no-op").is_none());
    }

    #[test]
    fn snapshot_and_finish_keep_merges_work_back() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = init_repo(tmp.path());

        let mut engine = CheckpointEngine::new(&cwd, true);
        engine.begin();
        std::fs::write(tmp.path().join("a.txt"), "two").unwrap();
        let snap = engine.snapshot("edit a.txt");
        assert!(snap.is_some());
        assert_eq!(engine.snapshots().len(), 1);

        let result = engine.finish(true);
        assert!(result.contains("merged") || result.contains("no net changes"), "{result}");
        assert!(!engine.active());

        let content = std::fs::read_to_string(tmp.path().join("a.txt")).unwrap();
        assert_eq!(content, "two");
    }

    #[test]
    fn finish_discard_restores_original_state() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = init_repo(tmp.path());

        let mut engine = CheckpointEngine::new(&cwd, true);
        engine.begin();
        std::fs::write(tmp.path().join("a.txt"), "scratch").unwrap();
        engine.snapshot("scratch edit");

        let result = engine.finish(false);
        assert_eq!(result, "discarded goal changes");

        let content = std::fs::read_to_string(tmp.path().join("a.txt")).unwrap();
        assert_eq!(content, "one");
    }

    #[test]
    fn rollback_without_snapshot_restores_pre_goal_state() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = init_repo(tmp.path());

        let mut engine = CheckpointEngine::new(&cwd, true);
        engine.begin();
        std::fs::write(tmp.path().join("a.txt"), "bad edit").unwrap();
        engine.snapshot("bad edit");

        let result = engine.rollback(None);
        assert!(result.contains("rolled back"));
        let content = std::fs::read_to_string(tmp.path().join("a.txt")).unwrap();
        assert_eq!(content, "one");
    }
}

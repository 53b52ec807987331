//! Git Workspace Manager (C3) — isolated worktrees on named branches, and
//! merging completed branches into the integration branch.
//!
//! Shells out to `git` directly, in the style of the single-issue worktree
//! bridge this grew out of; unlike that bridge, merges operate over a whole
//! level at once and never abort the run on failure (§7: workspace errors
//! surface as `MergeResult` entries, never a raw error out of the run).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::dag::issue::Issue;
use crate::dag::state::{BranchMergeStatus, GitTracking, MergeResult};

use super::error::{GitWorkspaceError, WorkspaceResult};

const RETRY_BASE_DELAY_MS: u64 = 200;

/// Info about an active worktree, as reported by `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

pub struct GitWorkspaceManager {
    repo_root: PathBuf,
    worktree_base: PathBuf,
}

impl GitWorkspaceManager {
    pub fn new(repo_root: impl AsRef<Path>, worktree_base: impl AsRef<Path>) -> WorkspaceResult<Self> {
        let repo_root = repo_root.as_ref().to_path_buf();
        let check = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_root)
            .output()
            .map_err(|e| GitWorkspaceError::git("rev-parse", e.to_string()))?;
        if !check.status.success() {
            return Err(GitWorkspaceError::NotARepo(repo_root.display().to_string()));
        }

        let worktree_base = worktree_base.as_ref().to_path_buf();
        std::fs::create_dir_all(&worktree_base)?;

        Ok(Self {
            repo_root,
            worktree_base,
        })
    }

    fn run_in(&self, dir: &Path, args: &[&str]) -> WorkspaceResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| GitWorkspaceError::git(args.join(" "), e.to_string()))?;
        if !output.status.success() {
            // `git merge` writes "CONFLICT (...)" to stdout, not stderr, so
            // conflict detection needs both streams.
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = if stdout.trim().is_empty() {
                stderr.to_string()
            } else {
                format!("{stderr}{stdout}")
            };
            return Err(GitWorkspaceError::git(args.join(" "), message));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run(&self, args: &[&str]) -> WorkspaceResult<String> {
        self.run_in(&self.repo_root, args)
    }

    fn run_with_retry(&self, args: &[&str], max_retries: u32) -> WorkspaceResult<String> {
        let mut last_error = None;
        for attempt in 0..=max_retries {
            match self.run(args) {
                Ok(out) => return Ok(out),
                Err(e) => {
                    if e.is_retryable() && attempt < max_retries {
                        std::thread::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS * (1 << attempt)));
                        last_error = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| GitWorkspaceError::git("retry", "max retries exceeded")))
    }

    /// Create the long-lived integration branch from `base_ref`. Failure here
    /// is non-fatal per §4.2 — callers should fall back to a degraded mode
    /// (no merge/PR semantics) rather than abort the run.
    pub fn init_integration(&self, base_ref: &str) -> WorkspaceResult<GitTracking> {
        let original_branch = self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let initial_commit_sha = self.run(&["rev-parse", base_ref])?;
        let integration_branch = format!("orchestrator/integration-{}", &initial_commit_sha[..8.min(initial_commit_sha.len())]);

        self.run(&["checkout", "-b", &integration_branch, base_ref])?;
        self.run(&["checkout", &original_branch])?;

        Ok(GitTracking {
            integration_branch,
            original_branch,
            initial_commit_sha,
            worktree_root: self.worktree_base.display().to_string(),
            level_shas: Vec::new(),
        })
    }

    pub fn worktree_path(&self, issue: &Issue) -> PathBuf {
        self.worktree_base.join(format!("{:02}-{}", issue.sequence_number, issue.slug()))
    }

    /// Create a detached working tree for `issue` on a fresh branch off the
    /// integration branch's current tip (§4.2).
    pub fn make_worktree(&self, issue: &Issue, integration_branch: &str) -> WorkspaceResult<(PathBuf, String)> {
        let branch = issue.default_branch_name();
        let path = self.worktree_path(issue);

        if path.exists() {
            return Err(GitWorkspaceError::WorktreeExists {
                issue: issue.name.clone(),
                path: path.display().to_string(),
            });
        }

        self.run_with_retry(
            &[
                "worktree",
                "add",
                "-b",
                &branch,
                &path.display().to_string(),
                integration_branch,
            ],
            2,
        )?;

        Ok((path, branch))
    }

    /// Merge every branch in `branches` (sequence order) into
    /// `integration_branch`. Each merge is retried once on transient failure
    /// before being declared `Failed`. Never returns `Err` for a merge
    /// conflict — that is a per-branch `Failed` entry, not a run abort.
    pub fn merge_level(&self, level_index: usize, branches: &[(String, String)], integration_branch: &str) -> MergeResult {
        let mut statuses = std::collections::BTreeMap::new();
        let mut needs_integration_tests = false;

        for (issue_name, branch) in branches {
            let status = self.merge_one(branch, integration_branch);
            if matches!(status, BranchMergeStatus::ConflictResolved { .. }) {
                needs_integration_tests = true;
            }
            statuses.insert(issue_name.clone(), status);
        }

        MergeResult {
            level_index,
            branch_statuses: statuses,
            needs_integration_tests,
        }
    }

    fn merge_one(&self, branch: &str, integration_branch: &str) -> BranchMergeStatus {
        let checkout = self.run(&["checkout", integration_branch]);
        if let Err(e) = checkout {
            return BranchMergeStatus::Failed {
                reason: format!("could not checkout {integration_branch}: {e}"),
            };
        }

        let msg = format!("merge {branch} into {integration_branch}");
        let attempt = self.run_with_retry(&["merge", "--no-ff", branch, "-m", &msg], 1);

        match attempt {
            Ok(_) => match self.run(&["rev-parse", integration_branch]) {
                Ok(sha) => BranchMergeStatus::Merged { sha },
                Err(e) => BranchMergeStatus::Failed {
                    reason: format!("merged but could not resolve SHA: {e}"),
                },
            },
            Err(e) => {
                let is_conflict = e.to_string().to_lowercase().contains("conflict");
                // Abort any partial merge state before declaring failure or
                // retrying so the next attempt starts from a clean tree.
                let _ = self.run(&["merge", "--abort"]);
                if is_conflict {
                    self.resolve_conflict(branch, integration_branch, &msg, e.to_string())
                } else {
                    BranchMergeStatus::Failed { reason: e.to_string() }
                }
            }
        }
    }

    /// §4.2 conflict-resolution path: a content conflict (as opposed to a
    /// transient git failure, which never reaches here) is retried once
    /// favoring the issue branch's side of every conflicting hunk, since
    /// that side just passed the per-issue verifier gate. The result is
    /// unverified against the rest of the level, so the caller runs the
    /// integration-test gate before trusting it.
    fn resolve_conflict(&self, branch: &str, integration_branch: &str, msg: &str, original_reason: String) -> BranchMergeStatus {
        let retry = self.run(&["merge", "--no-ff", "-X", "theirs", branch, "-m", msg]);
        match retry {
            Ok(_) => match self.run(&["rev-parse", integration_branch]) {
                Ok(sha) => BranchMergeStatus::ConflictResolved {
                    sha,
                    strategy: "theirs".to_string(),
                },
                Err(e) => {
                    let _ = self.run(&["merge", "--abort"]);
                    BranchMergeStatus::Failed {
                        reason: format!("conflict auto-resolved but could not resolve SHA: {e}"),
                    }
                }
            },
            Err(e) => {
                let _ = self.run(&["merge", "--abort"]);
                BranchMergeStatus::Failed {
                    reason: format!("conflict could not be auto-resolved ({original_reason}); retry failed: {e}"),
                }
            }
        }
    }

    /// Remove working directories for the given issues; optionally delete
    /// their branches.
    pub fn cleanup_worktrees(&self, issues: &[Issue], retain_branches: bool) -> WorkspaceResult<()> {
        for issue in issues {
            let path = self.worktree_path(issue);
            if path.exists() {
                let remove = Command::new("git")
                    .args(["worktree", "remove", "--force", &path.display().to_string()])
                    .current_dir(&self.repo_root)
                    .output()
                    .map_err(|e| GitWorkspaceError::git("worktree remove", e.to_string()))?;
                if !remove.status.success() {
                    tracing::warn!(
                        issue = %issue.name,
                        stderr = %String::from_utf8_lossy(&remove.stderr),
                        "worktree remove warning"
                    );
                }
            }
            if !retain_branches {
                let branch = issue.branch_name.clone().unwrap_or_else(|| issue.default_branch_name());
                let del = Command::new("git")
                    .args(["branch", "-D", &branch])
                    .current_dir(&self.repo_root)
                    .output()
                    .map_err(|e| GitWorkspaceError::git("branch -D", e.to_string()))?;
                if !del.status.success() {
                    tracing::warn!(
                        issue = %issue.name,
                        branch,
                        stderr = %String::from_utf8_lossy(&del.stderr),
                        "branch delete warning"
                    );
                }
            }
        }
        Ok(())
    }

    /// Checkout `branch` in the main repo working copy. Used by the
    /// integration-test gate to inspect the merged state of a level.
    pub fn checkout_branch(&self, branch: &str) -> WorkspaceResult<()> {
        self.run(&["checkout", branch])?;
        Ok(())
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn list_worktrees(&self) -> WorkspaceResult<Vec<WorktreeInfo>> {
        let out = self.run(&["worktree", "list", "--porcelain"])?;
        let mut infos = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch: Option<String> = None;

        for line in out.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                if let (Some(path), Some(branch)) = (current_path.take(), current_branch.take()) {
                    infos.push(WorktreeInfo { path, branch });
                }
                current_path = Some(PathBuf::from(p));
            } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
                current_branch = Some(b.to_string());
            }
        }
        if let (Some(path), Some(branch)) = (current_path, current_branch) {
            infos.push(WorktreeInfo { path, branch });
        }
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().unwrap();
        }
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        Command::new("git").args(["commit", "-m", "init"]).current_dir(dir).output().unwrap();
    }

    #[test]
    fn init_integration_creates_branch_and_returns_tracking() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let wt_base = tempfile::tempdir().unwrap();
        let mgr = GitWorkspaceManager::new(repo.path(), wt_base.path()).unwrap();

        let tracking = mgr.init_integration("main").unwrap();
        assert_eq!(tracking.original_branch, "main");
        assert!(tracking.integration_branch.starts_with("orchestrator/integration-"));
    }

    #[test]
    fn make_worktree_then_merge_level_succeeds() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let wt_base = tempfile::tempdir().unwrap();
        let mgr = GitWorkspaceManager::new(repo.path(), wt_base.path()).unwrap();
        let tracking = mgr.init_integration("main").unwrap();

        let issue = Issue::new("add-feature", "Add feature", 1);
        let (path, branch) = mgr.make_worktree(&issue, &tracking.integration_branch).unwrap();
        assert!(path.exists());

        std::fs::write(path.join("feature.txt"), "ok").unwrap();
        Command::new("git").args(["add", "."]).current_dir(&path).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "feature work"])
            .current_dir(&path)
            .output()
            .unwrap();

        let result = mgr.merge_level(0, &[(issue.name.clone(), branch)], &tracking.integration_branch);
        assert!(result.all_merged());
        assert!(!result.needs_integration_tests);
    }

    #[test]
    fn merge_conflict_is_auto_resolved_and_flags_integration_tests() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let wt_base = tempfile::tempdir().unwrap();
        let mgr = GitWorkspaceManager::new(repo.path(), wt_base.path()).unwrap();
        let tracking = mgr.init_integration("main").unwrap();

        // Conflicting edit directly on the integration branch.
        Command::new("git")
            .args(["checkout", &tracking.integration_branch])
            .current_dir(repo.path())
            .output()
            .unwrap();
        std::fs::write(repo.path().join("README.md"), "integration edit").unwrap();
        Command::new("git").args(["add", "."]).current_dir(repo.path()).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "integration edit"])
            .current_dir(repo.path())
            .output()
            .unwrap();
        Command::new("git").args(["checkout", "main"]).current_dir(repo.path()).output().unwrap();

        let issue = Issue::new("conflict", "Conflicting change", 1);
        let (path, branch) = mgr.make_worktree(&issue, "main").unwrap();
        std::fs::write(path.join("README.md"), "worktree edit").unwrap();
        Command::new("git").args(["add", "."]).current_dir(&path).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "worktree edit"])
            .current_dir(&path)
            .output()
            .unwrap();

        let result = mgr.merge_level(0, &[(issue.name.clone(), branch)], &tracking.integration_branch);
        assert!(result.all_merged());
        assert!(result.needs_integration_tests);
        match result.branch_statuses.get("conflict") {
            Some(BranchMergeStatus::ConflictResolved { strategy, .. }) => assert_eq!(strategy, "theirs"),
            other => panic!("expected ConflictResolved, got {other:?}"),
        }

        let merged = std::fs::read_to_string(repo.path().join("README.md")).unwrap();
        assert_eq!(merged, "worktree edit");
    }
}

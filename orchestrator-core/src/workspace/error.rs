//! Errors for the Git Workspace Manager (C3).

use thiserror::Error;

pub type WorkspaceResult<T> = Result<T, GitWorkspaceError>;

#[derive(Debug, Error)]
pub enum GitWorkspaceError {
    #[error("git {operation} failed: {message}")]
    GitFailed { operation: String, message: String },

    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error("worktree already exists for {issue}: {path}")]
    WorktreeExists { issue: String, path: String },

    #[error("merge of branch {branch} failed: {reason}")]
    MergeFailed { branch: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitWorkspaceError {
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::GitFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Mirrors `HarnessError::is_retryable` — lock/timeout/network failures
    /// are transient; everything else (conflicts, missing refs) is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::GitFailed { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("lock")
                    || lower.contains("timeout")
                    || lower.contains("connection")
                    || lower.contains("network")
                    || lower.contains("could not lock")
                    || lower.contains("another git process")
            }
            _ => false,
        }
    }
}

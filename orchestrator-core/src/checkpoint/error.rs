//! Errors for the Artifact & Checkpoint Store (C2).

use std::path::PathBuf;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkpoint not found at {0}")]
    NotFound(PathBuf),

    #[error("checkpoint at {path} is corrupted: {message}")]
    Corrupted { path: PathBuf, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

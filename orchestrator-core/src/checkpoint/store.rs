//! Artifact & Checkpoint Store (C2) — durable storage of plan artifacts,
//! per-issue iteration traces, and the serialized `DAGState` (§4.3).
//!
//! Layout relative to an artifacts root:
//! - `plan/` — PRD, architecture, per-issue specs, rationale.
//! - `execution/checkpoint.json` — serialized `DAGState`.
//! - `execution/iterations/<issue>/<iter>.json` — per-iteration record.
//! - `verification/` — criterion-by-criterion results.
//!
//! Writes are atomic: write to a sibling temp path, fsync, rename. A
//! corrupted or zero-size checkpoint is treated on load as "no checkpoint"
//! rather than an error, matching `FeatureRegistry::load_with_recovery`'s
//! fail-open recovery posture.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::dag::state::{DAGState, DAG_STATE_SCHEMA_VERSION};

use super::error::{StoreError, StoreResult};

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(artifacts_root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = artifacts_root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("plan"))?;
        std::fs::create_dir_all(root.join("execution").join("iterations"))?;
        std::fs::create_dir_all(root.join("verification"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.root.join("execution").join("checkpoint.json")
    }

    /// Write `value` to `path` atomically: write to a sibling `.tmp` path,
    /// fsync the file, then rename over the destination and fsync the
    /// containing directory so the rename itself is durable.
    fn write_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
        let tmp_path = path.with_extension(
            path.extension()
                .map(|e| format!("{}.tmp", e.to_string_lossy()))
                .unwrap_or_else(|| "tmp".to_string()),
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_vec_pretty(value)?;
        {
            let file = File::create(&tmp_path)?;
            use std::io::Write;
            let mut file = file;
            file.write_all(&content)?;
            file.sync_all()?;
        }

        std::fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }

    /// Load a JSON value from `path`, treating a missing file, a zero-size
    /// file, or malformed JSON as "not present" rather than an error.
    fn read_optional<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let metadata = std::fs::metadata(path)?;
        if metadata.len() == 0 {
            tracing::warn!(path = %path.display(), "zero-size file, treating as absent");
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupted file, treating as absent");
                Ok(None)
            }
        }
    }

    /// Persist `state` atomically (§4.3). Bumps nothing — caller is expected
    /// to have already incremented `state.version` via its mutating methods.
    pub fn write_checkpoint(&self, state: &DAGState) -> StoreResult<()> {
        Self::write_atomic(&self.checkpoint_path(), state)
    }

    /// Load the checkpoint, if any. A schema-version mismatch or corruption
    /// is treated as "no checkpoint" (§4.3) rather than surfaced as an error.
    pub fn load_checkpoint(&self) -> StoreResult<Option<DAGState>> {
        let Some(state): Option<DAGState> = Self::read_optional(&self.checkpoint_path())? else {
            return Ok(None);
        };
        if state.schema_version != DAG_STATE_SCHEMA_VERSION {
            tracing::warn!(
                found = state.schema_version,
                expected = DAG_STATE_SCHEMA_VERSION,
                "checkpoint schema mismatch, treating as no checkpoint"
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    pub fn write_plan_artifact<T: Serialize>(&self, name: &str, value: &T) -> StoreResult<()> {
        Self::write_atomic(&self.root.join("plan").join(format!("{name}.json")), value)
    }

    pub fn read_plan_artifact<T: DeserializeOwned>(&self, name: &str) -> StoreResult<Option<T>> {
        Self::read_optional(&self.root.join("plan").join(format!("{name}.json")))
    }

    /// Per-iteration record under `execution/iterations/<issue>/<iter>.json`.
    pub fn write_iteration_record<T: Serialize>(&self, issue_name: &str, iteration: u32, value: &T) -> StoreResult<()> {
        let dir = self.root.join("execution").join("iterations").join(issue_name);
        std::fs::create_dir_all(&dir)?;
        Self::write_atomic(&dir.join(format!("{iteration}.json")), value)
    }

    pub fn read_iteration_records<T: DeserializeOwned>(&self, issue_name: &str) -> StoreResult<Vec<T>> {
        let dir = self.root.join("execution").join("iterations").join(issue_name);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<(u32, PathBuf)> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                let stem = path.file_stem()?.to_str()?.to_string();
                let iter: u32 = stem.parse().ok()?;
                Some((iter, path))
            })
            .collect();
        entries.sort_by_key(|(iter, _)| *iter);

        let mut records = Vec::with_capacity(entries.len());
        for (_, path) in entries {
            if let Some(record) = Self::read_optional(&path)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn write_verification_result<T: Serialize>(&self, criterion_id: &str, value: &T) -> StoreResult<()> {
        Self::write_atomic(&self.root.join("verification").join(format!("{criterion_id}.json")), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::plan::PlanResult;
    use crate::dag::state::GitTracking;

    fn tracking() -> GitTracking {
        GitTracking {
            integration_branch: "integration".into(),
            original_branch: "main".into(),
            initial_commit_sha: "sha".into(),
            worktree_root: "/tmp/wt".into(),
            level_shas: Vec::new(),
        }
    }

    #[test]
    fn roundtrip_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let plan = PlanResult::empty("goal");
        let state = DAGState::new("/repo", dir.path().display().to_string(), tracking(), &plan);

        store.write_checkpoint(&state).unwrap();
        let loaded = store.load_checkpoint().unwrap().expect("checkpoint present");
        assert_eq!(loaded.repo_path, state.repo_path);
        assert_eq!(loaded.version, state.version);
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        assert!(store.load_checkpoint().unwrap().is_none());
    }

    #[test]
    fn zero_size_checkpoint_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let path = dir.path().join("execution").join("checkpoint.json");
        std::fs::write(&path, b"").unwrap();
        assert!(store.load_checkpoint().unwrap().is_none());
    }

    #[test]
    fn corrupted_checkpoint_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let path = dir.path().join("execution").join("checkpoint.json");
        std::fs::write(&path, b"{not valid json").unwrap();
        assert!(store.load_checkpoint().unwrap().is_none());
    }

    #[test]
    fn schema_mismatch_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let plan = PlanResult::empty("goal");
        let mut state = DAGState::new("/repo", dir.path().display().to_string(), tracking(), &plan);
        state.schema_version = 999;
        store.write_checkpoint(&state).unwrap();
        assert!(store.load_checkpoint().unwrap().is_none());
    }

    #[test]
    fn iteration_records_roundtrip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        store.write_iteration_record("issue-a", 1, &"first").unwrap();
        store.write_iteration_record("issue-a", 2, &"second").unwrap();
        let records: Vec<String> = store.read_iteration_records("issue-a").unwrap();
        assert_eq!(records, vec!["first".to_string(), "second".to_string()]);
    }
}

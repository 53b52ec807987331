//! Shared Memory (C10, optional) — fixed-schema key/value store injected
//! into later agents' context.
//!
//! Writes happen synchronously at well-known lifecycle points (§4.9); reads
//! are plain key lookups, no retrieval heuristics. Disabled by default
//! (`enable_learning` in `RunConfig`) — callers that don't opt in never pay
//! for it.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

const FAILURE_PATTERNS_CAP: usize = 10;
const BUG_PATTERNS_CAP: usize = 20;

/// One observed inner-loop failure, recorded for later coders/advisors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePattern {
    pub issue_name: String,
    pub error_category: String,
    pub summary: String,
}

/// Continuously refreshed health snapshot read by advisors/replanner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildHealth {
    pub levels_completed: usize,
    pub issues_completed: usize,
    pub issues_failed: usize,
    pub last_gate_summary: String,
}

/// Fixed-schema store per §4.9's table. One instance per run.
#[derive(Debug, Default)]
pub struct SharedMemory {
    codebase_conventions: Option<String>,
    failure_patterns: VecDeque<FailurePattern>,
    bug_patterns: VecDeque<FailurePattern>,
    interfaces: std::collections::BTreeMap<String, String>,
    build_health: BuildHealth,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Written by the first COMPLETED coder only; later calls are no-ops so
    /// the earliest-established convention wins.
    pub fn record_conventions_if_absent(&mut self, conventions: impl Into<String>) {
        if self.codebase_conventions.is_none() {
            self.codebase_conventions = Some(conventions.into());
        }
    }

    pub fn codebase_conventions(&self) -> Option<&str> {
        self.codebase_conventions.as_deref()
    }

    /// Record a failure, evicting the oldest entry once the FIFO cap is hit.
    pub fn record_failure(&mut self, pattern: FailurePattern) {
        push_capped(&mut self.failure_patterns, pattern, FAILURE_PATTERNS_CAP);
    }

    pub fn failure_patterns(&self) -> impl Iterator<Item = &FailurePattern> {
        self.failure_patterns.iter()
    }

    pub fn record_bug_pattern(&mut self, pattern: FailurePattern) {
        push_capped(&mut self.bug_patterns, pattern, BUG_PATTERNS_CAP);
    }

    pub fn bug_patterns(&self) -> impl Iterator<Item = &FailurePattern> {
        self.bug_patterns.iter()
    }

    /// Written on COMPLETED/COMPLETED_WITH_DEBT; read by every dependent's coder.
    pub fn record_interface(&mut self, issue_name: impl Into<String>, export_summary: impl Into<String>) {
        self.interfaces.insert(issue_name.into(), export_summary.into());
    }

    pub fn interface_for(&self, issue_name: &str) -> Option<&str> {
        self.interfaces.get(issue_name).map(String::as_str)
    }

    pub fn update_build_health(&mut self, f: impl FnOnce(&mut BuildHealth)) {
        f(&mut self.build_health);
    }

    pub fn build_health(&self) -> &BuildHealth {
        &self.build_health
    }
}

fn push_capped<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    queue.push_back(item);
    while queue.len() > cap {
        queue.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_conventions_write_wins() {
        let mut mem = SharedMemory::new();
        mem.record_conventions_if_absent("use thiserror");
        mem.record_conventions_if_absent("use anyhow");
        assert_eq!(mem.codebase_conventions(), Some("use thiserror"));
    }

    #[test]
    fn failure_patterns_are_fifo_capped() {
        let mut mem = SharedMemory::new();
        for i in 0..(FAILURE_PATTERNS_CAP + 3) {
            mem.record_failure(FailurePattern {
                issue_name: format!("issue-{i}"),
                error_category: "other".into(),
                summary: String::new(),
            });
        }
        assert_eq!(mem.failure_patterns().count(), FAILURE_PATTERNS_CAP);
        assert_eq!(mem.failure_patterns().next().unwrap().issue_name, "issue-3");
    }

    #[test]
    fn interfaces_are_keyed_by_issue_name() {
        let mut mem = SharedMemory::new();
        mem.record_interface("parse-issue", "pub fn parse(&str) -> Result<Ast>");
        assert_eq!(mem.interface_for("parse-issue"), Some("pub fn parse(&str) -> Result<Ast>"));
        assert_eq!(mem.interface_for("other"), None);
    }
}

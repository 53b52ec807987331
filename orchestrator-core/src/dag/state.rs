//! `DAGState` — the single source of truth for a run (§3).
//!
//! Owned exclusively by the scheduler and mutated only at gate points
//! (§5, O2). Every mutating method here is a gate-time operation; nothing
//! in this module performs I/O.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::decisions::{IssueUpdate, ReplanDecision, ReplanHistoryEntry};
use super::issue::{DebtItem, Issue, IssueOutcome, IssueResult};
use super::levels::{compute_levels, detect_file_conflicts, DagError, FileConflict};
use super::plan::PlanResult;

/// Per-branch merge outcome within a `merge_level` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchMergeStatus {
    Merged { sha: String },
    ConflictResolved { sha: String, strategy: String },
    Failed { reason: String },
}

/// Result of merging a completed level's issue branches into the
/// integration branch (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub level_index: usize,
    pub branch_statuses: BTreeMap<String, BranchMergeStatus>,
    pub needs_integration_tests: bool,
}

impl MergeResult {
    pub fn all_merged(&self) -> bool {
        self.branch_statuses
            .values()
            .all(|s| !matches!(s, BranchMergeStatus::Failed { .. }))
    }
}

/// Result of the integration-test gate for one level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationTestResult {
    pub level_index: usize,
    pub passed: bool,
    pub details: String,
}

/// Git bookkeeping carried in `DAGState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitTracking {
    pub integration_branch: String,
    pub original_branch: String,
    pub initial_commit_sha: String,
    pub worktree_root: String,
    /// Integration-branch SHA recorded after each successfully merged level.
    #[serde(default)]
    pub level_shas: Vec<String>,
}

/// One entry recording a scheduler-level adaptation (debt propagation,
/// failure-note propagation, split insertion) for post-hoc inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationEntry {
    pub level_index: usize,
    pub kind: String,
    pub detail: String,
}

/// Schema version stamped into every serialized checkpoint; a mismatch is
/// treated as "no checkpoint" by the store (§4.3).
pub const DAG_STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DAGState {
    pub schema_version: u32,
    pub repo_path: String,
    pub artifacts_path: String,
    pub plan_rationale: String,

    /// Authoritative issue map — all other references are lookup keys (§9).
    pub issues: BTreeMap<String, Issue>,
    pub levels: Vec<Vec<String>>,
    pub current_level: usize,

    pub completed: BTreeSet<String>,
    pub failed_recoverable: BTreeSet<String>,
    pub failed_unrecoverable: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
    pub in_flight: BTreeSet<String>,

    pub replan_count: u32,
    pub replan_history: Vec<ReplanHistoryEntry>,

    pub git: GitTracking,
    pub level_merge_results: Vec<MergeResult>,
    pub level_integration_test_results: Vec<IntegrationTestResult>,
    pub accumulated_debt: Vec<DebtItem>,
    pub adaptation_history: Vec<AdaptationEntry>,
    pub file_conflicts: Vec<FileConflict>,

    pub verify_fix_cycles_used: u32,

    /// Set once a replan decision aborts the run (§4.5 step 8). Checked by
    /// `is_terminal` so the scheduler stops advancing levels once set.
    pub aborted_reason: Option<String>,

    /// Monotone counter (I5); bumped on every mutating call.
    pub version: u64,
}

impl DAGState {
    pub fn new(repo_path: impl Into<String>, artifacts_path: impl Into<String>, git: GitTracking, plan: &PlanResult) -> Self {
        let issues: BTreeMap<String, Issue> = plan
            .issues
            .iter()
            .cloned()
            .map(|i| (i.name.clone(), i))
            .collect();

        Self {
            schema_version: DAG_STATE_SCHEMA_VERSION,
            repo_path: repo_path.into(),
            artifacts_path: artifacts_path.into(),
            plan_rationale: plan.rationale.clone(),
            issues,
            levels: plan.levels.clone(),
            current_level: 0,
            completed: BTreeSet::new(),
            failed_recoverable: BTreeSet::new(),
            failed_unrecoverable: BTreeSet::new(),
            skipped: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            replan_count: 0,
            replan_history: Vec::new(),
            git,
            level_merge_results: Vec::new(),
            level_integration_test_results: Vec::new(),
            accumulated_debt: Vec::new(),
            adaptation_history: Vec::new(),
            file_conflicts: plan.file_conflicts.clone(),
            verify_fix_cycles_used: 0,
            aborted_reason: None,
            version: 0,
        }
    }

    fn bump(&mut self) {
        self.version += 1;
    }

    /// Issues still part of the remaining graph: not completed, not skipped,
    /// not failed-unrecoverable.
    pub fn remaining_names(&self) -> BTreeSet<String> {
        self.issues
            .keys()
            .filter(|n| {
                !self.completed.contains(*n)
                    && !self.skipped.contains(*n)
                    && !self.failed_unrecoverable.contains(*n)
            })
            .cloned()
            .collect()
    }

    /// Recompute levels over the remaining graph (§4.4, §5 resume semantics).
    /// Does not touch `current_level` — callers decide whether to reset it.
    pub fn recompute_levels(&mut self) -> Result<(), DagError> {
        let remaining = self.remaining_names();
        let subset: BTreeMap<String, Issue> = self
            .issues
            .iter()
            .filter(|(n, _)| remaining.contains(*n))
            .map(|(n, i)| (n.clone(), i.clone()))
            .collect();
        let levels = compute_levels(&subset)?;
        self.file_conflicts = detect_file_conflicts(&subset, &levels);
        self.levels = levels;
        self.bump();
        Ok(())
    }

    pub fn current_level_issues(&self) -> &[String] {
        self.levels.get(self.current_level).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn mark_in_flight(&mut self, names: impl IntoIterator<Item = String>) {
        self.in_flight.extend(names);
        self.bump();
    }

    /// Classify a single `IssueResult` into the appropriate bucket (§4.5 step 3).
    /// Returns `true` if the issue landed in a bucket requiring further gate
    /// processing this level (split/replan candidates).
    pub fn classify(&mut self, result: &IssueResult) {
        self.in_flight.remove(&result.issue_name);
        if let Some(issue) = self.issues.get_mut(&result.issue_name) {
            issue.iterations_used = result.iterations_used;
            if let Some(branch) = &result.final_branch {
                issue.branch_name = Some(branch.clone());
            }
        }
        match result.outcome {
            IssueOutcome::Completed | IssueOutcome::CompletedWithDebt => {
                self.completed.insert(result.issue_name.clone());
                self.accumulated_debt.extend(result.debt.clone());
            }
            IssueOutcome::FailedNeedsSplit | IssueOutcome::FailedEscalated => {
                self.failed_recoverable.insert(result.issue_name.clone());
            }
            IssueOutcome::FailedUnrecoverable => {
                self.failed_unrecoverable.insert(result.issue_name.clone());
                self.accumulated_debt.extend(result.debt.clone());
            }
            IssueOutcome::Skipped => {
                self.skipped.insert(result.issue_name.clone());
            }
        }
        self.bump();
    }

    pub fn record_merge_result(&mut self, result: MergeResult) {
        for (name, status) in &result.branch_statuses {
            if let BranchMergeStatus::Merged { sha } | BranchMergeStatus::ConflictResolved { sha, .. } = status {
                if let Some(issue) = self.issues.get_mut(name) {
                    issue.branch_name = Some(issue.branch_name.clone().unwrap_or_else(|| name.clone()));
                }
                self.git.level_shas.push(sha.clone());
            }
        }
        self.level_merge_results.push(result);
        self.bump();
    }

    pub fn record_integration_test_result(&mut self, result: IntegrationTestResult) {
        self.level_integration_test_results.push(result);
        self.bump();
    }

    /// Debt gate (§4.5 step 6): propagate a debt note to direct dependents so
    /// it is visible to their coder from the next iteration onward.
    pub fn propagate_debt_to_dependents(&mut self, issue_name: &str, note: impl Into<String>) {
        let note = note.into();
        let dependents: Vec<String> = self
            .issues
            .values()
            .filter(|i| i.depends_on.contains(issue_name))
            .map(|i| i.name.clone())
            .collect();
        for dep in dependents {
            if let Some(issue) = self.issues.get_mut(&dep) {
                issue.debt_notes.push(note.clone());
            }
        }
        self.adaptation_history.push(AdaptationEntry {
            level_index: self.current_level,
            kind: "debt_propagation".to_string(),
            detail: format!("{issue_name} -> dependents: {note}"),
        });
        self.bump();
    }

    /// Failure propagation (§4.5 step 9): walk transitive dependents still
    /// present in the remaining graph and append a failure note to each.
    pub fn propagate_failure_notes(&mut self, issue_name: &str, note: impl Into<String>) {
        let note = note.into();
        let remaining = self.remaining_names();
        let mut reverse: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for issue in self.issues.values() {
            if !remaining.contains(&issue.name) {
                continue;
            }
            for dep in &issue.depends_on {
                reverse.entry(dep.clone()).or_default().push(issue.name.clone());
            }
        }

        let mut queue: VecDeque<String> = VecDeque::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        queue.push_back(issue_name.to_string());
        while let Some(cur) = queue.pop_front() {
            let Some(children) = reverse.get(&cur) else { continue };
            for child in children {
                if seen.insert(child.clone()) {
                    if let Some(issue) = self.issues.get_mut(child) {
                        issue.failure_notes.push(format!("dependency {issue_name} failed: {note}"));
                    }
                    queue.push_back(child.clone());
                }
            }
        }
        self.bump();
    }

    /// Split gate (§4.5 step 7): insert sub-issues, removing the parent.
    /// Sub-issues inherit the parent's dependents (anything that depended on
    /// the parent now depends on every sub-issue).
    pub fn apply_split(&mut self, parent_name: &str, mut sub_issues: Vec<Issue>) -> Result<(), DagError> {
        let next_seq = self.issues.values().map(|i| i.sequence_number).max().unwrap_or(0) + 1;
        for (offset, sub) in sub_issues.iter_mut().enumerate() {
            if sub.sequence_number == 0 {
                sub.sequence_number = next_seq + offset as u32;
            }
        }

        let dependents: Vec<String> = self
            .issues
            .values()
            .filter(|i| i.depends_on.contains(parent_name))
            .map(|i| i.name.clone())
            .collect();

        self.failed_recoverable.remove(parent_name);
        self.issues.remove(parent_name);

        let sub_names: Vec<String> = sub_issues.iter().map(|s| s.name.clone()).collect();
        for sub in sub_issues {
            self.issues.insert(sub.name.clone(), sub);
        }
        for dep_name in dependents {
            if let Some(dep) = self.issues.get_mut(&dep_name) {
                dep.depends_on.remove(parent_name);
                for sub_name in &sub_names {
                    dep.depends_on.insert(sub_name.clone());
                }
            }
        }

        self.adaptation_history.push(AdaptationEntry {
            level_index: self.current_level,
            kind: "split".to_string(),
            detail: format!("{parent_name} -> {sub_names:?}"),
        });
        self.recompute_levels()?;
        Ok(())
    }

    /// Apply a validated `ReplanDecision`. Returns the decision actually
    /// applied — `MODIFY_DAG` degrades to `CONTINUE` if validation fails
    /// (cycle or orphaned dependency, §4.8 step 5).
    pub fn apply_replan_decision(&mut self, decision: ReplanDecision, rationale: impl Into<String>, triggering_issues: Vec<String>) -> ReplanDecision {
        let rationale = rationale.into();
        let applied = match decision {
            ReplanDecision::Continue => ReplanDecision::Continue,
            ReplanDecision::Abort => {
                self.aborted_reason = Some(rationale.clone());
                ReplanDecision::Abort
            }
            ReplanDecision::ReduceScope { skip_set } => {
                for name in &skip_set {
                    self.failed_recoverable.remove(name);
                    self.skipped.insert(name.clone());
                }
                if self.recompute_levels().is_err() {
                    ReplanDecision::Continue
                } else {
                    self.current_level = 0;
                    ReplanDecision::ReduceScope { skip_set }
                }
            }
            ReplanDecision::ModifyDag { remove_set, skip_set, update_map, add } => {
                match self.try_apply_modify_dag(&remove_set, &skip_set, &update_map, &add) {
                    Ok(()) => ReplanDecision::ModifyDag { remove_set, skip_set, update_map, add },
                    Err(_) => ReplanDecision::Continue,
                }
            }
        };

        self.replan_count += 1;
        self.replan_history.push(ReplanHistoryEntry {
            replan_index: self.replan_count,
            decision: applied.clone(),
            rationale,
            triggering_issues,
        });
        self.bump();
        applied
    }

    fn try_apply_modify_dag(
        &mut self,
        remove_set: &BTreeSet<String>,
        skip_set: &BTreeSet<String>,
        update_map: &BTreeMap<String, IssueUpdate>,
        add: &[Issue],
    ) -> Result<(), DagError> {
        for name in remove_set {
            if self.completed.contains(name) {
                continue;
            }
            self.issues.remove(name);
            self.failed_recoverable.remove(name);
            self.failed_unrecoverable.remove(name);
        }
        for name in skip_set {
            self.failed_recoverable.remove(name);
            self.failed_unrecoverable.remove(name);
            self.skipped.insert(name.clone());
        }
        for (name, update) in update_map {
            if let Some(issue) = self.issues.get_mut(name) {
                if let Some(acs) = &update.acceptance_criteria {
                    issue.acceptance_criteria = acs.clone();
                }
                if let Some(deps) = &update.depends_on {
                    issue.depends_on = deps.clone();
                }
                if let Some(notes) = &update.approach_notes {
                    issue.approach_changes = Some(notes.clone());
                }
            }
        }
        let next_seq = self.issues.values().map(|i| i.sequence_number).max().unwrap_or(0) + 1;
        for (offset, issue) in add.iter().enumerate() {
            let mut issue = issue.clone();
            issue.sequence_number = next_seq + offset as u32;
            self.issues.insert(issue.name.clone(), issue);
        }

        // Validate: must not introduce a cycle or orphan a dependency.
        let remaining = self.remaining_names();
        for issue in self.issues.values() {
            if !remaining.contains(&issue.name) {
                continue;
            }
            for dep in &issue.depends_on {
                let dep_known = self.issues.contains_key(dep)
                    || self.completed.contains(dep)
                    || self.skipped.contains(dep);
                if !dep_known {
                    return Err(DagError::DanglingDependency(issue.name.clone(), dep.clone()));
                }
            }
        }
        self.recompute_levels()?;
        self.current_level = 0;
        Ok(())
    }

    pub fn advance_level(&mut self) {
        self.current_level += 1;
        self.bump();
    }

    pub fn is_terminal(&self) -> bool {
        self.current_level >= self.levels.len() || self.aborted_reason.is_some()
    }

    /// Moves an escalated issue out of `failed_recoverable` into
    /// `failed_unrecoverable`. Used when replanning is disabled: with no
    /// replanner to act on an escalation, it can never be recovered (§6).
    pub fn escalate_to_unrecoverable(&mut self, issue_name: &str) {
        if self.failed_recoverable.remove(issue_name) {
            self.failed_unrecoverable.insert(issue_name.to_string());
            self.bump();
        }
    }

    /// Check invariants I1–I4 (§3). I5 is the checkpoint store's concern.
    pub fn check_invariants(&self) -> Result<(), String> {
        // I1: every issue name appears in exactly one disjoint bucket, or in_flight.
        for name in self.issues.keys() {
            let buckets = [
                self.completed.contains(name),
                self.failed_recoverable.contains(name),
                self.failed_unrecoverable.contains(name),
                self.skipped.contains(name),
            ];
            let count = buckets.iter().filter(|b| **b).count();
            let in_flight = self.in_flight.contains(name);
            if count > 1 {
                return Err(format!("issue {name} appears in more than one status bucket"));
            }
            if count == 1 && in_flight {
                return Err(format!("issue {name} is both terminal and in_flight"));
            }
        }

        // I3: acyclicity of depends_on over remaining issues.
        let remaining = self.remaining_names();
        let subset: BTreeMap<String, Issue> = self
            .issues
            .iter()
            .filter(|(n, _)| remaining.contains(*n))
            .map(|(n, i)| (n.clone(), i.clone()))
            .collect();
        if compute_levels(&subset).is_err() {
            return Err("depends_on relation over remaining issues is cyclic".to_string());
        }

        // I4: no issue in level k depends on an issue in level >= k.
        let mut level_of: BTreeMap<&str, usize> = BTreeMap::new();
        for (idx, level) in self.levels.iter().enumerate() {
            for name in level {
                level_of.insert(name.as_str(), idx);
            }
        }
        for (idx, level) in self.levels.iter().enumerate() {
            for name in level {
                let Some(issue) = self.issues.get(name) else { continue };
                for dep in &issue.depends_on {
                    if let Some(&dep_level) = level_of.get(dep.as_str()) {
                        if dep_level >= idx {
                            return Err(format!(
                                "issue {name} in level {idx} depends on {dep} in level {dep_level}"
                            ));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

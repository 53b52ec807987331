//! DAG Scheduler (C5) — drives a plan to completion level by level.
//!
//! Owns the `DAGState` for the duration of a run and is the only thing that
//! mutates it (§5). Each level runs the fixed gate sequence: workspace
//! setup, parallel execution, classification, merge, integration test, debt
//! propagation, split, replan, failure propagation, checkpoint, advance.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use orchestrator_core::dag::issue::{IssueOutcome, IssueResult};
use orchestrator_core::{
    ArtifactStore, BranchMergeStatus, CheckpointStoreError, DAGState, DebtItem, EscalationState,
    GateOutcome, GitWorkspaceError, GitWorkspaceManager, Issue, IntegrationTestResult,
    ReplanDecision, Verifier, VerifierConfig, VerifierReport,
};

use crate::advisor::Advisor;
use crate::coding_loop::{CodingLoop, CodingLoopOutcome};
use crate::invocation::invoker::AgentInvoker;
use crate::replanner::{self, Replanner};
use crate::shared_memory::SharedMemory;
use crate::state_machine::{OrchestratorState, StateMachine};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("workspace error: {0}")]
    Workspace(#[from] GitWorkspaceError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointStoreError),
}

/// Knobs the scheduler reads from `RunConfig` (§6). Kept as a standalone
/// struct rather than taking `RunConfig` directly so this module has no
/// dependency on the config file's layout.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_coding_iterations: u32,
    pub max_advisor_invocations: u32,
    pub max_replans: u32,
    pub enable_advisor: bool,
    pub enable_replanning: bool,
    /// `None` is unbounded — the §5 default.
    pub concurrency_cap: Option<usize>,
    pub verifier_config: VerifierConfig,
}

/// Single cooperative cancel signal shared between the scheduler and its
/// caller (§5). Checked between levels and before starting a new level's
/// issue tasks; never interrupts an in-flight agent invocation — the
/// scheduler waits out whatever is already running, persists a checkpoint,
/// and returns rather than orphaning a worktree.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

pub struct Scheduler<'a> {
    invoker: &'a AgentInvoker,
    workspace: &'a GitWorkspaceManager,
    store: &'a ArtifactStore,
    config: SchedulerConfig,
    cancel: CancelSignal,
}

/// Where a single issue's pass through the coding loop landed, after the
/// advisor (if consulted) has had a chance to turn a BLOCK/exhaustion into a
/// terminal decision.
enum IssuePass {
    Terminal(IssueResult),
    Retry,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        invoker: &'a AgentInvoker,
        workspace: &'a GitWorkspaceManager,
        store: &'a ArtifactStore,
        config: SchedulerConfig,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            invoker,
            workspace,
            store,
            config,
            cancel,
        }
    }

    /// Reconciles on-disk worktrees against `state` ahead of a resumed run
    /// (§5 resume semantics). Anything left over from a prior run that isn't
    /// needed by the current level is removed; the current level's
    /// worktrees, if missing, are recreated by `run_level`'s workspace-setup
    /// step on the next call to `run` — resume always restarts a level from
    /// its first step, never mid-level.
    pub fn reconcile_worktrees(&self, state: &DAGState) -> Result<(), SchedulerError> {
        let expected: std::collections::BTreeSet<String> = state
            .current_level_issues()
            .iter()
            .filter_map(|name| state.issues.get(name))
            .map(|issue| self.workspace.worktree_path(issue).display().to_string())
            .collect();

        for wt in self.workspace.list_worktrees()? {
            if wt.branch == state.git.integration_branch || wt.branch == state.git.original_branch {
                continue;
            }
            let path_str = wt.path.display().to_string();
            if !expected.contains(&path_str) {
                tracing::info!(path = %path_str, branch = %wt.branch, "removing orphaned worktree on resume");
                let _ = std::fs::remove_dir_all(&wt.path);
            }
        }
        Ok(())
    }

    /// Runs `state` to completion or until cancellation is observed. Never
    /// propagates a per-issue failure out of this function — everything
    /// converges through `DAGState` mutation (§7).
    pub async fn run(&self, mut state: DAGState, memory: &mut SharedMemory) -> Result<(DAGState, RunOutcome), SchedulerError> {
        while !state.is_terminal() {
            if self.cancel.is_cancelled() {
                tracing::info!(level = state.current_level, "cancellation observed before level start");
                self.store.write_checkpoint(&state)?;
                return Ok((state, RunOutcome::Cancelled));
            }
            self.run_level(&mut state, memory).await?;
            self.store.write_checkpoint(&state)?;
        }
        Ok((state, RunOutcome::Completed))
    }

    async fn run_level(&self, state: &mut DAGState, memory: &mut SharedMemory) -> Result<(), SchedulerError> {
        let level_index = state.current_level;
        let names: Vec<String> = state.current_level_issues().to_vec();
        tracing::info!(level_index, issues = names.len(), "starting level");

        // 1. workspace setup
        let mut worktrees: BTreeMap<String, (PathBuf, String)> = BTreeMap::new();
        for name in &names {
            let issue = state.issues.get(name).expect("level issue missing from state map");
            match self.workspace.make_worktree(issue, &state.git.integration_branch) {
                Ok(wt) => {
                    worktrees.insert(name.clone(), wt);
                }
                Err(e) => {
                    tracing::warn!(issue = %name, error = %e, "worktree setup failed");
                }
            }
        }
        state.mark_in_flight(names.iter().filter(|n| worktrees.contains_key(*n)).cloned());

        // 2. parallel execution
        let cap = self.config.concurrency_cap.unwrap_or(usize::MAX).max(1);
        let tasks: Vec<_> = names
            .iter()
            .filter_map(|name| {
                worktrees.get(name).map(|(path, branch)| {
                    let mut issue = state.issues.get(name).expect("issue present").clone();
                    issue.branch_name = Some(branch.clone());
                    issue.worktree_path = Some(path.display().to_string());
                    let conventions = memory.codebase_conventions().map(str::to_string);
                    let dependency_interfaces: Vec<(String, String)> = issue
                        .depends_on
                        .iter()
                        .filter_map(|dep| memory.interface_for(dep).map(|iface| (dep.clone(), iface.to_string())))
                        .collect();
                    (issue, path.clone(), conventions, dependency_interfaces)
                })
            })
            .collect();

        let mut results: Vec<IssueResult> = stream::iter(tasks)
            .map(|(mut issue, worktree_path, conventions, dependency_interfaces)| async move {
                let refs: Vec<(&str, &str)> = dependency_interfaces.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
                self.run_issue(&mut issue, &worktree_path, conventions.as_deref(), &refs).await
            })
            .buffer_unordered(cap)
            .collect()
            .await;

        for name in &names {
            if !worktrees.contains_key(name) {
                results.push(IssueResult {
                    issue_name: name.clone(),
                    outcome: IssueOutcome::FailedUnrecoverable,
                    iterations_used: 0,
                    final_branch: None,
                    debt: vec![DebtItem::unmet_ac(name.clone(), "worktree setup")],
                    sub_issues: Vec::new(),
                    diagnostic: "worktree setup failed; issue never ran".to_string(),
                });
            }
        }

        // 3. classification
        let mut split_results = Vec::new();
        let mut escalated_names = Vec::new();
        for result in &results {
            if matches!(result.outcome, IssueOutcome::FailedNeedsSplit) {
                split_results.push(result.clone());
            }
            if matches!(result.outcome, IssueOutcome::FailedEscalated | IssueOutcome::FailedUnrecoverable) {
                escalated_names.push(result.issue_name.clone());
            }
            if result.outcome.is_terminal_success() {
                memory.record_interface(&result.issue_name, result.diagnostic.clone());
            }
            let health_outcome = result.outcome;
            let gate_summary = result.diagnostic.clone();
            state.classify(result);
            memory.update_build_health(|h| {
                h.last_gate_summary = gate_summary;
                match health_outcome {
                    IssueOutcome::Completed | IssueOutcome::CompletedWithDebt => h.issues_completed += 1,
                    IssueOutcome::FailedUnrecoverable | IssueOutcome::FailedEscalated => h.issues_failed += 1,
                    _ => {}
                }
            });
        }
        memory.update_build_health(|h| h.levels_completed = level_index + 1);

        // 4. merge gate
        let branches: Vec<(String, String)> = names
            .iter()
            .filter(|n| state.completed.contains(*n))
            .filter_map(|n| state.issues.get(n).and_then(|i| i.branch_name.clone()).map(|b| (n.clone(), b)))
            .collect();
        if !branches.is_empty() {
            let merge_result = self.workspace.merge_level(level_index, &branches, &state.git.integration_branch);
            let needs_integration_tests = merge_result.needs_integration_tests;
            let failed_merges: Vec<String> = merge_result
                .branch_statuses
                .iter()
                .filter(|(_, s)| matches!(s, BranchMergeStatus::Failed { .. }))
                .map(|(n, _)| n.clone())
                .collect();
            state.record_merge_result(merge_result);
            for name in &failed_merges {
                state.accumulated_debt.push(DebtItem::dropped_ac(
                    name,
                    "merge into integration branch",
                    "branch merge failed after retry; changes are stranded on the issue branch",
                ));
            }

            // 5. integration-test gate
            if needs_integration_tests {
                let passed = self.run_integration_tests(&state.git.integration_branch).await;
                state.record_integration_test_result(IntegrationTestResult {
                    level_index,
                    passed,
                    details: if passed {
                        "post-conflict-resolution verification passed".to_string()
                    } else {
                        "post-conflict-resolution verification failed".to_string()
                    },
                });
            }
        }

        // 6. debt gate
        for result in &results {
            for debt in &result.debt {
                state.propagate_debt_to_dependents(&result.issue_name, debt.criterion.clone());
            }
        }

        // 7. split gate
        for result in &split_results {
            if let Err(e) = state.apply_split(&result.issue_name, result.sub_issues.clone()) {
                tracing::warn!(issue = %result.issue_name, error = %e, "split rejected; issue stays failed_recoverable");
            }
        }

        // 8. replan gate
        if !escalated_names.is_empty() {
            if self.config.enable_replanning {
                if state.replan_count < self.config.max_replans {
                    let replanner = Replanner::new(self.invoker.clone());
                    let (decision, rationale) = replanner.propose(state, &escalated_names).await;
                    let applied = replanner::apply(state, decision, rationale, escalated_names.clone());
                    if matches!(applied, ReplanDecision::Abort) {
                        tracing::warn!(level_index, "replanner aborted the run");
                    }
                }
            } else {
                // Replanning disabled: an escalated issue has no path back to
                // recoverable, so it's unrecoverable (§6).
                for name in &escalated_names {
                    state.escalate_to_unrecoverable(name);
                }
            }
        }

        // 9. failure propagation
        for name in &escalated_names {
            state.propagate_failure_notes(name, "escalated without recovery");
        }

        // 10/11. checkpoint is written by the caller after this returns;
        // advance only if the replan gate didn't already reset us to level 0.
        if state.current_level == level_index {
            state.advance_level();
        }
        Ok(())
    }

    /// Runs the shared verifier pipeline against the integration branch's
    /// checked-out state in the main repo working copy (§11.6 — the gate
    /// reused between the C9 acceptance check and this C5 post-conflict
    /// re-check).
    async fn run_integration_tests(&self, integration_branch: &str) -> bool {
        if let Err(e) = self.workspace.checkout_branch(integration_branch) {
            tracing::warn!(error = %e, "could not checkout integration branch for integration test gate");
            return false;
        }
        let verifier = Verifier::new(self.workspace.repo_root(), self.config.verifier_config.clone());
        let report = verifier.run_pipeline().await;
        report.all_green
    }

    /// Drives a single issue through the coding loop, escalating to the
    /// advisor on BLOCK/exhaustion (§4.6/§4.7), and returns the terminal
    /// `IssueResult` the scheduler classifies in the gate above.
    async fn run_issue(
        &self,
        issue: &mut Issue,
        worktree_path: &PathBuf,
        conventions: Option<&str>,
        dependency_interfaces: &[(&str, &str)],
    ) -> IssueResult {
        let coding_loop = CodingLoop::new(self.invoker, self.config.max_coding_iterations);
        let advisor = Advisor::new(self.invoker.clone(), self.config.max_advisor_invocations);
        let mut iteration_history: Vec<String> = Vec::new();
        let last_report: RefCell<Option<VerifierReport>> = RefCell::new(None);
        let escalation_state = RefCell::new(EscalationState::new(issue.name.clone()));

        let mut sm = StateMachine::new();
        advance(&mut sm, OrchestratorState::PreparingWorktree, "worktree ready", &issue.name);

        loop {
            advance(&mut sm, OrchestratorState::Implementing, "coding loop pass starting", &issue.name);
            let verifier_config = self.config.verifier_config.clone();
            let worktree = worktree_path.clone();
            let outcome = coding_loop
                .run(issue, conventions, dependency_interfaces, || {
                    let verifier = Verifier::new(worktree.clone(), verifier_config.clone());
                    let last_report = &last_report;
                    let escalation_state = &escalation_state;
                    async move {
                        let report = verifier.run_pipeline().await;
                        let gate_outcome = if report.all_green { GateOutcome::Passed } else { GateOutcome::Failed };
                        escalation_state.borrow_mut().record_iteration(
                            report.error_categories.keys().copied().collect(),
                            report.failure_signals.len(),
                            report.all_green,
                        );
                        *last_report.borrow_mut() = Some(report);
                        gate_outcome
                    }
                })
                .await;

            advance(&mut sm, OrchestratorState::Verifying, "gate ran for this pass", &issue.name);

            let outcome = match outcome {
                Ok(o) => o,
                Err(e) => {
                    advance(&mut sm, OrchestratorState::Failed, "coding loop invocation failed", &issue.name);
                    return terminal(issue, IssueOutcome::FailedEscalated, format!("coding loop invocation failed: {e}"));
                }
            };

            let (iterations_used, reason) = match outcome {
                CodingLoopOutcome::Approved { iterations_used, final_summary, .. } => {
                    advance(&mut sm, OrchestratorState::Merging, "approved; handing off to the merge gate", &issue.name);
                    advance(&mut sm, OrchestratorState::Resolved, "issue complete", &issue.name);
                    return terminal(issue, IssueOutcome::Completed, final_summary).with_iterations(iterations_used);
                }
                CodingLoopOutcome::Blocked { iterations_used, reason } => (iterations_used, reason),
                CodingLoopOutcome::Exhausted { iterations_used } => (iterations_used, "coding loop exhausted its iteration budget".to_string()),
            };
            iteration_history.push(reason.clone());

            if !self.config.enable_advisor {
                advance(&mut sm, OrchestratorState::Failed, "advisor disabled; escalating", &issue.name);
                return terminal(issue, IssueOutcome::FailedEscalated, reason).with_iterations(iterations_used);
            }

            advance(&mut sm, OrchestratorState::Escalating, "consulting advisor", &issue.name);
            let report_for_advisor = last_report.borrow().clone();
            let escalation_snapshot = escalation_state.borrow().clone();
            match self
                .consult_advisor(&advisor, issue, &iteration_history, report_for_advisor.as_ref(), &escalation_snapshot)
                .await
            {
                IssuePass::Terminal(result) => {
                    advance(
                        &mut sm,
                        if result.outcome.is_terminal_success() { OrchestratorState::Resolved } else { OrchestratorState::Failed },
                        "advisor reached a terminal decision",
                        &issue.name,
                    );
                    return result;
                }
                IssuePass::Retry => {
                    *last_report.borrow_mut() = None;
                    continue;
                }
            }
        }
    }

    /// Applies one advisor decision to `issue`, returning `Terminal` for a
    /// split/debt-accept/escalate decision or `Retry` once the issue has been
    /// mutated for another coding-loop pass (RETRY_MODIFIED/RETRY_APPROACH).
    async fn consult_advisor(
        &self,
        advisor: &Advisor,
        issue: &mut Issue,
        iteration_history: &[String],
        last_report: Option<&VerifierReport>,
        escalation_state: &EscalationState,
    ) -> IssuePass {
        let decision = match advisor.decide(issue, iteration_history, last_report, Some(escalation_state)).await {
            Ok(d) => d,
            Err(e) => {
                return IssuePass::Terminal(terminal(issue, IssueOutcome::FailedEscalated, format!("advisor invocation failed: {e}")));
            }
        };
        issue.advisor_invocations_used += 1;

        use orchestrator_core::AdvisorDecision;
        match decision {
            AdvisorDecision::RetryApproach { approach_changes } => {
                issue.approach_changes = Some(approach_changes);
                IssuePass::Retry
            }
            AdvisorDecision::RetryModified {
                dropped_acceptance_criteria,
                justification,
            } => {
                for criterion in &dropped_acceptance_criteria {
                    issue.debt_notes.push(format!("dropped: {criterion} ({justification})"));
                }
                issue.retry_context = Some(justification);
                IssuePass::Retry
            }
            AdvisorDecision::Split { sub_issues } => IssuePass::Terminal(IssueResult {
                issue_name: issue.name.clone(),
                outcome: IssueOutcome::FailedNeedsSplit,
                iterations_used: issue.iterations_used,
                final_branch: issue.branch_name.clone(),
                debt: Vec::new(),
                sub_issues,
                diagnostic: "advisor split the issue".to_string(),
            }),
            AdvisorDecision::AcceptWithDebt { debt } => IssuePass::Terminal(IssueResult {
                issue_name: issue.name.clone(),
                outcome: IssueOutcome::CompletedWithDebt,
                iterations_used: issue.iterations_used,
                final_branch: issue.branch_name.clone(),
                debt,
                sub_issues: Vec::new(),
                diagnostic: "advisor accepted with debt".to_string(),
            }),
            AdvisorDecision::EscalateToReplan => IssuePass::Terminal(terminal(
                issue,
                IssueOutcome::FailedEscalated,
                "advisor escalated to replan".to_string(),
            )),
        }
    }
}

/// Advances `sm` for audit/debug logging only — an illegal transition (the
/// richer advisor decisions in §4.7 don't map one-to-one onto the state
/// machine's coarser graph) is logged and otherwise ignored rather than
/// treated as a scheduling error.
fn advance(sm: &mut StateMachine, to: OrchestratorState, reason: &str, issue_name: &str) {
    if let Err(e) = sm.advance(to, Some(reason)) {
        tracing::debug!(issue = %issue_name, error = %e, "state machine: non-modeled transition");
    }
}

fn terminal(issue: &Issue, outcome: IssueOutcome, diagnostic: String) -> IssueResult {
    IssueResult {
        issue_name: issue.name.clone(),
        outcome,
        iterations_used: issue.iterations_used,
        final_branch: issue.branch_name.clone(),
        debt: Vec::new(),
        sub_issues: Vec::new(),
        diagnostic,
    }
}

trait WithIterations {
    fn with_iterations(self, iterations_used: u32) -> Self;
}

impl WithIterations for IssueResult {
    fn with_iterations(mut self, iterations_used: u32) -> Self {
        self.iterations_used = iterations_used;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::backend::MockAgentBackend;
    use orchestrator_core::dag::plan::PlanResult;
    use orchestrator_core::{ArtifactStore, GitTracking};
    use std::process::Command;
    use std::sync::Arc;

    fn init_repo(dir: &std::path::Path) {
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

    fn ok(body: &'static str) -> String {
        format!(r#"{{"status":"SUCCESS",{body}}}"#)
    }

    #[tokio::test]
    async fn single_trivial_issue_completes_and_advances() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let wt_base = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();

        let workspace = GitWorkspaceManager::new(repo.path(), wt_base.path()).unwrap();
        let tracking = workspace.init_integration("main").unwrap();
        let store = ArtifactStore::new(artifacts.path()).unwrap();

        let mut mock = MockAgentBackend::new();
        mock.expect_complete().returning(|role, _, _| {
            Box::pin(async move {
                match role {
                    crate::invocation::types::Role::Coder => Ok(ok(r#""summary":"did the thing""#)),
                    crate::invocation::types::Role::Reviewer => Ok(ok(r#""verdict":"APPROVE","feedback":"ship it""#)),
                    other => panic!("unexpected role {other:?}"),
                }
            })
        });
        let invoker = AgentInvoker::new(Arc::new(mock));

        let mut issue = Issue::new("add-readme-note", "Add a note to the readme", 1);
        issue.guidance.needs_deeper_qa = false;
        let plan = PlanResult {
            issues: vec![issue.clone()],
            levels: vec![vec![issue.name.clone()]],
            ..PlanResult::empty("demo goal")
        };
        let state = DAGState::new(
            repo.path().display().to_string(),
            artifacts.path().display().to_string(),
            tracking,
            &plan,
        );

        let config = SchedulerConfig {
            max_coding_iterations: 3,
            max_advisor_invocations: 2,
            max_replans: 2,
            enable_advisor: true,
            enable_replanning: true,
            concurrency_cap: None,
            verifier_config: VerifierConfig::none(),
        };
        let scheduler = Scheduler::new(&invoker, &workspace, &store, config, CancelSignal::new());
        let mut memory = SharedMemory::new();
        let (final_state, outcome) = scheduler.run(state, &mut memory).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert!(final_state.completed.contains("add-readme-note"));
        assert!(final_state.is_terminal());
    }

    #[tokio::test]
    async fn cancellation_before_first_level_returns_cancelled() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let wt_base = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();

        let workspace = GitWorkspaceManager::new(repo.path(), wt_base.path()).unwrap();
        let tracking = workspace.init_integration("main").unwrap();
        let store = ArtifactStore::new(artifacts.path()).unwrap();

        let mock = MockAgentBackend::new();
        let invoker = AgentInvoker::new(Arc::new(mock));

        let issue = Issue::new("never-runs", "Never runs", 1);
        let plan = PlanResult {
            issues: vec![issue.clone()],
            levels: vec![vec![issue.name.clone()]],
            ..PlanResult::empty("demo goal")
        };
        let state = DAGState::new(
            repo.path().display().to_string(),
            artifacts.path().display().to_string(),
            tracking,
            &plan,
        );

        let config = SchedulerConfig {
            max_coding_iterations: 3,
            max_advisor_invocations: 2,
            max_replans: 2,
            enable_advisor: true,
            enable_replanning: true,
            concurrency_cap: None,
            verifier_config: VerifierConfig::none(),
        };
        let cancel = CancelSignal::new();
        cancel.cancel();
        let scheduler = Scheduler::new(&invoker, &workspace, &store, config, cancel);
        let mut memory = SharedMemory::new();
        let (final_state, outcome) = scheduler.run(state, &mut memory).await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(final_state.current_level, 0);
        assert!(store.load_checkpoint().unwrap().is_some());
    }

    #[tokio::test]
    async fn escalated_issue_becomes_unrecoverable_when_replanning_disabled() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());
        let wt_base = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();

        let workspace = GitWorkspaceManager::new(repo.path(), wt_base.path()).unwrap();
        let tracking = workspace.init_integration("main").unwrap();
        let store = ArtifactStore::new(artifacts.path()).unwrap();

        let mut mock = MockAgentBackend::new();
        mock.expect_complete().returning(|role, _, _| {
            Box::pin(async move {
                match role {
                    crate::invocation::types::Role::Coder => Ok(ok(r#""summary":"attempted the change""#)),
                    crate::invocation::types::Role::Reviewer => {
                        Ok(ok(r#""verdict":"BLOCK","feedback":"unworkable approach""#))
                    }
                    other => panic!("unexpected role {other:?}"),
                }
            })
        });
        let invoker = AgentInvoker::new(Arc::new(mock));

        let mut issue = Issue::new("hard-issue", "A blocked issue", 1);
        issue.guidance.needs_deeper_qa = false;
        let plan = PlanResult {
            issues: vec![issue.clone()],
            levels: vec![vec![issue.name.clone()]],
            ..PlanResult::empty("demo goal")
        };
        let state = DAGState::new(
            repo.path().display().to_string(),
            artifacts.path().display().to_string(),
            tracking,
            &plan,
        );

        // Advisor disabled so the coding loop's first BLOCK escalates
        // straight to FailedEscalated; replanning disabled means that
        // escalation must resolve to failed_unrecoverable (§6).
        let config = SchedulerConfig {
            max_coding_iterations: 3,
            max_advisor_invocations: 2,
            max_replans: 2,
            enable_advisor: false,
            enable_replanning: false,
            concurrency_cap: None,
            verifier_config: VerifierConfig::none(),
        };
        let scheduler = Scheduler::new(&invoker, &workspace, &store, config, CancelSignal::new());
        let mut memory = SharedMemory::new();
        let (final_state, outcome) = scheduler.run(state, &mut memory).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert!(final_state.failed_recoverable.is_empty());
        assert!(final_state.failed_unrecoverable.contains("hard-issue"));
    }
}

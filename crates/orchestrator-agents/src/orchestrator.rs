//! The four public entry points (§13): `build`, `plan`, `execute`, and
//! `resume_build`. This is the only module that owns the full wiring —
//! Planning Pipeline, Git Workspace Manager, Artifact & Checkpoint Store, DAG
//! Scheduler, and Verify-Fix Loop — everything else in this crate is a
//! component `Orchestrator` assembles per call.

use std::path::{Path, PathBuf};
use std::process::Command;

use orchestrator_core::dag::plan::PlanResult;
use orchestrator_core::{
    ArtifactStore, CheckpointStoreError, DAGState, DagError, DebtItem, GitWorkspaceError,
    GitWorkspaceManager, Prd,
};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::invocation::invoker::AgentInvoker;
use crate::invocation::types::InvocationError;
use crate::planning::{PlanningError, PlanningPipeline};
use crate::replanner;
use crate::scheduler::{CancelSignal, RunOutcome, Scheduler, SchedulerConfig, SchedulerError};
use crate::shared_memory::SharedMemory;
use crate::verify_fix::{self, VerifyFixLoop, VerifyFixOutcome};

const ARTIFACTS_DIRNAME: &str = ".orchestrator/artifacts";
const WORKTREE_DIRNAME: &str = ".orchestrator/worktrees";
const PRD_ARTIFACT: &str = "prd";
const ARCHITECTURE_ARTIFACT: &str = "architecture";

/// Where `build` should find the repository it is building against.
#[derive(Debug, Clone)]
pub enum RepoSource {
    Local(PathBuf),
    /// Cloned with a bare `git clone` into a fresh temp directory before the
    /// run starts. Cloning credentials/auth are an external-collaborator
    /// concern (§1) — this expects `url` to already be fetchable by the
    /// ambient `git` binary (e.g. an SSH agent or a credential helper).
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    PartialSuccess,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: String,
    pub detail: String,
}

#[derive(Debug)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub dag_state: DAGState,
    pub phase_breakdown: Vec<PhaseSummary>,
    pub accumulated_debt: Vec<DebtItem>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),
    #[error("workspace error: {0}")]
    Workspace(#[from] GitWorkspaceError),
    #[error("checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointStoreError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("plan graph invalid: {0}")]
    Dag(#[from] DagError),
    #[error("no checkpoint found under {0}")]
    NoCheckpoint(PathBuf),
    #[error("the persisted plan artifacts under {0} are missing or unreadable")]
    MissingPlanArtifacts(PathBuf),
    #[error("cloning {url} failed: {detail}")]
    RemoteClone { url: String, detail: String },
    #[error("verify-fix loop invocation failed: {0}")]
    VerifyFix(#[from] InvocationError),
}

/// Assembles the Planning Pipeline, DAG Scheduler, and Verify-Fix Loop
/// behind the four public entry points. Holds nothing but the invocation
/// layer — workspace/store/state are all scoped to a single call.
pub struct Orchestrator {
    invoker: AgentInvoker,
}

impl Orchestrator {
    pub fn new(invoker: AgentInvoker) -> Self {
        Self { invoker }
    }

    /// Plans and executes a goal against `repo` end to end: planning,
    /// level-synchronous scheduling, and the bounded verify-fix loop,
    /// checkpointing after every phase so a crash mid-run can be resumed
    /// with `resume_build`.
    pub async fn build(&self, goal: &str, repo: RepoSource, config: RunConfig) -> Result<BuildResult, OrchestratorError> {
        let repo_path = resolve_repo(repo)?;
        let artifacts_path = repo_path.join(ARTIFACTS_DIRNAME);
        let worktree_base = repo_path.join(WORKTREE_DIRNAME);
        let store = ArtifactStore::new(&artifacts_path)?;

        let mut phases = Vec::new();
        let plan = self.run_planning(goal, &store, &mut phases).await?;

        let workspace = GitWorkspaceManager::new(&repo_path, &worktree_base)?;
        let tracking = workspace.init_integration("HEAD")?;
        let mut state = DAGState::new(
            repo_path.display().to_string(),
            artifacts_path.display().to_string(),
            tracking,
            &plan,
        );
        store.write_checkpoint(&state)?;

        let mut memory = SharedMemory::new();
        let scheduler_config = scheduler_config_from(&config);
        let scheduler = Scheduler::new(&self.invoker, &workspace, &store, scheduler_config.clone(), CancelSignal::new());
        let outcome;
        (state, outcome) = scheduler.run(state, &mut memory).await?;
        store.write_checkpoint(&state)?;

        if outcome == RunOutcome::Cancelled {
            phases.push(PhaseSummary {
                phase: "scheduling".to_string(),
                detail: "cancelled before the DAG reached a terminal level".to_string(),
            });
            return Ok(BuildResult {
                status: BuildStatus::Cancelled,
                accumulated_debt: state.accumulated_debt.clone(),
                dag_state: state,
                phase_breakdown: phases,
            });
        }
        phases.push(PhaseSummary {
            phase: "scheduling".to_string(),
            detail: format!(
                "{} completed, {} failed, {} skipped across {} level(s)",
                state.completed.len(),
                state.failed_unrecoverable.len(),
                state.skipped.len(),
                state.levels.len()
            ),
        });

        let state = self
            .run_verify_fix_to_completion(&plan.prd, state, &store, &workspace, &scheduler_config, config.max_verify_fix_cycles, &mut memory, &mut phases)
            .await?;
        store.write_checkpoint(&state)?;

        let status = final_status(&state);
        Ok(BuildResult {
            status,
            accumulated_debt: state.accumulated_debt.clone(),
            dag_state: state,
            phase_breakdown: phases,
        })
    }

    /// Runs only the Planning Pipeline; does not touch git or the scheduler.
    pub async fn plan(&self, goal: &str, repo_path: &Path, config: &RunConfig) -> Result<PlanResult, OrchestratorError> {
        let _ = repo_path; // planning itself has no filesystem dependency (§4.4)
        let pipeline = PlanningPipeline::new(self.invoker.clone(), config.max_review_iterations);
        Ok(pipeline.plan(goal).await?)
    }

    /// Executes an already-produced `PlanResult` against `repo_path` and
    /// returns the DAG's terminal state. Does not run the verify-fix loop —
    /// that is `build`'s concern once a plan has actually been scheduled.
    pub async fn execute(&self, plan: PlanResult, repo_path: &Path, config: &RunConfig) -> Result<DAGState, OrchestratorError> {
        let artifacts_path = repo_path.join(ARTIFACTS_DIRNAME);
        let worktree_base = repo_path.join(WORKTREE_DIRNAME);
        let store = ArtifactStore::new(&artifacts_path)?;
        store.write_plan_artifact(PRD_ARTIFACT, &plan.prd)?;
        store.write_plan_artifact(ARCHITECTURE_ARTIFACT, &plan.architecture)?;

        let workspace = GitWorkspaceManager::new(repo_path, &worktree_base)?;
        let tracking = workspace.init_integration("HEAD")?;
        let state = DAGState::new(
            repo_path.display().to_string(),
            artifacts_path.display().to_string(),
            tracking,
            &plan,
        );
        store.write_checkpoint(&state)?;

        let mut memory = SharedMemory::new();
        let scheduler_config = scheduler_config_from(config);
        let scheduler = Scheduler::new(&self.invoker, &workspace, &store, scheduler_config, CancelSignal::new());
        let (state, _outcome) = scheduler.run(state, &mut memory).await?;
        store.write_checkpoint(&state)?;
        Ok(state)
    }

    /// Reloads a checkpoint under `artifacts_dir` and continues the run to
    /// completion, including any verify-fix cycles still owed (§5 resume
    /// semantics, §4.3).
    pub async fn resume_build(&self, repo_path: &Path, artifacts_dir: &Path) -> Result<BuildResult, OrchestratorError> {
        let store = ArtifactStore::new(artifacts_dir)?;
        let mut state = store
            .load_checkpoint()?
            .ok_or_else(|| OrchestratorError::NoCheckpoint(artifacts_dir.to_path_buf()))?;
        let prd: Prd = store
            .read_plan_artifact(PRD_ARTIFACT)?
            .ok_or_else(|| OrchestratorError::MissingPlanArtifacts(artifacts_dir.to_path_buf()))?;

        let config = RunConfig::default();
        let worktree_base = PathBuf::from(&state.git.worktree_root);
        let workspace = GitWorkspaceManager::new(repo_path, &worktree_base)?;
        let scheduler_config = scheduler_config_from(&config);

        let mut phases = vec![PhaseSummary {
            phase: "resume".to_string(),
            detail: format!("resumed at level {} with {} completed issue(s)", state.current_level, state.completed.len()),
        }];

        let mut memory = SharedMemory::new();
        if !state.is_terminal() {
            let scheduler = Scheduler::new(&self.invoker, &workspace, &store, scheduler_config.clone(), CancelSignal::new());
            scheduler.reconcile_worktrees(&state)?;
            let outcome;
            (state, outcome) = scheduler.run(state, &mut memory).await?;
            store.write_checkpoint(&state)?;
            if outcome == RunOutcome::Cancelled {
                return Ok(BuildResult {
                    status: BuildStatus::Cancelled,
                    accumulated_debt: state.accumulated_debt.clone(),
                    dag_state: state,
                    phase_breakdown: phases,
                });
            }
        }
        phases.push(PhaseSummary {
            phase: "scheduling".to_string(),
            detail: format!("{} completed, {} failed", state.completed.len(), state.failed_unrecoverable.len()),
        });

        let state = self
            .run_verify_fix_to_completion(&prd, state, &store, &workspace, &scheduler_config, config.max_verify_fix_cycles, &mut memory, &mut phases)
            .await?;
        store.write_checkpoint(&state)?;

        let status = final_status(&state);
        Ok(BuildResult {
            status,
            accumulated_debt: state.accumulated_debt.clone(),
            dag_state: state,
            phase_breakdown: phases,
        })
    }

    async fn run_planning(&self, goal: &str, store: &ArtifactStore, phases: &mut Vec<PhaseSummary>) -> Result<PlanResult, OrchestratorError> {
        let pipeline = PlanningPipeline::new(self.invoker.clone(), 1);
        let plan = pipeline.plan(goal).await?;
        store.write_plan_artifact(PRD_ARTIFACT, &plan.prd)?;
        store.write_plan_artifact(ARCHITECTURE_ARTIFACT, &plan.architecture)?;
        store.write_plan_artifact("rationale", &plan.rationale)?;
        phases.push(PhaseSummary {
            phase: "planning".to_string(),
            detail: format!("{} issue(s) across {} level(s) — {}", plan.issues.len(), plan.levels.len(), plan.rationale),
        });
        Ok(plan)
    }

    /// Runs the Verify-Fix Loop (C9) to either `AllPassed` or cycle
    /// exhaustion, scheduling each generated fix batch through a fresh
    /// `Scheduler::run` before checking criteria again.
    async fn run_verify_fix_to_completion(
        &self,
        prd: &Prd,
        mut state: DAGState,
        store: &ArtifactStore,
        workspace: &GitWorkspaceManager,
        scheduler_config: &SchedulerConfig,
        max_verify_fix_cycles: u32,
        memory: &mut SharedMemory,
        phases: &mut Vec<PhaseSummary>,
    ) -> Result<DAGState, OrchestratorError> {
        let verify_fix = VerifyFixLoop::new(self.invoker.clone(), max_verify_fix_cycles);
        loop {
            let outcome = verify_fix.run_cycle(prd, &state).await?;
            match outcome {
                VerifyFixOutcome::AllPassed => {
                    phases.push(PhaseSummary {
                        phase: "verify-fix".to_string(),
                        detail: "all acceptance criteria satisfied".to_string(),
                    });
                    return Ok(state);
                }
                VerifyFixOutcome::CyclesExhausted { remaining_debt } => {
                    let count = remaining_debt.len();
                    state.accumulated_debt.extend(remaining_debt);
                    phases.push(PhaseSummary {
                        phase: "verify-fix".to_string(),
                        detail: format!("verify-fix cycle budget exhausted; {count} criterion/criteria recorded as debt"),
                    });
                    return Ok(state);
                }
                VerifyFixOutcome::IssuesGenerated(issues) => {
                    let batch_size = issues.len();
                    state.verify_fix_cycles_used += 1;
                    let decision = verify_fix::as_modify_dag(issues);
                    replanner::apply(&mut state, decision, "verify-fix loop generated fix issues".to_string(), Vec::new());
                    store.write_checkpoint(&state)?;

                    let scheduler = Scheduler::new(&self.invoker, workspace, store, scheduler_config.clone(), CancelSignal::new());
                    let outcome;
                    (state, outcome) = scheduler.run(state, memory).await?;
                    store.write_checkpoint(&state)?;
                    phases.push(PhaseSummary {
                        phase: "verify-fix".to_string(),
                        detail: format!("scheduled {batch_size} fix issue(s) ({outcome:?})"),
                    });
                    if outcome == RunOutcome::Cancelled {
                        return Ok(state);
                    }
                }
            }
        }
    }
}

fn scheduler_config_from(config: &RunConfig) -> SchedulerConfig {
    SchedulerConfig {
        max_coding_iterations: config.max_coding_iterations,
        max_advisor_invocations: config.max_advisor_invocations,
        max_replans: config.max_replans,
        enable_advisor: config.enable_advisor,
        enable_replanning: config.enable_replanning,
        concurrency_cap: config.concurrency_cap,
        verifier_config: Default::default(),
    }
}

fn final_status(state: &DAGState) -> BuildStatus {
    if let Some(reason) = &state.aborted_reason {
        return BuildStatus::Failed(format!("run aborted by replanner: {reason}"));
    }
    let unresolved_failures = state.failed_unrecoverable.len() + state.failed_recoverable.len();
    if unresolved_failures > 0 && state.completed.is_empty() {
        return BuildStatus::Failed("every issue failed".to_string());
    }
    if unresolved_failures > 0 || !state.accumulated_debt.is_empty() || !state.skipped.is_empty() {
        return BuildStatus::PartialSuccess;
    }
    BuildStatus::Success
}

fn resolve_repo(repo: RepoSource) -> Result<PathBuf, OrchestratorError> {
    match repo {
        RepoSource::Local(path) => Ok(path),
        RepoSource::Remote(url) => {
            let dest = std::env::temp_dir().join(format!("orchestrator-clone-{}", uuid_like_suffix()));
            let status = Command::new("git")
                .args(["clone", "--depth", "1", &url])
                .arg(&dest)
                .status()
                .map_err(|e| OrchestratorError::RemoteClone {
                    url: url.clone(),
                    detail: e.to_string(),
                })?;
            if !status.success() {
                return Err(OrchestratorError::RemoteClone {
                    url,
                    detail: format!("git clone exited with {status}"),
                });
            }
            Ok(dest)
        }
    }
}

/// Cheap, dependency-free unique suffix for the clone destination — this
/// crate takes no UUID dependency just for a scratch directory name.
fn uuid_like_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    format!("{nanos:x}-{:x}", std::process::id())
}

#[cfg(test)]
mod final_status_tests {
    use super::*;
    use orchestrator_core::dag::plan::PlanResult;
    use orchestrator_core::GitTracking;

    fn empty_state() -> DAGState {
        let plan = PlanResult::empty("demo goal");
        let git = GitTracking {
            integration_branch: "integration".to_string(),
            original_branch: "main".to_string(),
            initial_commit_sha: "deadbeef".to_string(),
            worktree_root: "/tmp/worktrees".to_string(),
            level_shas: Vec::new(),
        };
        DAGState::new("/tmp/repo", "/tmp/artifacts", git, &plan)
    }

    #[test]
    fn all_completed_is_success() {
        let mut state = empty_state();
        state.completed.insert("a".to_string());
        assert_eq!(final_status(&state), BuildStatus::Success);
    }

    #[test]
    fn unrecovered_recoverable_failure_is_partial_success() {
        let mut state = empty_state();
        state.completed.insert("a".to_string());
        state.failed_recoverable.insert("b".to_string());
        assert_eq!(final_status(&state), BuildStatus::PartialSuccess);
    }

    #[test]
    fn only_recoverable_failures_with_nothing_completed_is_failed() {
        let mut state = empty_state();
        state.failed_recoverable.insert("a".to_string());
        assert!(matches!(final_status(&state), BuildStatus::Failed(_)));
    }

    #[test]
    fn aborted_reason_is_failed_regardless_of_completed_work() {
        let mut state = empty_state();
        state.completed.insert("a".to_string());
        state.aborted_reason = Some("scope no longer achievable".to_string());
        match final_status(&state) {
            BuildStatus::Failed(msg) => assert!(msg.contains("scope no longer achievable")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}

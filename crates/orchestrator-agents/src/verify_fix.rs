//! Verify-Fix Loop (C9) — checks every acceptance criterion in the PRD
//! against the merged integration branch and, on failure, asks for a small
//! batch of targeted fix issues rather than re-running the whole DAG.
//!
//! Bounded by `max_verify_fix_cycles`; a cycle that finds criteria still
//! failing once the budget is spent converts each into an
//! `DebtItem::unmet_ac` instead of looping forever.

use std::time::Duration;

use orchestrator_core::{DAGState, DebtItem, Issue, Prd, ReplanDecision};
use serde::{Deserialize, Serialize};

use crate::invocation::invoker::AgentInvoker;
use crate::invocation::types::{Constraints, InvocationError, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionCheck {
    pub criterion: String,
    pub passed: bool,
    pub justification: String,
}

#[derive(Debug, Serialize)]
struct VerifierInputs<'a> {
    prd: &'a Prd,
    integration_branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifierAgentResponse {
    results: Vec<CriterionCheck>,
}

#[derive(Debug, Serialize)]
struct FixGeneratorInputs<'a> {
    failed_criteria: &'a [CriterionCheck],
}

#[derive(Debug, Clone, Deserialize)]
struct FixIssueSkeleton {
    name: String,
    title: String,
    description: String,
    acceptance_criteria: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FixGeneratorResponse {
    issues: Vec<FixIssueSkeleton>,
}

/// Result of one verify-fix cycle. The caller applies `IssuesGenerated` via
/// `as_modify_dag` and `state.apply_replan_decision`, then schedules the
/// resulting (single, small) level before calling `run_cycle` again.
#[derive(Debug)]
pub enum VerifyFixOutcome {
    AllPassed,
    IssuesGenerated(Vec<Issue>),
    CyclesExhausted { remaining_debt: Vec<DebtItem> },
}

pub struct VerifyFixLoop {
    invoker: AgentInvoker,
    max_cycles: u32,
}

impl VerifyFixLoop {
    pub fn new(invoker: AgentInvoker, max_cycles: u32) -> Self {
        Self { invoker, max_cycles }
    }

    /// `state.verify_fix_cycles_used` is read but not mutated here — the
    /// caller bumps it once it has applied the returned issues (or recorded
    /// the exhaustion debt onto `state.accumulated_debt`).
    pub async fn run_cycle(&self, prd: &Prd, state: &DAGState) -> Result<VerifyFixOutcome, InvocationError> {
        let checks = self.check_criteria(prd, &state.git.integration_branch).await?;
        let failed: Vec<CriterionCheck> = checks.into_iter().filter(|c| !c.passed).collect();

        if failed.is_empty() {
            return Ok(VerifyFixOutcome::AllPassed);
        }

        if state.verify_fix_cycles_used >= self.max_cycles {
            let remaining_debt = failed
                .iter()
                .map(|c| DebtItem::unmet_ac("verify-fix-loop", c.criterion.clone()))
                .collect();
            return Ok(VerifyFixOutcome::CyclesExhausted { remaining_debt });
        }

        let fix_response = self.generate_fixes(&failed).await?;
        let next_seq = next_sequence_number(state);
        let issues = fix_response
            .issues
            .into_iter()
            .enumerate()
            .map(|(i, skeleton)| {
                let mut issue = Issue::new(skeleton.name, skeleton.title, next_seq + i as u32);
                issue.description = skeleton.description;
                issue.acceptance_criteria = skeleton.acceptance_criteria;
                issue
            })
            .collect();

        Ok(VerifyFixOutcome::IssuesGenerated(issues))
    }

    async fn check_criteria(&self, prd: &Prd, integration_branch: &str) -> Result<Vec<CriterionCheck>, InvocationError> {
        let inputs = VerifierInputs { prd, integration_branch };
        let constraints = Constraints::new("verifier-default", Duration::from_secs(2700), 150);
        let response: VerifierAgentResponse = self
            .invoker
            .invoke(Role::Verifier, &inputs, Role::Verifier.default_tools(), &constraints)
            .await?;
        Ok(response.results)
    }

    async fn generate_fixes(&self, failed_criteria: &[CriterionCheck]) -> Result<FixGeneratorResponse, InvocationError> {
        let inputs = FixGeneratorInputs { failed_criteria };
        let constraints = Constraints::new("fix-generator-default", Duration::from_secs(2700), 150);
        self.invoker
            .invoke(Role::FixGenerator, &inputs, Role::FixGenerator.default_tools(), &constraints)
            .await
    }
}

fn next_sequence_number(state: &DAGState) -> u32 {
    state.issues.values().map(|i| i.sequence_number).max().unwrap_or(0) + 1
}

/// Wraps generated fix issues as an add-only `ModifyDag` mutation — reuses
/// the DAG's existing "add issues, recompute over the remaining graph,
/// reset to its (now much smaller) level 0" path rather than inventing a
/// second way to extend a terminal `DAGState`.
pub fn as_modify_dag(issues: Vec<Issue>) -> ReplanDecision {
    ReplanDecision::ModifyDag {
        remove_set: Default::default(),
        skip_set: Default::default(),
        update_map: Default::default(),
        add: issues,
    }
}

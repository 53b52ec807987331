//! Replanner (C8) — the outer control loop.
//!
//! Invoked when any issue in a level escalates (§4.8). Receives the full
//! `DAGState` and returns a `ReplanDecision`; the scheduler is the only
//! thing that applies it, via `DAGState::apply_replan_decision`.

use std::time::Duration;

use orchestrator_core::{DAGState, ReplanDecision};
use serde::{Deserialize, Serialize};

use crate::invocation::invoker::AgentInvoker;
use crate::invocation::types::{Constraints, InvocationError, Role};

#[derive(Debug, Serialize)]
pub struct ReplannerInputs<'a> {
    pub state: &'a DAGState,
    pub triggering_issues: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ReplannerResponse {
    decision: ReplanDecision,
    rationale: String,
}

pub struct Replanner {
    invoker: AgentInvoker,
}

impl Replanner {
    pub fn new(invoker: AgentInvoker) -> Self {
        Self { invoker }
    }

    /// Ask the replanner agent for a decision. Per §4.8's crash fallback, an
    /// invocation error or schema mismatch from the agent itself degrades to
    /// `CONTINUE` rather than aborting the run — only the agent's *own*
    /// failure to produce a decision is handled here; a rejected mutation
    /// (cycle/orphan) is handled downstream by `DAGState::apply_replan_decision`.
    pub async fn propose(&self, state: &DAGState, triggering_issues: &[String]) -> (ReplanDecision, String) {
        let inputs = ReplannerInputs {
            state,
            triggering_issues,
        };
        let constraints = Constraints::new("replanner-default", Duration::from_secs(2700), 150);

        match self
            .invoker
            .invoke::<_, ReplannerResponse>(Role::Replanner, &inputs, Role::Replanner.default_tools(), &constraints)
            .await
        {
            Ok(response) => (response.decision, response.rationale),
            Err(e) => {
                tracing::warn!(error = %e, "replanner invocation failed; defaulting to CONTINUE");
                (ReplanDecision::Continue, format!("replanner invocation failed: {e}"))
            }
        }
    }
}

/// Applies a proposed decision to `state`, recording the actually-applied
/// decision (which may degrade from `MODIFY_DAG`/`REDUCE_SCOPE` to
/// `CONTINUE` when validation fails). Thin wrapper kept here so callers
/// don't need to reach into `orchestrator_core::dag` directly.
pub fn apply(state: &mut DAGState, decision: ReplanDecision, rationale: String, triggering_issues: Vec<String>) -> ReplanDecision {
    state.apply_replan_decision(decision, rationale, triggering_issues)
}

#[allow(dead_code)]
type ReplannerInvocationError = InvocationError;

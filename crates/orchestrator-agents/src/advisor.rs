//! Issue Advisor (C7) — the middle control loop.
//!
//! Invoked by the scheduler on early BLOCK or coding-loop exhaustion (§4.7).
//! Reads the full iteration trace plus the worktree and returns an
//! `AdvisorDecision`; the scheduler applies it via `DAGState::apply_split`/
//! bucket mutation, never the advisor itself.

use std::time::Duration;

use orchestrator_core::escalation::{FrictionDetector, FrictionSignal};
use orchestrator_core::{AdvisorDecision, Issue, VerifierReport};
use serde::{Deserialize, Serialize};

use crate::invocation::invoker::AgentInvoker;
use crate::invocation::types::{Constraints, InvocationError, Role};

/// Context handed to the advisor agent. Supplement #2: enriched with
/// friction signals beyond the bare iteration counter.
#[derive(Debug, Serialize)]
pub struct AdvisorInputs<'a> {
    pub issue: &'a Issue,
    pub iteration_history: &'a [String],
    pub last_report: Option<&'a VerifierReport>,
    pub friction: &'a [FrictionSignal],
    /// True when this is the last permitted advisor invocation for the
    /// issue — the agent should be steered away from another retry, though
    /// the scheduler enforces the narrowing regardless of what comes back.
    pub is_last_invocation: bool,
}

#[derive(Debug, Deserialize)]
struct AdvisorResponse {
    decision: AdvisorDecision,
}

/// Drives one advisor invocation and enforces the §4.7 "last invocation"
/// narrowing rule: a RETRY_* decision returned on the final permitted call
/// is rejected and replaced with ESCALATE_TO_REPLAN.
pub struct Advisor {
    invoker: AgentInvoker,
    max_advisor_invocations: u32,
}

impl Advisor {
    pub fn new(invoker: AgentInvoker, max_advisor_invocations: u32) -> Self {
        Self {
            invoker,
            max_advisor_invocations,
        }
    }

    /// `invocations_used` is the count *before* this call; the caller bumps
    /// `Issue::advisor_invocations_used` after `decide` returns.
    pub async fn decide(
        &self,
        issue: &Issue,
        iteration_history: &[String],
        last_report: Option<&VerifierReport>,
        escalation_state: Option<&orchestrator_core::EscalationState>,
    ) -> Result<AdvisorDecision, InvocationError> {
        let friction: Vec<FrictionSignal> = match (last_report, escalation_state) {
            (Some(report), Some(state)) => FrictionDetector::detect(state, report),
            _ => Vec::new(),
        };

        let invocations_used = issue.advisor_invocations_used;
        let is_last_invocation = invocations_used + 1 >= self.max_advisor_invocations;

        let inputs = AdvisorInputs {
            issue,
            iteration_history,
            last_report,
            friction: &friction,
            is_last_invocation,
        };

        let constraints = Constraints::new("advisor-default", Duration::from_secs(2700), 150);
        let response: AdvisorResponse = self
            .invoker
            .invoke(Role::Advisor, &inputs, Role::Advisor.default_tools(), &constraints)
            .await?;

        let decision = response.decision;
        if is_last_invocation && decision.is_retry() {
            tracing::warn!(
                issue = %issue.name,
                decision = decision.label(),
                "advisor returned a retry decision on the last permitted invocation; substituting ESCALATE_TO_REPLAN"
            );
            return Ok(AdvisorDecision::EscalateToReplan);
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::backend::MockAgentBackend;
    use std::sync::Arc;

    fn issue_at_invocation(used: u32) -> Issue {
        let mut issue = Issue::new("a", "A", 1);
        issue.advisor_invocations_used = used;
        issue
    }

    #[tokio::test]
    async fn last_invocation_downgrades_retry_to_escalate() {
        let mut mock = MockAgentBackend::new();
        mock.expect_complete().returning(|_, _, _| {
            Box::pin(async {
                Ok(r#"{"status":"SUCCESS","decision":{"decision":"RETRY_APPROACH","approach_changes":"try again"}}"#.to_string())
            })
        });
        let advisor = Advisor::new(AgentInvoker::new(Arc::new(mock)), 2);
        let issue = issue_at_invocation(1); // invocations_used=1, max=2 -> is_last
        let decision = advisor.decide(&issue, &[], None, None).await.unwrap();
        assert_eq!(decision.label(), "ESCALATE_TO_REPLAN");
    }

    #[tokio::test]
    async fn non_last_invocation_preserves_retry() {
        let mut mock = MockAgentBackend::new();
        mock.expect_complete().returning(|_, _, _| {
            Box::pin(async {
                Ok(r#"{"status":"SUCCESS","decision":{"decision":"RETRY_APPROACH","approach_changes":"try again"}}"#.to_string())
            })
        });
        let advisor = Advisor::new(AgentInvoker::new(Arc::new(mock)), 2);
        let issue = issue_at_invocation(0);
        let decision = advisor.decide(&issue, &[], None, None).await.unwrap();
        assert_eq!(decision.label(), "RETRY_APPROACH");
    }
}

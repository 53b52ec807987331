//! Coding Loop (C6) — drives a single issue's implementation to a verdict.
//!
//! Default path is coder → reviewer. When `IssueGuidance::needs_deeper_qa` is
//! set the loop instead runs coder → (qa ∥ reviewer) → synthesizer, the
//! "flagged" 4-call path. Bounded by `max_coding_iterations`; the synthesizer
//! (or reviewer, on the default path) forces BLOCK when two consecutive FIX
//! verdicts carry the same failure signature rather than letting the loop
//! spin on an unfixable issue.

use std::time::Duration;

use orchestrator_core::{GateOutcome, Issue, VerifierReport};
use serde::{Deserialize, Serialize};

use crate::invocation::invoker::AgentInvoker;
use crate::invocation::types::{Constraints, InvocationError, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewVerdict {
    Fix,
    Approve,
    Block,
}

#[derive(Debug, Serialize)]
pub struct CoderInputs<'a> {
    pub issue: &'a Issue,
    pub codebase_conventions: Option<&'a str>,
    pub dependency_interfaces: &'a [(&'a str, &'a str)],
}

#[derive(Debug, Deserialize)]
struct CoderResponse {
    summary: String,
    #[serde(default)]
    conventions_observed: Option<String>,
    #[serde(default)]
    interface_exports: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReviewerInputs<'a> {
    issue: &'a Issue,
    coder_summary: &'a str,
    gate_outcome: GateOutcome,
}

#[derive(Debug, Deserialize)]
struct ReviewerResponse {
    verdict: ReviewVerdict,
    feedback: String,
    #[serde(default)]
    failure_signature: Option<String>,
}

#[derive(Debug, Serialize)]
struct QaInputs<'a> {
    issue: &'a Issue,
    coder_summary: &'a str,
}

#[derive(Debug, Deserialize)]
struct QaResponse {
    verdict: ReviewVerdict,
    findings: String,
}

#[derive(Debug, Serialize)]
struct SynthesizerInputs<'a> {
    issue: &'a Issue,
    reviewer_feedback: &'a str,
    qa_findings: &'a str,
    reviewer_verdict: ReviewVerdict,
    qa_verdict: ReviewVerdict,
}

#[derive(Debug, Deserialize)]
struct SynthesizerResponse {
    verdict: ReviewVerdict,
    feedback: String,
    #[serde(default)]
    failure_signature: Option<String>,
}

/// One completed pass through the loop, kept for the advisor's
/// `iteration_history` and the artifact store's iteration records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationOutcome {
    pub iteration: u32,
    pub coder_summary: String,
    pub verdict: ReviewVerdict,
    pub feedback: String,
}

#[derive(Debug)]
pub enum CodingLoopOutcome {
    Approved {
        iterations_used: u32,
        final_summary: String,
        interface_exports: Option<String>,
        conventions_observed: Option<String>,
    },
    /// A BLOCK verdict, or a repeated failure signature, ended the loop
    /// before the iteration budget ran out.
    Blocked {
        iterations_used: u32,
        reason: String,
    },
    /// `max_coding_iterations` passes were used without an APPROVE.
    Exhausted { iterations_used: u32 },
}

fn constraints(model: &str) -> Constraints {
    Constraints::new(model, Duration::from_secs(2700), 150)
}

/// Drives a single issue through the coding loop. `gate_outcome` is supplied
/// by the caller per iteration (the result of running the issue's worktree
/// through the deterministic verifier pipeline after the coder call).
pub struct CodingLoop<'a> {
    invoker: &'a AgentInvoker,
    max_iterations: u32,
}

impl<'a> CodingLoop<'a> {
    pub fn new(invoker: &'a AgentInvoker, max_iterations: u32) -> Self {
        Self { invoker, max_iterations }
    }

    /// `run_gate` executes the deterministic verification gate against the
    /// worktree after each coder call and returns its outcome; kept generic
    /// over an async closure so the loop itself has no filesystem/process
    /// dependency.
    pub async fn run<F, Fut>(
        &self,
        issue: &mut Issue,
        codebase_conventions: Option<&str>,
        dependency_interfaces: &[(&str, &str)],
        mut run_gate: F,
    ) -> Result<CodingLoopOutcome, InvocationError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = GateOutcome>,
    {
        let mut history: Vec<IterationOutcome> = Vec::new();
        let mut last_signature: Option<String> = None;

        loop {
            if issue.iterations_used >= self.max_iterations {
                return Ok(CodingLoopOutcome::Exhausted {
                    iterations_used: issue.iterations_used,
                });
            }
            issue.iterations_used += 1;
            let iteration = issue.iterations_used;

            let coder_inputs = CoderInputs {
                issue,
                codebase_conventions,
                dependency_interfaces,
            };
            let coder: CoderResponse = self
                .invoker
                .invoke(Role::Coder, &coder_inputs, Role::Coder.default_tools(), &constraints("coder-default"))
                .await?;

            let gate_outcome = run_gate().await;

            let (verdict, feedback, signature) = if issue.guidance.needs_deeper_qa {
                self.run_flagged_review(issue, &coder.summary, gate_outcome).await?
            } else {
                self.run_default_review(issue, &coder.summary, gate_outcome).await?
            };

            history.push(IterationOutcome {
                iteration,
                coder_summary: coder.summary.clone(),
                verdict,
                feedback: feedback.clone(),
            });

            match verdict {
                ReviewVerdict::Approve => {
                    return Ok(CodingLoopOutcome::Approved {
                        iterations_used: iteration,
                        final_summary: coder.summary,
                        interface_exports: coder.interface_exports,
                        conventions_observed: coder.conventions_observed,
                    });
                }
                ReviewVerdict::Block => {
                    return Ok(CodingLoopOutcome::Blocked {
                        iterations_used: iteration,
                        reason: feedback,
                    });
                }
                ReviewVerdict::Fix => {
                    if signature.is_some() && signature == last_signature {
                        tracing::warn!(
                            issue = %issue.name,
                            iteration,
                            "repeated failure signature across consecutive FIX verdicts; forcing BLOCK"
                        );
                        return Ok(CodingLoopOutcome::Blocked {
                            iterations_used: iteration,
                            reason: format!("stuck: repeated failure signature — {feedback}"),
                        });
                    }
                    last_signature = signature;
                    issue.previous_error = Some(feedback);
                }
            }
        }
    }

    async fn run_default_review(
        &self,
        issue: &Issue,
        coder_summary: &str,
        gate_outcome: GateOutcome,
    ) -> Result<(ReviewVerdict, String, Option<String>), InvocationError> {
        let inputs = ReviewerInputs {
            issue,
            coder_summary,
            gate_outcome,
        };
        let response: ReviewerResponse = self
            .invoker
            .invoke(Role::Reviewer, &inputs, Role::Reviewer.default_tools(), &constraints("reviewer-default"))
            .await?;
        Ok((response.verdict, response.feedback, response.failure_signature))
    }

    async fn run_flagged_review(
        &self,
        issue: &Issue,
        coder_summary: &str,
        gate_outcome: GateOutcome,
    ) -> Result<(ReviewVerdict, String, Option<String>), InvocationError> {
        let reviewer_inputs = ReviewerInputs {
            issue,
            coder_summary,
            gate_outcome,
        };
        let qa_inputs = QaInputs { issue, coder_summary };

        let (reviewer, qa) = futures::future::join(
            self.invoker
                .invoke::<_, ReviewerResponse>(Role::Reviewer, &reviewer_inputs, Role::Reviewer.default_tools(), &constraints("reviewer-default")),
            self.invoker
                .invoke::<_, QaResponse>(Role::Qa, &qa_inputs, Role::Qa.default_tools(), &constraints("qa-default")),
        )
        .await;
        let reviewer = reviewer?;
        let qa = qa?;

        let synth_inputs = SynthesizerInputs {
            issue,
            reviewer_feedback: &reviewer.feedback,
            qa_findings: &qa.findings,
            reviewer_verdict: reviewer.verdict,
            qa_verdict: qa.verdict,
        };
        let synth: SynthesizerResponse = self
            .invoker
            .invoke(Role::Synthesizer, &synth_inputs, Role::Synthesizer.default_tools(), &constraints("synthesizer-default"))
            .await?;
        Ok((synth.verdict, synth.feedback, synth.failure_signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::backend::MockAgentBackend;
    use std::sync::Arc;

    fn ok(body: &'static str) -> String {
        format!(r#"{{"status":"SUCCESS",{body}}}"#)
    }

    async fn green() -> GateOutcome {
        GateOutcome::Passed
    }

    #[tokio::test]
    async fn approve_on_first_iteration_stops_loop() {
        let mut mock = MockAgentBackend::new();
        mock.expect_complete().returning(|role, _, _| {
            Box::pin(async move {
                match role {
                    Role::Coder => Ok(ok(r#""summary":"did the thing""#)),
                    Role::Reviewer => Ok(ok(r#""verdict":"APPROVE","feedback":"ship it""#)),
                    _ => unreachable!(),
                }
            })
        });
        let invoker = AgentInvoker::new(Arc::new(mock));
        let coding_loop = CodingLoop::new(&invoker, 5);
        let mut issue = Issue::new("a", "A", 0);
        let outcome = coding_loop.run(&mut issue, None, &[], green).await.unwrap();
        assert!(matches!(outcome, CodingLoopOutcome::Approved { iterations_used: 1, .. }));
    }

    #[tokio::test]
    async fn repeated_failure_signature_forces_block() {
        let mut mock = MockAgentBackend::new();
        mock.expect_complete().returning(|role, _, _| {
            Box::pin(async move {
                match role {
                    Role::Coder => Ok(ok(r#""summary":"tried again""#)),
                    Role::Reviewer => Ok(ok(
                        r#""verdict":"FIX","feedback":"still broken","failure_signature":"E0308-thing""#,
                    )),
                    _ => unreachable!(),
                }
            })
        });
        let invoker = AgentInvoker::new(Arc::new(mock));
        let coding_loop = CodingLoop::new(&invoker, 5);
        let mut issue = Issue::new("a", "A", 0);
        let outcome = coding_loop.run(&mut issue, None, &[], green).await.unwrap();
        match outcome {
            CodingLoopOutcome::Blocked { iterations_used, reason } => {
                assert_eq!(iterations_used, 2);
                assert!(reason.contains("stuck"));
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhaustion_after_max_iterations() {
        let mut mock = MockAgentBackend::new();
        let mut signature = 0u32;
        mock.expect_complete().returning(move |role, _, _| {
            signature += 1;
            let sig = signature;
            Box::pin(async move {
                match role {
                    Role::Coder => Ok(ok(r#""summary":"tried again""#)),
                    Role::Reviewer => Ok(format!(
                        r#"{{"status":"SUCCESS","verdict":"FIX","feedback":"nope","failure_signature":"sig-{sig}"}}"#
                    )),
                    _ => unreachable!(),
                }
            })
        });
        let invoker = AgentInvoker::new(Arc::new(mock));
        let coding_loop = CodingLoop::new(&invoker, 2);
        let mut issue = Issue::new("a", "A", 0);
        let outcome = coding_loop.run(&mut issue, None, &[], green).await.unwrap();
        assert!(matches!(outcome, CodingLoopOutcome::Exhausted { iterations_used: 2 }));
    }
}

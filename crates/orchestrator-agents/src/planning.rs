//! Planning Pipeline (C4) — turns a goal into an executable `PlanResult`.
//!
//! PM → architect → bounded tech-lead review loop → sprint planner → parallel
//! issue-writer fan-out → level computation (§4.4). Nothing here mutates a
//! `DAGState`; the scheduler (C5) is what turns this into one.

use std::time::Duration;

use orchestrator_core::dag::levels::{compute_levels, detect_file_conflicts};
use orchestrator_core::{Architecture, DagError, Issue, IssueGuidance, PlanResult, Prd, ReviewVerdict, TechLeadReview};
use serde::{Deserialize, Serialize};

use crate::invocation::invoker::AgentInvoker;
use crate::invocation::types::{Constraints, InvocationError, Role};

/// Error surfaced by the planning pipeline. Every variant is fatal — there is
/// no degrade-and-continue path for planning the way there is for the
/// advisor/replanner, because a plan the scheduler can't execute is useless.
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("product manager invocation failed: {0}")]
    ProductManager(InvocationError),
    #[error("architect invocation failed: {0}")]
    Architect(InvocationError),
    #[error("tech lead invocation failed: {0}")]
    TechLead(InvocationError),
    #[error("sprint planner invocation failed: {0}")]
    SprintPlanner(InvocationError),
    #[error("issue writer invocation failed for '{issue}': {source}")]
    IssueWriter { issue: String, source: InvocationError },
    #[error("the decomposed issue graph is invalid: {0}")]
    Dag(DagError),
}

fn constraints(model: &str, timeout_secs: u64, max_turns: u32) -> Constraints {
    Constraints::new(model, Duration::from_secs(timeout_secs), max_turns)
}

#[derive(Debug, Serialize)]
struct ProductManagerInputs<'a> {
    goal: &'a str,
}

#[derive(Debug, Deserialize)]
struct ProductManagerResponse {
    prd: Prd,
}

#[derive(Debug, Serialize)]
struct ArchitectInputs<'a> {
    prd: &'a Prd,
    previous_architecture: Option<&'a Architecture>,
    tech_lead_feedback: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ArchitectResponse {
    architecture: Architecture,
}

#[derive(Debug, Serialize)]
struct TechLeadInputs<'a> {
    prd: &'a Prd,
    architecture: &'a Architecture,
}

#[derive(Debug, Deserialize)]
struct TechLeadResponse {
    verdict: ReviewVerdict,
    feedback: String,
}

/// Skeleton issue emitted by the sprint planner; filled in per-issue by the
/// issue writer fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IssueSkeleton {
    name: String,
    title: String,
    depends_on: std::collections::BTreeSet<String>,
    guidance: IssueGuidance,
}

#[derive(Debug, Serialize)]
struct SprintPlannerInputs<'a> {
    prd: &'a Prd,
    architecture: &'a Architecture,
}

#[derive(Debug, Deserialize)]
struct SprintPlannerResponse {
    issues: Vec<IssueSkeleton>,
    rationale: String,
}

#[derive(Debug, Serialize)]
struct IssueWriterInputs<'a> {
    prd: &'a Prd,
    architecture: &'a Architecture,
    skeleton: &'a IssueSkeleton,
}

#[derive(Debug, Deserialize)]
struct IssueWriterResponse {
    description: String,
    acceptance_criteria: Vec<String>,
    files_to_create: std::collections::BTreeSet<String>,
    files_to_modify: std::collections::BTreeSet<String>,
}

pub struct PlanningPipeline {
    invoker: AgentInvoker,
    /// §6 `max_review_iterations`: the architect gets this many *revision*
    /// rounds after the first submission, i.e. `max_review_iterations + 1`
    /// tech-lead calls total.
    max_review_iterations: u32,
}

impl PlanningPipeline {
    pub fn new(invoker: AgentInvoker, max_review_iterations: u32) -> Self {
        Self {
            invoker,
            max_review_iterations,
        }
    }

    pub async fn plan(&self, goal: &str) -> Result<PlanResult, PlanningError> {
        let prd = self.run_product_manager(goal).await?;

        if prd.requirements.is_empty() {
            return Ok(PlanResult::empty(goal));
        }

        let (architecture, tech_lead_review) = self.run_tech_lead_loop(&prd).await?;
        let skeletons = self.run_sprint_planner(&prd, &architecture).await?;

        if skeletons.0.is_empty() {
            return Ok(PlanResult {
                prd,
                architecture,
                tech_lead_review,
                issues: Vec::new(),
                levels: Vec::new(),
                file_conflicts: Vec::new(),
                rationale: skeletons.1,
            });
        }

        let issues = self.run_issue_writers(&prd, &architecture, skeletons.0).await?;

        let issue_map: std::collections::BTreeMap<String, Issue> =
            issues.iter().cloned().map(|i| (i.name.clone(), i)).collect();
        let levels = compute_levels(&issue_map).map_err(PlanningError::Dag)?;
        let file_conflicts = detect_file_conflicts(&issue_map, &levels);

        Ok(PlanResult {
            prd,
            architecture,
            tech_lead_review,
            issues,
            levels,
            file_conflicts,
            rationale: skeletons.1,
        })
    }

    async fn run_product_manager(&self, goal: &str) -> Result<Prd, PlanningError> {
        let inputs = ProductManagerInputs { goal };
        let c = constraints("product-manager-default", 2700, 150);
        let response: ProductManagerResponse = self
            .invoker
            .invoke(Role::ProductManager, &inputs, Role::ProductManager.default_tools(), &c)
            .await
            .map_err(PlanningError::ProductManager)?;
        Ok(response.prd)
    }

    /// Runs architect → tech lead, revising up to `max_review_iterations`
    /// times. Per §4.4 step 3, the loop never blocks: the last architecture
    /// produced is accepted even if the tech lead never approves it.
    async fn run_tech_lead_loop(&self, prd: &Prd) -> Result<(Architecture, TechLeadReview), PlanningError> {
        let mut architecture = self.run_architect(prd, None, None).await?;
        let mut rounds_used = 0;

        loop {
            let tl_inputs = TechLeadInputs {
                prd,
                architecture: &architecture,
            };
            let c = constraints("tech-lead-default", 2700, 150);
            let response: TechLeadResponse = self
                .invoker
                .invoke(Role::TechLead, &tl_inputs, Role::TechLead.default_tools(), &c)
                .await
                .map_err(PlanningError::TechLead)?;
            rounds_used += 1;

            if response.verdict == ReviewVerdict::Approved {
                return Ok((
                    architecture,
                    TechLeadReview {
                        verdict: ReviewVerdict::Approved,
                        feedback: response.feedback,
                        rounds_used,
                        exhausted: false,
                    },
                ));
            }

            if rounds_used > self.max_review_iterations {
                tracing::warn!(
                    rounds_used,
                    max = self.max_review_iterations,
                    "tech-lead review exhausted without approval; accepting last revision"
                );
                return Ok((
                    architecture,
                    TechLeadReview {
                        verdict: ReviewVerdict::NeedsRevision,
                        feedback: response.feedback,
                        rounds_used,
                        exhausted: true,
                    },
                ));
            }

            architecture = self.run_architect(prd, Some(&architecture), Some(&response.feedback)).await?;
        }
    }

    async fn run_architect(
        &self,
        prd: &Prd,
        previous_architecture: Option<&Architecture>,
        tech_lead_feedback: Option<&str>,
    ) -> Result<Architecture, PlanningError> {
        let inputs = ArchitectInputs {
            prd,
            previous_architecture,
            tech_lead_feedback,
        };
        let c = constraints("architect-default", 2700, 150);
        let response: ArchitectResponse = self
            .invoker
            .invoke(Role::Architect, &inputs, Role::Architect.default_tools(), &c)
            .await
            .map_err(PlanningError::Architect)?;
        let mut architecture = response.architecture;
        architecture.revision = previous_architecture.map(|a| a.revision + 1).unwrap_or(0);
        Ok(architecture)
    }

    async fn run_sprint_planner(
        &self,
        prd: &Prd,
        architecture: &Architecture,
    ) -> Result<(Vec<IssueSkeleton>, String), PlanningError> {
        let inputs = SprintPlannerInputs { prd, architecture };
        let c = constraints("sprint-planner-default", 2700, 150);
        let response: SprintPlannerResponse = self
            .invoker
            .invoke(Role::SprintPlanner, &inputs, Role::SprintPlanner.default_tools(), &c)
            .await
            .map_err(PlanningError::SprintPlanner)?;
        Ok((response.issues, response.rationale))
    }

    /// Fans out one issue-writer invocation per skeleton concurrently, then
    /// assigns sequence numbers in the skeleton's emitted order so branch
    /// names stay deterministic regardless of fan-out completion order.
    async fn run_issue_writers(
        &self,
        prd: &Prd,
        architecture: &Architecture,
        skeletons: Vec<IssueSkeleton>,
    ) -> Result<Vec<Issue>, PlanningError> {
        let calls = skeletons.iter().map(|skeleton| {
            let inputs = IssueWriterInputs {
                prd,
                architecture,
                skeleton,
            };
            let c = constraints("issue-writer-default", 2700, 150);
            async move {
                self.invoker
                    .invoke::<_, IssueWriterResponse>(Role::IssueWriter, &inputs, Role::IssueWriter.default_tools(), &c)
                    .await
            }
        });
        let responses = futures::future::join_all(calls).await;

        let mut issues = Vec::with_capacity(skeletons.len());
        for (sequence_number, (skeleton, response)) in skeletons.into_iter().zip(responses).enumerate() {
            let response = response.map_err(|source| PlanningError::IssueWriter {
                issue: skeleton.name.clone(),
                source,
            })?;
            let mut issue = Issue::new(skeleton.name, skeleton.title, sequence_number as u32);
            issue.depends_on = skeleton.depends_on;
            issue.guidance = skeleton.guidance;
            issue.description = response.description;
            issue.acceptance_criteria = response.acceptance_criteria;
            issue.files_to_create = response.files_to_create;
            issue.files_to_modify = response.files_to_modify;
            issues.push(issue);
        }
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::backend::MockAgentBackend;
    use std::sync::{Arc, Mutex};

    fn ok(body: &'static str) -> String {
        format!(r#"{{"status":"SUCCESS",{body}}}"#)
    }

    #[tokio::test]
    async fn empty_requirements_short_circuits_to_empty_plan() {
        let mut mock = MockAgentBackend::new();
        mock.expect_complete().returning(|_, _, _| {
            Box::pin(async { Ok(ok(r#""prd":{"goal":"g","requirements":[],"acceptance_criteria":[],"scope_splits":[]}"#)) })
        });
        let pipeline = PlanningPipeline::new(AgentInvoker::new(Arc::new(mock)), 1);
        let plan = pipeline.plan("g").await.unwrap();
        assert!(plan.issues.is_empty());
        assert!(plan.levels.is_empty());
    }

    #[tokio::test]
    async fn tech_lead_approval_on_first_round_uses_one_round() {
        let calls = Arc::new(Mutex::new(0u32));
        let calls_clone = calls.clone();
        let mut mock = MockAgentBackend::new();
        mock.expect_complete().returning(move |role, _, _| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                match role {
                    Role::ProductManager => Ok(ok(
                        r#""prd":{"goal":"g","requirements":["r1"],"acceptance_criteria":[],"scope_splits":[]}"#,
                    )),
                    Role::Architect => Ok(ok(
                        r#""architecture":{"components":["a"],"decisions":[],"file_changes_summary":"","revision":0}"#,
                    )),
                    Role::TechLead => {
                        *calls.lock().unwrap() += 1;
                        Ok(ok(r#""verdict":"approved","feedback":"looks good""#))
                    }
                    Role::SprintPlanner => Ok(ok(r#""issues":[],"rationale":"no issues needed""#)),
                    _ => unreachable!("unexpected role {role:?}"),
                }
            })
        });
        let pipeline = PlanningPipeline::new(AgentInvoker::new(Arc::new(mock)), 2);
        let plan = pipeline.plan("g").await.unwrap();
        assert_eq!(plan.tech_lead_review.rounds_used, 1);
        assert!(!plan.tech_lead_review.exhausted);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn tech_lead_exhaustion_accepts_last_revision_without_blocking() {
        let mut mock = MockAgentBackend::new();
        mock.expect_complete().returning(move |role, _, _| {
            Box::pin(async move {
                match role {
                    Role::ProductManager => Ok(ok(
                        r#""prd":{"goal":"g","requirements":["r1"],"acceptance_criteria":[],"scope_splits":[]}"#,
                    )),
                    Role::Architect => Ok(ok(
                        r#""architecture":{"components":["a"],"decisions":[],"file_changes_summary":"","revision":0}"#,
                    )),
                    Role::TechLead => Ok(ok(r#""verdict":"needs_revision","feedback":"nope""#)),
                    Role::SprintPlanner => Ok(ok(r#""issues":[],"rationale":"none""#)),
                    _ => unreachable!("unexpected role {role:?}"),
                }
            })
        });
        let pipeline = PlanningPipeline::new(AgentInvoker::new(Arc::new(mock)), 1);
        let plan = pipeline.plan("g").await.unwrap();
        assert!(plan.tech_lead_review.exhausted);
        assert_eq!(plan.tech_lead_review.rounds_used, 2);
    }
}

//! `PlanResult` and the artifacts produced along the way by the Planning
//! Pipeline (C4).

use serde::{Deserialize, Serialize};

use super::issue::Issue;
use super::levels::FileConflict;

/// Emitted by the product-manager role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prd {
    pub goal: String,
    pub requirements: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub scope_splits: Vec<String>,
}

/// Emitted by the architect role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Architecture {
    pub components: Vec<String>,
    pub decisions: Vec<String>,
    pub file_changes_summary: String,
    /// Bumped on each tech-lead revision round.
    pub revision: u32,
}

/// Verdict from a single tech-lead review round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    NeedsRevision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechLeadReview {
    pub verdict: ReviewVerdict,
    pub feedback: String,
    pub rounds_used: u32,
    /// True if the bound was reached without approval and the last revision
    /// was accepted anyway (§4.4 step 3: "never block").
    pub exhausted: bool,
}

/// The output of the Planning Pipeline (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResult {
    pub prd: Prd,
    pub architecture: Architecture,
    pub tech_lead_review: TechLeadReview,
    /// Authoritative issue list in sequence-number order.
    pub issues: Vec<Issue>,
    /// Execution levels: ordered list of ordered lists of issue names.
    pub levels: Vec<Vec<String>>,
    pub file_conflicts: Vec<FileConflict>,
    pub rationale: String,
}

impl PlanResult {
    /// An empty, valid plan — used for the empty-issue-list boundary case (§8).
    pub fn empty(goal: impl Into<String>) -> Self {
        Self {
            prd: Prd {
                goal: goal.into(),
                ..Default::default()
            },
            architecture: Architecture::default(),
            tech_lead_review: TechLeadReview {
                verdict: ReviewVerdict::Approved,
                feedback: String::new(),
                rounds_used: 0,
                exhausted: false,
            },
            issues: Vec::new(),
            levels: Vec::new(),
            file_conflicts: Vec::new(),
            rationale: "no issues decomposed from goal".to_string(),
        }
    }
}

//! Issue and related types — the unit of work tracked by the scheduler.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Coarse size estimate attached by the sprint planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatedScope {
    Trivial,
    Small,
    Medium,
    Large,
}

/// Risk-routing record produced by the sprint planner alongside each issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueGuidance {
    pub needs_new_tests: bool,
    pub estimated_scope: EstimatedScope,
    pub touches_interfaces: bool,
    /// Selects the flagged (4-call) vs default (2-call) coding loop path.
    pub needs_deeper_qa: bool,
    pub testing_guidance: String,
    pub review_focus: String,
    pub risk_rationale: String,
}

impl Default for IssueGuidance {
    fn default() -> Self {
        Self {
            needs_new_tests: false,
            estimated_scope: EstimatedScope::Medium,
            touches_interfaces: false,
            needs_deeper_qa: false,
            testing_guidance: String::new(),
            review_focus: String::new(),
            risk_rationale: String::new(),
        }
    }
}

/// A unit of work: becomes a git branch and a worktree at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Stable identifier; used in branch names. Unique within a run.
    pub name: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub depends_on: BTreeSet<String>,
    pub files_to_create: BTreeSet<String>,
    pub files_to_modify: BTreeSet<String>,
    pub guidance: IssueGuidance,
    /// Assigned at plan time; used for ordering and branch naming.
    pub sequence_number: u32,

    // Mutable runtime fields, written only by the scheduler/advisor/replanner.
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub debt_notes: Vec<String>,
    #[serde(default)]
    pub failure_notes: Vec<String>,
    #[serde(default)]
    pub retry_context: Option<String>,
    #[serde(default)]
    pub previous_error: Option<String>,
    /// Set by the advisor on RETRY_APPROACH; visible to the coder on the next iteration.
    #[serde(default)]
    pub approach_changes: Option<String>,
    /// Iterations consumed so far in the coding loop. Reset on RETRY_*.
    #[serde(default)]
    pub iterations_used: u32,
    /// Advisor invocations consumed so far. Never reset.
    #[serde(default)]
    pub advisor_invocations_used: u32,
}

impl Issue {
    pub fn new(name: impl Into<String>, title: impl Into<String>, sequence_number: u32) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            depends_on: BTreeSet::new(),
            files_to_create: BTreeSet::new(),
            files_to_modify: BTreeSet::new(),
            guidance: IssueGuidance::default(),
            sequence_number,
            worktree_path: None,
            branch_name: None,
            debt_notes: Vec::new(),
            failure_notes: Vec::new(),
            retry_context: None,
            previous_error: None,
            approach_changes: None,
            iterations_used: 0,
            advisor_invocations_used: 0,
        }
    }

    /// Branch-safe slug of the issue name: lowercase, non-alphanumerics collapsed to `-`.
    pub fn slug(&self) -> String {
        let mut slug = String::with_capacity(self.name.len());
        let mut prev_dash = false;
        for ch in self.name.chars() {
            if ch.is_ascii_alphanumeric() {
                slug.push(ch.to_ascii_lowercase());
                prev_dash = false;
            } else if !prev_dash {
                slug.push('-');
                prev_dash = true;
            }
        }
        slug.trim_matches('-').to_string()
    }

    /// Branch name per §4.2: `issue/{sequence_number:02d}-{slug(name)}`.
    pub fn default_branch_name(&self) -> String {
        format!("issue/{:02}-{}", self.sequence_number, self.slug())
    }

    pub fn files_touched(&self) -> BTreeSet<String> {
        self.files_to_create
            .union(&self.files_to_modify)
            .cloned()
            .collect()
    }
}

/// Sum type describing how a coding-loop/advisor pass resolved for an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueOutcome {
    Completed,
    CompletedWithDebt,
    FailedNeedsSplit,
    FailedEscalated,
    FailedUnrecoverable,
    Skipped,
}

impl IssueOutcome {
    pub fn is_terminal_success(self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithDebt)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::FailedEscalated | Self::FailedUnrecoverable)
    }
}

/// Kind of debt recorded against an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtKind {
    DroppedAcceptanceCriterion,
    MissingFunctionality,
    UnmetAcceptanceCriterion,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A typed record of incompleteness attached to an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebtItem {
    pub kind: DebtKind,
    /// Free text; may be empty for non-AC-shaped debt.
    pub criterion: String,
    pub issue_name: String,
    pub severity: Severity,
    pub justification: String,
}

impl DebtItem {
    pub fn dropped_ac(issue_name: impl Into<String>, criterion: impl Into<String>, justification: impl Into<String>) -> Self {
        Self {
            kind: DebtKind::DroppedAcceptanceCriterion,
            criterion: criterion.into(),
            issue_name: issue_name.into(),
            severity: Severity::Medium,
            justification: justification.into(),
        }
    }

    pub fn unmet_ac(issue_name: impl Into<String>, criterion: impl Into<String>) -> Self {
        Self {
            kind: DebtKind::UnmetAcceptanceCriterion,
            criterion: criterion.into(),
            issue_name: issue_name.into(),
            severity: Severity::High,
            justification: "issue failed unrecoverably".to_string(),
        }
    }
}

/// Produced by the coding loop or advisor when an issue reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueResult {
    pub issue_name: String,
    pub outcome: IssueOutcome,
    pub iterations_used: u32,
    pub final_branch: Option<String>,
    #[serde(default)]
    pub debt: Vec<DebtItem>,
    /// Populated only for FAILED_NEEDS_SPLIT.
    #[serde(default)]
    pub sub_issues: Vec<Issue>,
    pub diagnostic: String,
}

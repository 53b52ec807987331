//! Core data model for the DAG Executor: issues, decisions, plan artifacts
//! and the `DAGState` single source of truth.

pub mod decisions;
pub mod issue;
pub mod levels;
pub mod plan;
pub mod state;

pub use decisions::{AdvisorDecision, IssueUpdate, ReplanDecision, ReplanHistoryEntry};
pub use issue::{DebtItem, DebtKind, EstimatedScope, Issue, IssueGuidance, IssueOutcome, IssueResult, Severity};
pub use levels::{compute_levels, detect_file_conflicts, DagError, FileConflict};
pub use plan::{Architecture, PlanResult, Prd, ReviewVerdict, TechLeadReview};
pub use state::{AdaptationEntry, BranchMergeStatus, DAGState, GitTracking, IntegrationTestResult, MergeResult, DAG_STATE_SCHEMA_VERSION};

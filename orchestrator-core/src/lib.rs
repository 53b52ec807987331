//! Orchestrator Core
//!
//! The dependency-light half of the autonomous build orchestrator: the DAG
//! data model and scheduler control logic, the checkpoint store, the git
//! workspace manager, the verifier gate pipeline, and the escalation/friction
//! detectors. Nothing in this crate makes a network call or talks to an LLM —
//! that lives one layer up in `orchestrator-agents`, which depends on this
//! crate for its types and calls back into them from the scheduler.

#![allow(dead_code)]

pub mod checkpoint;
pub mod dag;
pub mod escalation;
pub mod feedback;
pub mod verifier;
pub mod workspace;

// Re-export core DAG data model types
pub use dag::{
    AdvisorDecision, Architecture, DAGState, DagError, DebtItem, DebtKind, EstimatedScope,
    FileConflict, GitTracking, Issue, IssueGuidance, IssueOutcome, IssueResult, IssueUpdate,
    MergeResult as DagMergeResult, PlanResult, Prd, ReplanDecision, ReplanHistoryEntry,
    ReviewVerdict, Severity, TechLeadReview,
};
pub use dag::{AdaptationEntry, BranchMergeStatus, IntegrationTestResult, DAG_STATE_SCHEMA_VERSION};

// Re-export checkpoint store types
pub use checkpoint::{ArtifactStore, StoreError as CheckpointStoreError};

// Re-export Git Workspace Manager types
pub use workspace::{GitWorkspaceError, GitWorkspaceManager, WorktreeInfo};

// Re-export verifier gate pipeline types
pub use verifier::{
    scan_diff, scan_diff_text, DiffRiskProfile, FailureSignal, GateOutcome, GateResult,
    SafetyWarning, ValidatorFeedback, ValidatorIssueType, Verifier, VerifierConfig, VerifierReport,
    WarningCategory,
};

// Re-export escalation/tier state types
pub use escalation::{EscalationReason, EscalationState, SwarmTier, TierBudget, TurnPolicy};

// Re-export friction detection types (feeds the Issue Advisor)
pub use escalation::{FrictionDetector, FrictionKind, FrictionSeverity, FrictionSignal};

// Re-export compiler error classification types
pub use feedback::{ErrorCategory, ParsedError, RustcErrorParser};

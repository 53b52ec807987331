//! Tagged-variant decision records returned by the advisor and replanner.
//!
//! Both decisions are *pure* — produced by an agent call, validated and
//! applied by the scheduler. See `dag::state` for the mutation logic.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::issue::{DebtItem, Issue};

/// Decision returned by the Issue Advisor (C7) on early-BLOCK or loop exhaustion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdvisorDecision {
    RetryModified {
        dropped_acceptance_criteria: Vec<String>,
        justification: String,
    },
    RetryApproach {
        approach_changes: String,
    },
    Split {
        sub_issues: Vec<Issue>,
    },
    AcceptWithDebt {
        debt: Vec<DebtItem>,
    },
    EscalateToReplan,
}

impl AdvisorDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RetryModified { .. } => "RETRY_MODIFIED",
            Self::RetryApproach { .. } => "RETRY_APPROACH",
            Self::Split { .. } => "SPLIT",
            Self::AcceptWithDebt { .. } => "ACCEPT_WITH_DEBT",
            Self::EscalateToReplan => "ESCALATE_TO_REPLAN",
        }
    }

    /// True for the RETRY_* family; the scheduler rejects these on the last
    /// permitted advisor invocation (§4.7) and substitutes ESCALATE_TO_REPLAN.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryModified { .. } | Self::RetryApproach { .. })
    }
}

/// Field-level updates applied to a surviving issue by a MODIFY_DAG decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueUpdate {
    #[serde(default)]
    pub acceptance_criteria: Option<Vec<String>>,
    #[serde(default)]
    pub depends_on: Option<BTreeSet<String>>,
    #[serde(default)]
    pub approach_notes: Option<String>,
}

/// Decision returned by the Replanner (C8) when any issue escalates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplanDecision {
    Continue,
    ModifyDag {
        remove_set: BTreeSet<String>,
        skip_set: BTreeSet<String>,
        update_map: BTreeMap<String, IssueUpdate>,
        add: Vec<Issue>,
    },
    ReduceScope {
        skip_set: BTreeSet<String>,
    },
    Abort,
}

impl ReplanDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::ModifyDag { .. } => "MODIFY_DAG",
            Self::ReduceScope { .. } => "REDUCE_SCOPE",
            Self::Abort => "ABORT",
        }
    }
}

/// One entry in `DAGState.replan_history` — fed back to the replanner on its
/// next invocation so it can see what was previously tried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanHistoryEntry {
    pub replan_index: u32,
    pub decision: ReplanDecision,
    pub rationale: String,
    pub triggering_issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_variants_flagged_as_retry() {
        let d = AdvisorDecision::RetryApproach {
            approach_changes: "use a different crate".into(),
        };
        assert!(d.is_retry());
        assert_eq!(d.label(), "RETRY_APPROACH");

        let d2 = AdvisorDecision::EscalateToReplan;
        assert!(!d2.is_retry());
    }

    #[test]
    fn serde_roundtrip_tagged_variant() {
        let d = ReplanDecision::ModifyDag {
            remove_set: BTreeSet::from(["c".to_string()]),
            skip_set: BTreeSet::new(),
            update_map: BTreeMap::new(),
            add: Vec::new(),
        };
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("MODIFY_DAG"));
        let back: ReplanDecision = serde_json::from_str(&json).unwrap();
        assert_eq!(back.label(), "MODIFY_DAG");
    }
}

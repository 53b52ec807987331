//! Types shared by the Agent Invocation Layer (C1) contract.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One of the roughly twenty agent roles the core calls out to.
///
/// Each role carries its own tool matrix (§6) and prompt shape; the model
/// actually used for a role is resolved at invocation time through the
/// `models` config map (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ProductManager,
    Architect,
    TechLead,
    SprintPlanner,
    IssueWriter,
    Coder,
    Reviewer,
    Qa,
    Synthesizer,
    AdvisorLite,
    Advisor,
    Replanner,
    Merger,
    IntegrationTester,
    Verifier,
    FixGenerator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProductManager => "product_manager",
            Self::Architect => "architect",
            Self::TechLead => "tech_lead",
            Self::SprintPlanner => "sprint_planner",
            Self::IssueWriter => "issue_writer",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Qa => "qa",
            Self::Synthesizer => "synthesizer",
            Self::AdvisorLite => "advisor_lite",
            Self::Advisor => "advisor",
            Self::Replanner => "replanner",
            Self::Merger => "merger",
            Self::IntegrationTester => "integration_tester",
            Self::Verifier => "verifier",
            Self::FixGenerator => "fix_generator",
        }
    }

    /// Default tool matrix for the role (§6). Callers may narrow, never widen.
    pub fn default_tools(&self) -> &'static [ToolCapability] {
        use ToolCapability::*;
        match self {
            Self::ProductManager | Self::TechLead | Self::Reviewer | Self::Verifier => {
                &[Read, Glob, Grep, BashRead]
            }
            Self::SprintPlanner | Self::Advisor | Self::Replanner => &[Read, Glob, Grep, BashRead],
            Self::Architect
            | Self::Coder
            | Self::Qa
            | Self::IssueWriter
            | Self::FixGenerator
            | Self::Merger
            | Self::IntegrationTester => &[Read, Glob, Grep, BashRead, Write, Edit, Bash],
            Self::Synthesizer | Self::AdvisorLite => &[Read, Glob, Grep, BashRead],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCapability {
    Read,
    Write,
    Edit,
    Bash,
    /// Restricted subset of Bash: read-only shell commands (status checks, `cat`, test runners
    /// invoked in check mode). See §6's "BASH-read" notation.
    BashRead,
    Glob,
    Grep,
}

/// Per-call constraints (§4.1).
#[derive(Debug, Clone)]
pub struct Constraints {
    pub timeout: Duration,
    pub max_turns: u32,
    pub model: String,
    pub permission_mode: Option<String>,
}

impl Constraints {
    pub fn new(model: impl Into<String>, timeout: Duration, max_turns: u32) -> Self {
        Self {
            timeout,
            max_turns,
            model: model.into(),
            permission_mode: None,
        }
    }

    pub fn with_permission_mode(mut self, mode: impl Into<String>) -> Self {
        self.permission_mode = Some(mode.into());
        self
    }
}

/// Status discriminant the model is expected to self-report (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
    Error,
    Cancelled,
    TimedOut,
}

/// Typed failure returned by the invocation layer. Never raised as a panic
/// or propagated as a bare `anyhow::Error` — the scheduler always sees a
/// `Result` (§4.1).
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvocationError {
    #[error("transport error calling {role}: {message}")]
    Transport { role: String, message: String },

    #[error("invocation timed out after {elapsed_secs}s calling {role}")]
    Timeout { role: String, elapsed_secs: u64 },

    #[error("response from {role} did not match expected schema: {details}")]
    SchemaMismatch { role: String, details: String },

    #[error("{role} reported non-success status {status:?}: {message}")]
    StatusError {
        role: String,
        status: ResponseStatus,
        message: String,
    },
}

/// The envelope an agent backend returns before schema validation of the
/// payload. `raw_payload` is parsed against the caller's `response_schema`
/// only when `status == Success`.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: ResponseStatus,
    pub message: String,
    pub raw_payload: String,
}

//! Agent invocation layer and driver logic for the autonomous build
//! orchestrator: per-role agent calls, the planning pipeline, the coding
//! loop, the issue advisor, the replanner, the DAG scheduler, the
//! verify-fix loop, and the four public entry points the binary drives.

pub mod advisor;
pub mod config;
pub mod invocation;
pub mod orchestrator;
pub mod planning;
pub mod replanner;
pub mod scheduler;
pub mod shared_memory;
pub mod state_machine;
pub mod verify_fix;

pub mod coding_loop;

pub use invocation::backend::{AgentBackend, RigBackend, RoleRouter};
pub use invocation::invoker::AgentInvoker;
pub use invocation::types::{Constraints, InvocationError, RawResponse, ResponseStatus, Role, ToolCapability};
pub use orchestrator::{BuildResult, BuildStatus, Orchestrator, PhaseSummary, RepoSource};
pub use scheduler::{CancelSignal, RunOutcome, Scheduler, SchedulerConfig, SchedulerError};

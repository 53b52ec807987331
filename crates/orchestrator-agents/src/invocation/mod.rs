//! Agent Invocation Layer (C1): the uniform boundary every higher-level
//! component (planning, scheduler, advisor, replanner, coding loop) calls
//! through instead of touching a model backend directly.

pub mod backend;
pub mod envelope;
pub mod invoker;
pub mod types;

pub use backend::{AgentBackend, RigBackend, RoleRouter};
pub use invoker::AgentInvoker;
pub use types::{Constraints, InvocationError, RawResponse, ResponseStatus, Role, ToolCapability};

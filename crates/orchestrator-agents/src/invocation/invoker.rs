//! `AgentInvoker` — the uniform `invoke(role, inputs, response_schema,
//! tools, constraints)` contract from §4.1, built over an `AgentBackend`.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use super::backend::AgentBackend;
use super::envelope::parse_envelope;
use super::types::{Constraints, InvocationError, ResponseStatus, Role, ToolCapability};

/// Renders role inputs into a prompt. A real deployment would template this
/// per role (prompt text is an external-collaborator concern per §1); tests
/// and the default implementation just serialize the inputs as JSON framed
/// by the role and tool matrix, matching the legacy loop's plain
/// `format_task_prompt` style.
pub fn render_prompt<T: Serialize>(role: Role, inputs: &T, tools: &[ToolCapability]) -> String {
    let inputs_json = serde_json::to_string_pretty(inputs).unwrap_or_else(|_| "{}".to_string());
    format!(
        "# Role: {}\n\n## Available tools\n{:?}\n\n## Inputs\n{inputs_json}\n\n\
         Respond with a JSON object and an explicit \"status\" field \
         (one of SUCCESS, FAILED, ERROR, CANCELLED, TIMED_OUT).",
        role.as_str(),
        tools,
    )
}

#[derive(Clone)]
pub struct AgentInvoker {
    backend: Arc<dyn AgentBackend>,
}

impl AgentInvoker {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self { backend }
    }

    /// §4.1 contract. No retries are performed here — retry is a scheduler
    /// concern (§4.1 "Retries").
    pub async fn invoke<In: Serialize, Out: DeserializeOwned>(
        &self,
        role: Role,
        inputs: &In,
        tools: &[ToolCapability],
        constraints: &Constraints,
    ) -> Result<Out, InvocationError> {
        let prompt = render_prompt(role, inputs, tools);
        let raw_text = self.backend.complete(role, &prompt, constraints).await?;
        let envelope = parse_envelope(&raw_text);

        if envelope.status != ResponseStatus::Success {
            return Err(InvocationError::StatusError {
                role: role.as_str().to_string(),
                status: envelope.status,
                message: envelope.message,
            });
        }

        serde_json::from_str::<Out>(&envelope.raw_payload).map_err(|e| InvocationError::SchemaMismatch {
            role: role.as_str().to_string(),
            details: e.to_string(),
        })
    }
}

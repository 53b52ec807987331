//! `AgentBackend` — the transport boundary the invocation layer calls
//! through. Kept as a narrow trait so the scheduler/coding-loop tests can
//! substitute a mock rather than exercising a real language-model backend.

use std::time::Duration;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openai;

use super::types::{Constraints, InvocationError, Role};

/// Transport-level call to a language-model backend for one role.
///
/// Implementations report only transport failures (`Transport`/`Timeout`) as
/// `Err`; a model's own self-reported failure status is carried in the `Ok`
/// text and decoded by `envelope::parse_envelope` one layer up (§4.1).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn complete(&self, role: Role, prompt: &str, constraints: &Constraints) -> Result<String, InvocationError>;
}

/// Backend over a single OpenAI-compatible completions endpoint (rig-core).
/// One `RigBackend` is built per inference endpoint; the `models` config map
/// (§6) selects which backend serves a given role.
pub struct RigBackend {
    client: openai::CompletionsClient,
    name: String,
}

impl RigBackend {
    pub fn new(name: impl Into<String>, base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let client = openai::CompletionsClient::builder()
            .api_key(api_key)
            .base_url(base_url)
            .build()?;
        Ok(Self {
            client,
            name: name.into(),
        })
    }
}

#[async_trait]
impl AgentBackend for RigBackend {
    async fn complete(&self, role: Role, prompt: &str, constraints: &Constraints) -> Result<String, InvocationError> {
        let agent = self
            .client
            .agent(&constraints.model)
            .name(role.as_str())
            .build();

        let call = agent.prompt(prompt);
        match tokio::time::timeout(constraints.timeout, call).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(InvocationError::Transport {
                role: role.as_str().to_string(),
                message: format!("{} backend: {e}", self.name),
            }),
            Err(_) => Err(InvocationError::Timeout {
                role: role.as_str().to_string(),
                elapsed_secs: constraints.timeout.as_secs(),
            }),
        }
    }
}

/// Routes each role to a named backend via the `models` config map.
/// Resolution order (§6): `runtime-default < models.default < models.<role>`.
pub struct RoleRouter {
    backends: std::collections::HashMap<String, std::sync::Arc<dyn AgentBackend>>,
    default_backend: String,
}

impl RoleRouter {
    pub fn new(default_backend: impl Into<String>) -> Self {
        Self {
            backends: std::collections::HashMap::new(),
            default_backend: default_backend.into(),
        }
    }

    pub fn register(mut self, name: impl Into<String>, backend: std::sync::Arc<dyn AgentBackend>) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }

    pub fn resolve(&self, backend_name: Option<&str>) -> Option<std::sync::Arc<dyn AgentBackend>> {
        let name = backend_name.unwrap_or(&self.default_backend);
        self.backends.get(name).cloned()
    }
}

pub fn default_timeout() -> Duration {
    Duration::from_secs(2700)
}

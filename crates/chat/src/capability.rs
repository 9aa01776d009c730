//! Collaborators a strategy consults before and during a send.

use parley_llm::BoxFuture;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: String,
    pub provider: String,
}

impl ModelSelection {
    pub fn new(model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
        }
    }
}

/// Usage policy lives elsewhere; strategies only see its answers.
pub trait CapabilityGate: Send + Sync {
    fn selected_model(&self) -> Option<ModelSelection>;
    fn can_send_message(&self) -> bool;
}

pub trait CredentialResolver: Send + Sync {
    fn resolve_api_key(&self, provider: String) -> BoxFuture<'_, Option<String>>;
}

pub trait PersonaResolver: Send + Sync {
    fn resolve_prompt(&self, persona_id: String) -> BoxFuture<'_, Option<String>>;
}

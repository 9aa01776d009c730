//! Token source contract shared by every chat strategy, plus the concrete
//! sources the workspace ships: an OpenAI-compatible adapter built on rig and
//! a scripted source for tests and offline sessions.

use std::sync::Arc;

mod provider;
mod rig_adapter;
mod scripted;

pub use provider::{
    ABORT_ERROR_NAME, BoxFuture, ProviderAttachment, ProviderConfig, ProviderError,
    ProviderEventStream, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker,
    ReasoningConfig, ReasoningEffort, Role, SourceCitation, StreamCanceller, StreamFailure,
    StreamRequest, TokenEvent, TokenSource, make_event_stream,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigTokenSource};
pub use scripted::{SCRIPTED_PROVIDER_ID, ScriptStep, ScriptedTokenSource};

pub fn create_token_source(mut config: ProviderConfig) -> ProviderResult<Arc<dyn TokenSource>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigTokenSource::new(config)))
        }
        SCRIPTED_PROVIDER_ID => Ok(Arc::new(ScriptedTokenSource::echo())),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-token-source",
            provider_id: config.provider_id,
        }),
    }
}

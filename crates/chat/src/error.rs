use parley_llm::ProviderError;
use parley_storage::StorageError;
use snafu::Snafu;

use super::message::Role;

/// Everything a strategy can report. Display text is user-facing.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("Please select a model before sending a message"))]
    NoModelSelected { stage: &'static str },
    #[snafu(display("You've reached your message limit"))]
    LimitReached { stage: &'static str },
    #[snafu(display("Message '{id}' was not found"))]
    MessageNotFound { stage: &'static str, id: String },
    #[snafu(display("Message '{id}' is a {actual:?} message and cannot be retried here"))]
    NotRetryable {
        stage: &'static str,
        id: String,
        expected: Role,
        actual: Role,
    },
    #[snafu(display("Message '{id}' has no user message before it"))]
    NoPreviousUserMessage { stage: &'static str, id: String },
    #[snafu(display("The message before '{id}' is a {actual:?} message, not a user message"))]
    PreviousMessageNotUser {
        stage: &'static str,
        id: String,
        actual: Role,
    },
    #[snafu(display("A response is already being generated"))]
    GenerationInProgress { stage: &'static str },
    #[snafu(display("Failed to start the response: {source}"))]
    StartStream {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("The response failed: {message}"))]
    Stream { stage: &'static str, message: String },
    #[snafu(display("Saving is unavailable: {reason}"))]
    SaveUnavailable {
        stage: &'static str,
        reason: &'static str,
    },
    #[snafu(display("There is nothing to save yet"))]
    NothingToSave { stage: &'static str },
    #[snafu(display("The backend did not accept the conversation"))]
    SaveRejected { stage: &'static str },
    #[snafu(display("Failed to save the conversation: {source}"))]
    Save {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("Backend request failed: {source}"))]
    Backend {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("'{operation}' is not supported by this backend"))]
    Unsupported {
        stage: &'static str,
        operation: &'static str,
    },
}

impl ChatError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::NoModelSelected { stage }
            | Self::LimitReached { stage }
            | Self::MessageNotFound { stage, .. }
            | Self::NotRetryable { stage, .. }
            | Self::NoPreviousUserMessage { stage, .. }
            | Self::PreviousMessageNotUser { stage, .. }
            | Self::GenerationInProgress { stage }
            | Self::StartStream { stage, .. }
            | Self::Stream { stage, .. }
            | Self::SaveUnavailable { stage, .. }
            | Self::NothingToSave { stage }
            | Self::SaveRejected { stage }
            | Self::Save { stage, .. }
            | Self::Backend { stage, .. }
            | Self::Unsupported { stage, .. } => *stage,
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

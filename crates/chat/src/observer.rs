use parley_storage::ConversationId;

use super::error::ChatError;
use super::message::ChatMessage;

/// Receives strategy notifications in the order the state changed.
///
/// Callbacks run on the task that changed the state, after its lock is
/// released, so an observer may call back into the strategy. A change made
/// from inside a callback is delivered after the callback returns.
pub trait ChatObserver: Send + Sync {
    fn on_messages_change(&self, _messages: &[ChatMessage]) {}

    fn on_streaming_state_change(&self, _is_streaming: bool) {}

    fn on_error(&self, _error: &ChatError) {}

    fn on_conversation_create(&self, _conversation_id: &ConversationId) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ChatObserver for NoopObserver {}

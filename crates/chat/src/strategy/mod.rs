//! The message-list contract a front end renders, independent of where
//! messages live.

pub mod local;
pub mod server;

use parley_llm::BoxFuture;
use parley_storage::ConversationId;

use super::error::ChatResult;
use super::message::{ChatMessage, MessageId, SendMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatMode {
    /// Streams client-side into an in-memory sequence.
    Local,
    /// Delegates every action to a durable backend.
    Server,
}

/// Validation failures (limit reached, unknown message, wrong role) are
/// reported through the observer and resolve `Ok`; returned errors are the
/// ones a caller has to act on.
pub trait ChatStrategy: Send + Sync {
    fn mode(&self) -> ChatMode;

    fn send_message(&self, request: SendMessage) -> BoxFuture<'_, ChatResult<()>>;

    fn retry_user_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>>;

    fn retry_assistant_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>>;

    fn stop_generation(&self) -> BoxFuture<'_, ChatResult<()>>;

    fn delete_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>>;

    fn edit_message(&self, id: MessageId, content: String) -> BoxFuture<'_, ChatResult<()>>;

    /// Promotes the in-memory session to durable storage.
    fn save_to_backend(&self) -> BoxFuture<'_, ChatResult<ConversationId>>;

    fn messages(&self) -> Vec<ChatMessage>;

    fn is_streaming(&self) -> bool;

    fn is_loading(&self) -> bool;

    fn has_streaming_content(&self) -> bool;

    fn cleanup(&self);
}

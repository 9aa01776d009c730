//! Durable conversation storage: the document shape a backend returns, the
//! contracts the chat layer saves and queries through, and two backends.

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId};
pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    Attachment, AttachmentKind, Citation, ConversationBatch, ConversationRecord,
    DEFAULT_CONVERSATION_TITLE, DurableMessage, MessageRole, MessageStatus, NewDurableMessage,
    assign_message_ids, derive_title,
};

pub use futures::future::BoxFuture;

/// One-shot submission of a whole conversation.
pub trait ConversationSaver: Send + Sync {
    /// Resolves to `None` when the backend declines the batch without failing.
    fn save_conversation(
        &self,
        batch: ConversationBatch,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationId>>>;
}

pub trait MessageBackend: Send + Sync {
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<DurableMessage>>>;
    fn append_message(
        &self,
        conversation_id: ConversationId,
        message: NewDurableMessage,
    ) -> BoxFuture<'_, StorageResult<DurableMessage>>;
    fn update_message_content(
        &self,
        message_id: MessageId,
        content: String,
    ) -> BoxFuture<'_, StorageResult<()>>;
    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<()>>;
    fn list_conversations(
        &self,
        user_id: String,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
}

/// Wall clock in epoch milliseconds; zero if the clock is before 1970.
pub fn unix_timestamp_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

//! Backend-owned conversations: the strategy forwards actions and exposes
//! flags the caller derives from backend documents.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parley_llm::BoxFuture;
use parley_storage::{
    ConversationId, MessageBackend, MessageRole, NewDurableMessage, unix_timestamp_millis,
};
use serde_json::Value;
use snafu::ResultExt;

use super::{ChatMode, ChatStrategy};
use crate::convert::{convert_server_messages, extract_messages_array, is_durable_message_streaming};
use crate::error::{BackendSnafu, ChatError, ChatResult, SaveUnavailableSnafu, UnsupportedSnafu};
use crate::message::{ChatMessage, MessageId, SendMessage};

/// Backend mutations bound to one conversation.
pub trait ConversationActions: Send + Sync {
    fn send_message(&self, request: SendMessage) -> BoxFuture<'_, ChatResult<()>>;

    fn stop_generation(&self) -> BoxFuture<'_, ChatResult<()>>;

    fn delete_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>>;

    fn edit_message(&self, id: MessageId, content: String) -> BoxFuture<'_, ChatResult<()>>;

    /// Regenerates from `id`, whichever role it has.
    fn retry_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerFlags {
    pub is_streaming: bool,
    pub is_loading: bool,
    pub has_streaming_content: bool,
}

impl ServerFlags {
    /// Flags for a raw message listing, keyed off its first in-progress
    /// assistant document.
    pub fn from_messages(value: &Value) -> Self {
        let Some(document) = extract_messages_array(value)
            .into_iter()
            .find(is_durable_message_streaming)
        else {
            return Self::default();
        };
        let has_content = !document.content.is_empty()
            || document.reasoning.as_deref().is_some_and(|reasoning| !reasoning.is_empty());
        Self {
            is_streaming: true,
            is_loading: !has_content,
            has_streaming_content: has_content,
        }
    }
}

pub struct ServerChatStrategy {
    actions: Arc<dyn ConversationActions>,
    flags: ArcSwap<ServerFlags>,
}

impl ServerChatStrategy {
    pub fn new(actions: Arc<dyn ConversationActions>) -> Self {
        Self {
            actions,
            flags: ArcSwap::from_pointee(ServerFlags::default()),
        }
    }

    pub fn flags(&self) -> ServerFlags {
        **self.flags.load()
    }

    pub fn set_flags(&self, flags: ServerFlags) {
        self.flags.store(Arc::new(flags));
    }

    /// Recomputes the flags from a fresh backend listing.
    pub fn sync_from_messages(&self, value: &Value) {
        self.set_flags(ServerFlags::from_messages(value));
    }
}

impl ChatStrategy for ServerChatStrategy {
    fn mode(&self) -> ChatMode {
        ChatMode::Server
    }

    fn send_message(&self, request: SendMessage) -> BoxFuture<'_, ChatResult<()>> {
        self.actions.send_message(request)
    }

    fn retry_user_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>> {
        self.actions.retry_message(id)
    }

    fn retry_assistant_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>> {
        self.actions.retry_message(id)
    }

    fn stop_generation(&self) -> BoxFuture<'_, ChatResult<()>> {
        self.actions.stop_generation()
    }

    fn delete_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>> {
        self.actions.delete_message(id)
    }

    fn edit_message(&self, id: MessageId, content: String) -> BoxFuture<'_, ChatResult<()>> {
        self.actions.edit_message(id, content)
    }

    fn save_to_backend(&self) -> BoxFuture<'_, ChatResult<ConversationId>> {
        Box::pin(async {
            SaveUnavailableSnafu {
                stage: "server-save-to-backend",
                reason: "the conversation is already stored by the backend",
            }
            .fail::<ConversationId>()
        })
    }

    fn messages(&self) -> Vec<ChatMessage> {
        Vec::new()
    }

    fn is_streaming(&self) -> bool {
        self.flags.load().is_streaming
    }

    fn is_loading(&self) -> bool {
        self.flags.load().is_loading
    }

    fn has_streaming_content(&self) -> bool {
        self.flags.load().has_streaming_content
    }

    fn cleanup(&self) {}
}

/// [`ConversationActions`] over a [`MessageBackend`]. Sends are recorded as
/// user messages; nothing generates server-side.
pub struct StorageActions<B: MessageBackend + ?Sized> {
    backend: Arc<B>,
    conversation_id: ConversationId,
}

impl<B: MessageBackend + ?Sized> StorageActions<B> {
    pub fn new(backend: Arc<B>, conversation_id: ConversationId) -> Self {
        Self {
            backend,
            conversation_id,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub async fn load_messages(&self) -> ChatResult<Vec<ChatMessage>> {
        let documents = self
            .backend
            .list_messages(self.conversation_id.clone())
            .await
            .context(BackendSnafu {
                stage: "storage-list-messages",
            })?;
        Ok(convert_server_messages(&documents))
    }
}

impl<B: MessageBackend + ?Sized> ConversationActions for StorageActions<B> {
    fn send_message(&self, request: SendMessage) -> BoxFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            if request.is_blank() {
                return Ok(());
            }
            let mut message =
                NewDurableMessage::new(MessageRole::User, request.content, unix_timestamp_millis());
            message.attachments = request.attachments;
            let stored = self
                .backend
                .append_message(self.conversation_id.clone(), message)
                .await
                .context(BackendSnafu {
                    stage: "storage-send-message",
                })?;
            tracing::debug!(
                conversation_id = %self.conversation_id,
                message_id = %stored.id,
                "recorded user message"
            );
            Ok(())
        })
    }

    fn stop_generation(&self) -> BoxFuture<'_, ChatResult<()>> {
        Box::pin(async { Ok::<(), ChatError>(()) })
    }

    fn delete_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            self.backend
                .delete_message(id)
                .await
                .context(BackendSnafu {
                    stage: "storage-delete-message",
                })
        })
    }

    fn edit_message(&self, id: MessageId, content: String) -> BoxFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            self.backend
                .update_message_content(id, content)
                .await
                .context(BackendSnafu {
                    stage: "storage-edit-message",
                })
        })
    }

    fn retry_message(&self, _id: MessageId) -> BoxFuture<'_, ChatResult<()>> {
        Box::pin(async {
            UnsupportedSnafu {
                stage: "storage-retry-message",
                operation: "retry",
            }
            .fail::<()>()
        })
    }
}

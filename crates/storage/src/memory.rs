use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use snafu::{OptionExt, ensure};

use super::error::{ConflictSnafu, NotFoundSnafu, StorageResult};
use super::ids::{ConversationId, MessageId};
use super::types::{
    ConversationBatch, ConversationRecord, DurableMessage, NewDurableMessage, assign_message_ids,
};
use super::{BoxFuture, ConversationSaver, MessageBackend, unix_timestamp_millis};

#[derive(Debug, Clone)]
struct StoredConversation {
    record: ConversationRecord,
    messages: Vec<DurableMessage>,
}

/// Process-local backend, used by tests and sessions without a database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    conversations: Arc<Mutex<HashMap<ConversationId, StoredConversation>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConversationId, StoredConversation>> {
        match self.conversations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn insert_batch(&self, batch: ConversationBatch) -> StorageResult<ConversationId> {
        ensure!(
            !batch.messages.is_empty(),
            ConflictSnafu {
                stage: "memory-save-conversation",
                entity: "conversation",
                details: "conversation batch has no messages".to_string(),
            }
        );

        let conversation_id = ConversationId::new_v7();
        let now = unix_timestamp_millis();
        let messages = assign_message_ids(batch.messages)
            .into_iter()
            .map(|(message_id, message)| {
                let creation_time = message.created_at as f64;
                message.into_durable(message_id, conversation_id.clone(), creation_time)
            })
            .collect::<Vec<_>>();

        let record = ConversationRecord {
            id: conversation_id.clone(),
            user_id: batch.user_id,
            title: batch.title,
            created_at: now,
            updated_at: now,
            message_count: messages.len() as u64,
        };
        self.lock().insert(
            conversation_id.clone(),
            StoredConversation { record, messages },
        );
        Ok(conversation_id)
    }

    fn with_message<T>(
        &self,
        message_id: &MessageId,
        stage: &'static str,
        apply: impl FnOnce(&mut StoredConversation, usize) -> T,
    ) -> StorageResult<T> {
        let mut conversations = self.lock();
        let (conversation, index) = conversations
            .values_mut()
            .find_map(|conversation| {
                let index = conversation
                    .messages
                    .iter()
                    .position(|message| &message.id == message_id)?;
                Some((conversation, index))
            })
            .context(NotFoundSnafu {
                stage,
                entity: "message",
                id: message_id.to_string(),
            })?;
        conversation.record.updated_at = unix_timestamp_millis();
        Ok(apply(conversation, index))
    }
}

impl ConversationSaver for InMemoryStorage {
    fn save_conversation(
        &self,
        batch: ConversationBatch,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationId>>> {
        Box::pin(async move { self.insert_batch(batch).map(Some) })
    }
}

impl MessageBackend for InMemoryStorage {
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<DurableMessage>>> {
        Box::pin(async move {
            let conversations = self.lock();
            let conversation = conversations.get(&conversation_id).context(NotFoundSnafu {
                stage: "memory-list-messages",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
            Ok(conversation.messages.clone())
        })
    }

    fn append_message(
        &self,
        conversation_id: ConversationId,
        message: NewDurableMessage,
    ) -> BoxFuture<'_, StorageResult<DurableMessage>> {
        Box::pin(async move {
            let mut conversations = self.lock();
            let conversation = conversations
                .get_mut(&conversation_id)
                .context(NotFoundSnafu {
                    stage: "memory-append-message",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;

            let now = unix_timestamp_millis();
            let durable = message.into_durable(MessageId::new_v7(), conversation_id.clone(), now as f64);
            conversation.messages.push(durable.clone());
            conversation.record.message_count += 1;
            conversation.record.updated_at = now;
            Ok(durable)
        })
    }

    fn update_message_content(
        &self,
        message_id: MessageId,
        content: String,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.with_message(&message_id, "memory-update-message", |conversation, index| {
                conversation.messages[index].content = content;
            })
        })
    }

    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.with_message(&message_id, "memory-delete-message", |conversation, index| {
                conversation.messages.remove(index);
                conversation.record.message_count = conversation.messages.len() as u64;
            })
        })
    }

    fn list_conversations(
        &self,
        user_id: String,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let mut records = self
                .lock()
                .values()
                .filter(|conversation| conversation.record.user_id == user_id)
                .map(|conversation| conversation.record.clone())
                .collect::<Vec<_>>();
            records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(records)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::types::MessageRole;

    fn batch() -> ConversationBatch {
        ConversationBatch::new(
            "user-1",
            vec![
                NewDurableMessage::new(MessageRole::User, "Hello", 10),
                NewDurableMessage::new(MessageRole::Assistant, "Hi there!", 11),
            ],
        )
    }

    #[tokio::test]
    async fn save_then_list_preserves_order() {
        let storage = InMemoryStorage::new();
        let id = storage.save_conversation(batch()).await.unwrap().unwrap();

        let messages = storage.list_messages(id.clone()).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[0].creation_time, 10.0);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].conversation_id.as_ref(), Some(&id));

        let conversations = storage.list_conversations("user-1".to_string()).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].title, "Hello");
        assert_eq!(conversations[0].message_count, 2);
    }

    #[tokio::test]
    async fn empty_batch_is_a_conflict() {
        let storage = InMemoryStorage::new();
        let result = storage
            .save_conversation(ConversationBatch::new("user-1", Vec::new()))
            .await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));
        assert_eq!(storage.conversation_count(), 0);
    }

    #[tokio::test]
    async fn edit_and_delete_by_message_id() {
        let storage = InMemoryStorage::new();
        let id = storage.save_conversation(batch()).await.unwrap().unwrap();
        let messages = storage.list_messages(id.clone()).await.unwrap();

        storage
            .update_message_content(messages[0].id.clone(), "Hello again".to_string())
            .await
            .unwrap();
        storage.delete_message(messages[1].id.clone()).await.unwrap();

        let remaining = storage.list_messages(id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "Hello again");

        let missing = storage.delete_message(MessageId::from("nope")).await;
        assert!(matches!(missing, Err(StorageError::NotFound { entity: "message", .. })));
    }

    #[tokio::test]
    async fn append_requires_existing_conversation() {
        let storage = InMemoryStorage::new();
        let result = storage
            .append_message(
                ConversationId::from("missing"),
                NewDurableMessage::new(MessageRole::User, "hi", 1),
            )
            .await;
        assert!(matches!(result, Err(StorageError::NotFound { entity: "conversation", .. })));
    }
}

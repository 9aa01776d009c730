//! Mapping between backend documents and the UI message model.

use parley_storage::{DurableMessage, MessageRole};
use serde::Deserialize;
use serde_json::Value;

use super::message::{ChatMessage, FinishReason, MessageId, MessageMetadata, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingMessageRef {
    pub id: MessageId,
    pub is_streaming: bool,
}

pub fn convert_server_message(document: &DurableMessage) -> ChatMessage {
    ChatMessage {
        id: document.id.clone(),
        role: Role::from(document.role),
        content: document.content.clone(),
        reasoning: document.reasoning.clone(),
        citations: document.citations.clone(),
        attachments: document.attachments.clone(),
        model: document.model.clone(),
        provider: document.provider.clone(),
        parent_id: document.parent_id.clone(),
        is_main_branch: document.is_main_branch,
        metadata: document
            .metadata
            .as_ref()
            .and_then(|metadata| decode_metadata(&document.id, metadata)),
        created_at: document
            .created_at
            .unwrap_or(document.creation_time as i64),
    }
}

pub fn convert_server_messages(documents: &[DurableMessage]) -> Vec<ChatMessage> {
    documents.iter().map(convert_server_message).collect()
}

/// Accepts a bare array or a paginated `{ "page": [...] }` envelope.
pub fn extract_messages_array(value: &Value) -> Vec<DurableMessage> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(envelope) => match envelope.get("page") {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| match DurableMessage::deserialize(item) {
            Ok(document) => Some(document),
            Err(error) => {
                tracing::warn!(error = %error, "skipping undecodable message document");
                None
            }
        })
        .collect()
}

pub fn is_durable_message_streaming(document: &DurableMessage) -> bool {
    document.role == MessageRole::Assistant
        && document
            .status
            .as_ref()
            .is_some_and(|status| status.is_in_progress())
        && !document
            .metadata
            .as_ref()
            .is_some_and(raw_metadata_is_terminal)
}

pub fn is_message_streaming(message: &ChatMessage, is_generating: bool) -> bool {
    message.role == Role::Assistant
        && is_generating
        && matches!(message.finish_reason(), None | Some(FinishReason::Streaming))
}

pub fn find_streaming_message(value: &Value) -> Option<StreamingMessageRef> {
    extract_messages_array(value)
        .into_iter()
        .find(is_durable_message_streaming)
        .map(|document| StreamingMessageRef {
            id: document.id,
            is_streaming: true,
        })
}

fn decode_metadata(id: &MessageId, metadata: &Value) -> Option<MessageMetadata> {
    if !metadata.is_object() {
        tracing::debug!(message_id = %id, "dropping non-object message metadata");
        return None;
    }
    MessageMetadata::deserialize(metadata)
        .map_err(|error| {
            tracing::debug!(message_id = %id, error = %error, "dropping undecodable message metadata");
        })
        .ok()
}

// Reads raw fields so a document with partly malformed metadata is still classified.
fn raw_metadata_is_terminal(metadata: &Value) -> bool {
    let finished = metadata
        .get("finishReason")
        .and_then(Value::as_str)
        .is_some_and(|reason| FinishReason::from(reason).is_terminal());
    let stopped = metadata.get("stopped").and_then(Value::as_bool) == Some(true);
    finished || stopped
}

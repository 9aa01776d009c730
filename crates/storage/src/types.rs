use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId};

/// Title used when a conversation has no user text to derive one from.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

const TITLE_MAX_CHARS: usize = 60;

/// Storage-local message role, decoupled from the chat-layer role enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Context,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Context => "context",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "context" => Some(Self::Context),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Pdf,
    Text,
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Generation status a backend keeps on assistant documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageStatus {
    Thinking,
    Searching,
    ReadingPdf,
    Streaming,
    Done,
    Error,
    Other(String),
}

impl MessageStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Thinking => "thinking",
            Self::Searching => "searching",
            Self::ReadingPdf => "reading_pdf",
            Self::Streaming => "streaming",
            Self::Done => "done",
            Self::Error => "error",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Thinking | Self::Searching | Self::ReadingPdf | Self::Streaming
        )
    }
}

impl From<String> for MessageStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "thinking" => Self::Thinking,
            "searching" => Self::Searching,
            "reading_pdf" => Self::ReadingPdf,
            "streaming" => Self::Streaming,
            "done" => Self::Done,
            "error" => Self::Error,
            _ => Self::Other(raw),
        }
    }
}

impl From<MessageStatus> for String {
    fn from(status: MessageStatus) -> Self {
        status.as_str().to_string()
    }
}

/// A message document as the durable backend returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(rename = "_creationTime")]
    pub creation_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_main_branch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

/// One message of a conversation batch, before the backend assigns ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDurableMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
    /// Id the message had before it was stored; lets `parent_id` point at
    /// another message of the same batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_main_branch: Option<bool>,
}

impl NewDurableMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, created_at: i64) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning: None,
            model: None,
            provider: None,
            attachments: Vec::new(),
            citations: Vec::new(),
            metadata: None,
            created_at,
            client_id: None,
            parent_id: None,
            is_main_branch: None,
        }
    }

    /// The stored document once a backend has assigned ids.
    pub fn into_durable(
        self,
        id: MessageId,
        conversation_id: ConversationId,
        creation_time: f64,
    ) -> DurableMessage {
        DurableMessage {
            id,
            creation_time,
            conversation_id: Some(conversation_id),
            role: self.role,
            content: self.content,
            reasoning: self.reasoning,
            model: self.model,
            provider: self.provider,
            parent_id: self.parent_id,
            is_main_branch: Some(self.is_main_branch.unwrap_or(true)),
            status: Some(MessageStatus::Done),
            attachments: (!self.attachments.is_empty()).then_some(self.attachments),
            citations: (!self.citations.is_empty()).then_some(self.citations),
            metadata: self.metadata,
            created_at: Some(self.created_at),
        }
    }
}

/// Mints a backend id for every message of a batch and rewrites parent
/// links from client ids to the new ids. Parents outside the batch are
/// dropped.
pub fn assign_message_ids(
    messages: Vec<NewDurableMessage>,
) -> Vec<(MessageId, NewDurableMessage)> {
    let assigned = messages
        .into_iter()
        .map(|message| (MessageId::new_v7(), message))
        .collect::<Vec<_>>();
    let by_client_id = assigned
        .iter()
        .filter_map(|(id, message)| Some((message.client_id.clone()?, id.clone())))
        .collect::<HashMap<_, _>>();

    assigned
        .into_iter()
        .map(|(id, mut message)| {
            message.parent_id = message
                .parent_id
                .and_then(|parent_id| by_client_id.get(&parent_id).cloned());
            (id, message)
        })
        .collect()
}

/// A whole conversation submitted in one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationBatch {
    pub user_id: String,
    pub title: String,
    pub messages: Vec<NewDurableMessage>,
}

impl ConversationBatch {
    pub fn new(user_id: impl Into<String>, messages: Vec<NewDurableMessage>) -> Self {
        let title = derive_title(&messages);
        Self {
            user_id: user_id.into(),
            title,
            messages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub user_id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub message_count: u64,
}

/// First line of the first user message, clipped on a char boundary.
pub fn derive_title(messages: &[NewDurableMessage]) -> String {
    let Some(first_line) = messages
        .iter()
        .filter(|message| message.role == MessageRole::User)
        .find_map(|message| {
            message
                .content
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
        })
    else {
        return DEFAULT_CONVERSATION_TITLE.to_string();
    };

    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return first_line.to_string();
    }
    let clipped = first_line.chars().take(TITLE_MAX_CHARS).collect::<String>();
    format!("{}…", clipped.trim_end())
}

use std::fmt;

use parley_llm::{ProviderAttachment, ProviderMessage, ReasoningConfig};
use parley_storage::{MessageRole, NewDurableMessage};
use serde::{Deserialize, Serialize};

use super::capability::ModelSelection;

pub use parley_storage::{Attachment, AttachmentKind, Citation, ConversationId, MessageId};

/// Chat speaker role. `Context` messages are shown but never sent to a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Context,
}

impl From<MessageRole> for Role {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::System => Self::System,
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
            MessageRole::Context => Self::Context,
        }
    }
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System => Self::System,
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
            Role::Context => Self::Context,
        }
    }
}

/// Terminal classification of a generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    /// Still generating; the only non-terminal value.
    Streaming,
    Error,
    UserStopped,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::ToolCalls => "tool_calls",
            Self::Streaming => "streaming",
            Self::Error => "error",
            Self::UserStopped => "user_stopped",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Streaming)
    }
}

impl From<String> for FinishReason {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "stop" => Self::Stop,
            "length" => Self::Length,
            "content_filter" | "content-filter" => Self::ContentFilter,
            "tool_calls" | "tool-calls" => Self::ToolCalls,
            "streaming" => Self::Streaming,
            "error" => Self::Error,
            "user_stopped" => Self::UserStopped,
            _ => Self::Other(raw),
        }
    }
}

impl From<&str> for FinishReason {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<FinishReason> for String {
    fn from(reason: FinishReason) -> Self {
        reason.as_str().to_string()
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl MessageMetadata {
    pub fn finished(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Self::default()
        }
    }

    pub fn user_stopped() -> Self {
        Self {
            finish_reason: Some(FinishReason::Stop),
            stopped: Some(true),
            ..Self::default()
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped == Some(true)
    }

    /// Fields set on `other` win.
    pub fn merged(self, other: Self) -> Self {
        Self {
            finish_reason: other.finish_reason.or(self.finish_reason),
            stopped: other.stopped.or(self.stopped),
            token_count: other.token_count.or(self.token_count),
            reasoning_token_count: other.reasoning_token_count.or(self.reasoning_token_count),
            duration_ms: other.duration_ms.or(self.duration_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_main_branch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    pub created_at: i64,
}

impl ChatMessage {
    pub fn new(id: MessageId, role: Role, content: impl Into<String>, created_at: i64) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            reasoning: None,
            citations: None,
            attachments: None,
            model: None,
            provider: None,
            parent_id: None,
            is_main_branch: None,
            metadata: None,
            created_at,
        }
    }

    /// A fully formed user turn.
    pub fn user(
        id: MessageId,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
        created_at: i64,
    ) -> Self {
        Self {
            attachments: (!attachments.is_empty()).then_some(attachments),
            ..Self::new(id, Role::User, content, created_at)
        }
    }

    /// The empty assistant message a generation streams into.
    pub fn assistant_placeholder(
        id: MessageId,
        parent_id: MessageId,
        selection: &ModelSelection,
        created_at: i64,
    ) -> Self {
        Self {
            model: Some(selection.model.clone()),
            provider: Some(selection.provider.clone()),
            parent_id: Some(parent_id),
            is_main_branch: Some(true),
            ..Self::new(id, Role::Assistant, String::new(), created_at)
        }
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.finish_reason.as_ref())
    }

    pub fn is_stopped(&self) -> bool {
        self.metadata
            .as_ref()
            .is_some_and(MessageMetadata::is_stopped)
    }

    pub fn has_generated_text(&self) -> bool {
        !self.content.is_empty() || self.reasoning.as_deref().is_some_and(|r| !r.is_empty())
    }

    /// `None` for roles a model never sees.
    pub fn to_provider_message(&self) -> Option<ProviderMessage> {
        let role = match self.role {
            Role::System => parley_llm::Role::System,
            Role::User => parley_llm::Role::User,
            Role::Assistant => parley_llm::Role::Assistant,
            Role::Context => return None,
        };
        let attachments = self
            .attachments
            .iter()
            .flatten()
            .map(|attachment| ProviderAttachment {
                name: attachment.name.clone(),
                url: attachment.url.clone(),
                mime_type: attachment.mime_type.clone(),
                content: attachment.content.clone(),
            })
            .collect();
        Some(ProviderMessage::new(role, self.content.clone()).with_attachments(attachments))
    }

    /// Batch entry for promotion. The backend assigns new ids and maps
    /// `parent_id` through `client_id`.
    pub fn to_durable(&self) -> NewDurableMessage {
        let metadata = self.metadata.as_ref().and_then(|metadata| {
            serde_json::to_value(metadata)
                .map_err(|error| {
                    tracing::debug!(message_id = %self.id, error = %error, "dropping unserializable metadata");
                })
                .ok()
        });
        NewDurableMessage {
            role: self.role.into(),
            content: self.content.clone(),
            reasoning: self.reasoning.clone(),
            model: self.model.clone(),
            provider: self.provider.clone(),
            attachments: self.attachments.clone().unwrap_or_default(),
            citations: self.citations.clone().unwrap_or_default(),
            metadata,
            created_at: self.created_at,
            client_id: Some(self.id.clone()),
            parent_id: self.parent_id.clone(),
            is_main_branch: self.is_main_branch,
        }
    }
}

/// Partial update; `Some` fields replace the stored value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub citations: Option<Vec<Citation>>,
    pub metadata: Option<MessageMetadata>,
}

impl MessagePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn reasoning(reasoning: impl Into<String>) -> Self {
        Self {
            reasoning: Some(reasoning.into()),
            ..Self::default()
        }
    }

    pub fn citations(citations: Vec<Citation>) -> Self {
        Self {
            citations: Some(citations),
            ..Self::default()
        }
    }

    pub fn metadata(metadata: MessageMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::default()
        }
    }

    pub(crate) fn apply_to(self, message: &mut ChatMessage) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(reasoning) = self.reasoning {
            message.reasoning = Some(reasoning);
        }
        if let Some(citations) = self.citations {
            message.citations = Some(citations);
        }
        if let Some(metadata) = self.metadata {
            message.metadata = Some(metadata);
        }
    }
}

/// Input of one send.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SendMessage {
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub persona_id: Option<String>,
    /// Explicit persona text; wins over `persona_id`.
    pub persona_prompt: Option<String>,
    pub reasoning: Option<ReasoningConfig>,
}

impl SendMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_persona_id(mut self, persona_id: impl Into<String>) -> Self {
        self.persona_id = Some(persona_id.into());
        self
    }

    pub fn with_persona_prompt(mut self, persona_prompt: impl Into<String>) -> Self {
        self.persona_prompt = Some(persona_prompt.into());
        self
    }

    pub fn with_reasoning(mut self, reasoning: ReasoningConfig) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty() && self.attachments.is_empty()
    }
}

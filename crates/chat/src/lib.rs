//! Chat message streaming and strategy engine.
//!
//! A front end holds an `Arc<dyn ChatStrategy>` and renders whatever the
//! strategy reports through its [`ChatObserver`]. The local strategy streams
//! tokens client-side into an in-memory sequence; the server strategy
//! forwards every action to a durable backend.

pub mod capability;
pub mod convert;
pub mod error;
pub mod message;
pub mod observer;
pub mod store;
pub mod strategy;
pub mod stream;

pub use capability::{CapabilityGate, CredentialResolver, ModelSelection, PersonaResolver};
pub use convert::{
    StreamingMessageRef, convert_server_message, convert_server_messages, extract_messages_array,
    find_streaming_message, is_durable_message_streaming, is_message_streaming,
};
pub use error::{ChatError, ChatResult};
pub use message::{
    Attachment, AttachmentKind, ChatMessage, Citation, ConversationId, FinishReason,
    MessageId, MessageMetadata, MessagePatch, Role, SendMessage,
};
pub use observer::{ChatObserver, NoopObserver};
pub use strategy::local::{GenerationOptions, LocalChatStrategy};
pub use strategy::server::{ConversationActions, ServerChatStrategy, ServerFlags, StorageActions};
pub use strategy::{ChatMode, ChatStrategy};
pub use stream::{Generation, StreamState, StreamTarget, StreamTransition, StreamTransitionRejection};

pub use parley_llm::BoxFuture;

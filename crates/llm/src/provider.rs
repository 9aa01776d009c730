use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

/// Error name a token source uses when a stream ends because it was cancelled.
pub const ABORT_ERROR_NAME: &str = "AbortError";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// An attachment already resolved to a URL, optionally with inline text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAttachment {
    pub name: String,
    pub url: String,
    pub mime_type: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
    pub attachments: Vec<ProviderAttachment>,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<ProviderAttachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model_id: String,
    pub provider_id: String,
    pub messages: Vec<ProviderMessage>,
    pub api_key: Option<String>,
    pub reasoning: Option<ReasoningConfig>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl StreamRequest {
    pub fn new(
        model_id: impl Into<String>,
        provider_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            provider_id: provider_id.into(),
            messages,
            api_key: None,
            reasoning: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_reasoning(mut self, reasoning: ReasoningConfig) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// The last user turn, which is what echo-style sources answer.
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCitation {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Error raised by a stream after it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    pub name: Option<String>,
    pub message: String,
}

impl StreamFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
        }
    }

    pub fn aborted() -> Self {
        Self {
            name: Some(ABORT_ERROR_NAME.to_string()),
            message: "the stream was aborted".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Aborts are user cancellations rather than failures.
    pub fn is_abort(&self) -> bool {
        self.name.as_deref() == Some(ABORT_ERROR_NAME)
            || self.message.to_lowercase().contains("abort")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    Content(String),
    Reasoning(String),
    Citations(Vec<SourceCitation>),
    Finish(String),
    Error(StreamFailure),
}

impl TokenEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish(_) | Self::Error(_))
    }
}

pub use futures::future::BoxFuture;

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for model '{model_id}' has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<TokenEvent>,
}

impl ProviderEventStream {
    pub async fn recv(&mut self) -> Option<TokenEvent> {
        self.events.recv().await
    }
}

/// Signals the worker to abort its upstream stream. Dropping the canceller
/// cancels too.
#[derive(Debug)]
pub struct StreamCanceller {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl StreamCanceller {
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl Drop for StreamCanceller {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub canceller: StreamCanceller,
    pub worker: ProviderWorker,
}

pub trait TokenSource: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

pub fn make_event_stream() -> (
    mpsc::UnboundedSender<TokenEvent>,
    ProviderEventStream,
    StreamCanceller,
    oneshot::Receiver<()>,
) {
    let (event_tx, events) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream { events },
        StreamCanceller {
            cancel_tx: Some(cancel_tx),
        },
        cancel_rx,
    )
}

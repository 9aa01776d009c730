use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, MissingApiKeySnafu,
    ProviderConfig, ProviderError, ProviderMessage, ProviderResult, ProviderStreamHandle,
    ProviderWorker, Role, StreamFailure, StreamRequest, TokenEvent, TokenSource,
    make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

pub struct RigTokenSource {
    config: ProviderConfig,
}

impl RigTokenSource {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    fn resolve_api_key(&self, request: &StreamRequest) -> ProviderResult<String> {
        let api_key = request
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .unwrap_or(self.config.api_key.as_str())
            .to_string();

        ensure!(
            !api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "resolve-api-key",
                provider_id: self.config.provider_id.clone(),
            }
        );
        Ok(api_key)
    }

    fn build_client(endpoint: &str, api_key: &str) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(api_key);
        if !endpoint.is_empty() {
            builder = builder.base_url(endpoint);
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    /// Rig messages carry text only, so resolved attachments are inlined.
    fn flatten_content(message: &ProviderMessage) -> String {
        let mut content = message.content.clone();
        for attachment in &message.attachments {
            content.push_str("\n\n");
            match &attachment.content {
                Some(text) => {
                    content.push_str(&format!("[Attachment: {}]\n{}", attachment.name, text));
                }
                None => {
                    content.push_str(&format!("[Attachment: {}]({})", attachment.name, attachment.url));
                }
            }
        }
        content
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(Self::flatten_content(message))),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    /// Rig takes one preamble; every system turn is folded into it.
    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let parts = request
            .messages
            .iter()
            .filter(|message| message.role == Role::System && !message.content.trim().is_empty())
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    fn reasoning_params(request: &StreamRequest) -> Option<serde_json::Value> {
        let reasoning = request.reasoning.filter(|reasoning| reasoning.enabled)?;
        let effort = reasoning.effort.map(|effort| effort.as_str()).unwrap_or("medium");
        Some(serde_json::json!({
            "reasoning": { "effort": effort, "summary": "auto" }
        }))
    }

    async fn open_stream(
        endpoint: &str,
        api_key: &str,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(endpoint, api_key)?;
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                model_id: request.model_id.clone(),
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        if let Some(params) = Self::reasoning_params(request) {
            builder = builder.additional_params(params);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<TokenEvent>
    where
        R: Clone + Unpin,
    {
        let event = match item {
            StreamedAssistantContent::Text(text) => TokenEvent::Content(text.text),
            StreamedAssistantContent::Reasoning(reasoning) => {
                let text = reasoning.reasoning.join("");
                if text.is_empty() {
                    return None;
                }
                TokenEvent::Reasoning(text)
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                if reasoning.is_empty() {
                    return None;
                }
                TokenEvent::Reasoning(reasoning)
            }
            StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => return None,
        };

        Some(event)
    }

    fn emit_error(event_tx: &mpsc::UnboundedSender<TokenEvent>, error: &ProviderError) {
        let _ = event_tx.send(TokenEvent::Error(StreamFailure::new(error.to_string())));
    }

    async fn run_stream_worker(
        endpoint: String,
        api_key: String,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<TokenEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut stream = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(model_id = %request.model_id, "provider stream cancelled before opening");
                let _ = event_tx.send(TokenEvent::Error(StreamFailure::aborted()));
                return;
            }
            opened = Self::open_stream(&endpoint, &api_key, &request) => match opened {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::error!(
                        provider_id = %request.provider_id,
                        model_id = %request.model_id,
                        error = %error,
                        "failed to open provider stream"
                    );
                    Self::emit_error(&event_tx, &error);
                    return;
                }
            },
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(model_id = %request.model_id, "provider stream cancelled");
                    stream.cancel();
                    let _ = event_tx.send(TokenEvent::Error(StreamFailure::aborted()));
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(event) = Self::map_stream_item(item)
                                && event_tx.send(event).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                model_id = %request.model_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error(&event_tx, &error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = event_tx.send(TokenEvent::Finish("stop".to_string()));
    }
}

impl TokenSource for RigTokenSource {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                model_id: request.model_id.clone(),
            }
        );
        let api_key = self.resolve_api_key(&request)?;

        let (event_tx, stream, canceller, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.endpoint.clone(),
            api_key,
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle {
            stream,
            canceller,
            worker,
        })
    }
}

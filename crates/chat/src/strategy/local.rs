//! Client-side strategy: messages live in memory, tokens stream straight from
//! a [`TokenSource`], and the session can be promoted to durable storage once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use parley_llm::{
    BoxFuture, ProviderStreamHandle, ReasoningConfig, StreamCanceller, StreamRequest, TokenEvent,
    TokenSource,
};
use parley_storage::{
    ConversationBatch, ConversationId, ConversationSaver, unix_timestamp_millis,
};
use snafu::{OptionExt, ensure};
use tokio::sync::Notify;

use super::{ChatMode, ChatStrategy};
use crate::capability::{CapabilityGate, CredentialResolver, ModelSelection, PersonaResolver};
use crate::error::{
    ChatError, ChatResult, GenerationInProgressSnafu, LimitReachedSnafu, MessageNotFoundSnafu,
    NoModelSelectedSnafu, NoPreviousUserMessageSnafu, NotRetryableSnafu, NothingToSaveSnafu,
    PreviousMessageNotUserSnafu, SaveRejectedSnafu, SaveUnavailableSnafu,
};
use crate::message::{
    Attachment, ChatMessage, Citation, FinishReason, MessageId, MessageMetadata, MessagePatch, Role,
    SendMessage,
};
use crate::observer::{ChatObserver, NoopObserver};
use crate::store::{add_message, find_message, remove_message, truncate_before, update_message};
use crate::stream::{
    EventFlow, Generation, GenerationSink, StreamState, StreamTarget, StreamTransition,
    build_history, drive,
};

const ENDED_WITHOUT_TERMINAL: &str = "provider stream ended before a terminal event";

/// Per-strategy generation parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

enum Notice {
    Messages(Vec<ChatMessage>),
    Streaming(bool),
    Error(ChatError),
    ConversationCreated(ConversationId),
}

struct ActiveGeneration {
    target: StreamTarget,
    canceller: Option<StreamCanceller>,
    stop: Arc<Notify>,
    started_at: Instant,
}

impl ActiveGeneration {
    fn halt(&mut self) {
        if let Some(canceller) = self.canceller.as_mut() {
            canceller.cancel();
        }
        self.stop.notify_one();
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Default)]
struct ConversationState {
    messages: Vec<ChatMessage>,
    stream: StreamState,
    generation: Option<ActiveGeneration>,
    next_generation: u64,
    last_timestamp: i64,
    // Notices queue in mutation order; whoever sets `delivering` drains them.
    outbox: VecDeque<Notice>,
    delivering: bool,
}

impl ConversationState {
    /// Strictly increasing so messages created together keep their order.
    fn tick(&mut self) -> i64 {
        self.last_timestamp = unix_timestamp_millis().max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn publish(&mut self, notice: Notice) {
        self.outbox.push_back(notice);
    }

    fn publish_messages(&mut self) {
        self.outbox.push_back(Notice::Messages(self.messages.clone()));
    }

    fn start_generation(
        &mut self,
        message_id: MessageId,
        stage: &'static str,
    ) -> ChatResult<StreamTarget> {
        let target = StreamTarget::new(Generation(self.next_generation + 1), message_id);
        match self.stream.apply(StreamTransition::Start(target.clone())) {
            Ok(next) => {
                self.stream = next;
                self.next_generation += 1;
            }
            Err(rejection) => {
                tracing::warn!(?rejection, stage, "rejected a second concurrent generation");
                return GenerationInProgressSnafu { stage }.fail();
            }
        }

        self.generation = Some(ActiveGeneration {
            target: target.clone(),
            canceller: None,
            stop: Arc::new(Notify::new()),
            started_at: Instant::now(),
        });
        Ok(target)
    }

    fn transition(&mut self, transition: StreamTransition) -> bool {
        match self.stream.apply(transition) {
            Ok(next) => {
                self.stream = next;
                true
            }
            Err(rejection) => {
                tracing::debug!(?rejection, "ignoring stream transition");
                false
            }
        }
    }

    /// Drops the generation record, which also releases its canceller.
    fn end_generation(&mut self) -> Option<u64> {
        self.generation
            .take()
            .map(|generation| generation.elapsed_ms())
    }

    fn patch(&mut self, id: &MessageId, patch: MessagePatch) {
        self.messages = update_message(&self.messages, id, patch);
    }

    fn merge_metadata(&mut self, id: &MessageId, metadata: MessageMetadata) {
        let existing = find_message(&self.messages, id)
            .and_then(|(_, message)| message.metadata.clone())
            .unwrap_or_default();
        self.patch(id, MessagePatch::metadata(existing.merged(metadata)));
    }

    fn append_content(&mut self, id: &MessageId, chunk: &str) {
        let Some((_, message)) = find_message(&self.messages, id) else {
            return;
        };
        let content = format!("{}{chunk}", message.content);
        self.patch(id, MessagePatch::content(content));
    }

    fn append_reasoning(&mut self, id: &MessageId, chunk: &str) {
        let Some((_, message)) = find_message(&self.messages, id) else {
            return;
        };
        let reasoning = format!("{}{chunk}", message.reasoning.as_deref().unwrap_or_default());
        self.patch(id, MessagePatch::reasoning(reasoning));
    }

    /// Starts a generation, optionally cutting the sequence to `[..keep]`,
    /// then appends the user message and its placeholder. Nothing changes
    /// when another generation is active.
    fn begin_exchange(
        &mut self,
        keep: Option<usize>,
        content: String,
        attachments: Vec<Attachment>,
        selection: &ModelSelection,
        stage: &'static str,
    ) -> ChatResult<StreamTarget> {
        let user_id = MessageId::new_v7();
        let placeholder_id = MessageId::new_v7();
        let target = self.start_generation(placeholder_id.clone(), stage)?;

        if let Some(keep) = keep {
            self.messages = truncate_before(&self.messages, keep);
            self.publish_messages();
        }
        let user = ChatMessage::user(user_id.clone(), content, attachments, self.tick());
        let placeholder =
            ChatMessage::assistant_placeholder(placeholder_id, user_id, selection, self.tick());
        self.messages = add_message(&add_message(&self.messages, user), placeholder);
        self.publish_messages();
        self.publish(Notice::Streaming(true));
        Ok(target)
    }

    fn resend_index(&self, id: &MessageId, stage: &'static str) -> ChatResult<usize> {
        let (index, message) = find_message(&self.messages, id).context(MessageNotFoundSnafu {
            stage,
            id: id.as_str(),
        })?;
        ensure!(
            message.role == Role::User,
            NotRetryableSnafu {
                stage,
                id: id.as_str(),
                expected: Role::User,
                actual: message.role,
            }
        );
        Ok(index)
    }

    fn regeneration_index(&self, id: &MessageId, stage: &'static str) -> ChatResult<usize> {
        let (index, message) = find_message(&self.messages, id).context(MessageNotFoundSnafu {
            stage,
            id: id.as_str(),
        })?;
        ensure!(
            message.role == Role::Assistant,
            NotRetryableSnafu {
                stage,
                id: id.as_str(),
                expected: Role::Assistant,
                actual: message.role,
            }
        );
        let previous = index
            .checked_sub(1)
            .map(|previous| &self.messages[previous])
            .context(NoPreviousUserMessageSnafu {
                stage,
                id: id.as_str(),
            })?;
        ensure!(
            previous.role == Role::User,
            PreviousMessageNotUserSnafu {
                stage,
                id: id.as_str(),
                actual: previous.role,
            }
        );
        Ok(index)
    }

    fn fail(&mut self, target: &StreamTarget, error: ChatError) -> bool {
        let transition = StreamTransition::Fail {
            target: target.clone(),
            message: error.to_string(),
        };
        if !self.transition(transition) {
            return false;
        }
        self.end_generation();
        self.messages = remove_message(&self.messages, &target.message_id);
        self.publish_messages();
        self.publish(Notice::Streaming(false));
        self.publish(Notice::Error(error));
        true
    }

    fn apply_token_event(&mut self, target: &StreamTarget, event: TokenEvent) -> EventFlow {
        if !self.stream.accepts_stream_event(target) {
            tracing::debug!(generation = %target.generation, "ignoring event for an inactive generation");
            return EventFlow::Stale;
        }

        match event {
            TokenEvent::Content(chunk) => {
                self.transition(StreamTransition::Receive(target.clone()));
                self.append_content(&target.message_id, &chunk);
                self.publish_messages();
                EventFlow::Continue
            }
            TokenEvent::Reasoning(chunk) => {
                self.transition(StreamTransition::Receive(target.clone()));
                self.append_reasoning(&target.message_id, &chunk);
                self.publish_messages();
                EventFlow::Continue
            }
            TokenEvent::Citations(sources) => {
                self.transition(StreamTransition::Receive(target.clone()));
                let citations = sources
                    .into_iter()
                    .map(|source| Citation {
                        url: source.url,
                        title: source.title,
                    })
                    .collect();
                self.patch(&target.message_id, MessagePatch::citations(citations));
                self.publish_messages();
                EventFlow::Continue
            }
            TokenEvent::Finish(reason) => {
                self.transition(StreamTransition::Complete(target.clone()));
                let metadata = MessageMetadata {
                    finish_reason: Some(FinishReason::from(reason)),
                    duration_ms: self.end_generation(),
                    ..MessageMetadata::default()
                };
                self.merge_metadata(&target.message_id, metadata);
                self.publish_messages();
                self.publish(Notice::Streaming(false));
                tracing::debug!(generation = %target.generation, "generation finished");
                EventFlow::Terminal
            }
            TokenEvent::Error(failure) if failure.is_abort() => {
                self.transition(StreamTransition::Cancel(target.clone()));
                let metadata = MessageMetadata {
                    duration_ms: self.end_generation(),
                    ..MessageMetadata::user_stopped()
                };
                self.merge_metadata(&target.message_id, metadata);
                self.publish_messages();
                self.publish(Notice::Streaming(false));
                tracing::debug!(generation = %target.generation, "generation aborted by transport");
                EventFlow::Terminal
            }
            TokenEvent::Error(failure) => {
                tracing::error!(
                    generation = %target.generation,
                    error_name = failure.name.as_deref().unwrap_or("Error"),
                    error = %failure.message,
                    "provider stream failed"
                );
                self.fail(
                    target,
                    ChatError::Stream {
                        stage: "stream-event",
                        message: failure.message,
                    },
                );
                EventFlow::Terminal
            }
        }
    }
}

pub struct LocalChatStrategy {
    state: Mutex<ConversationState>,
    source: Arc<dyn TokenSource>,
    gate: Arc<dyn CapabilityGate>,
    credentials: Arc<dyn CredentialResolver>,
    personas: Option<Arc<dyn PersonaResolver>>,
    saver: Option<Arc<dyn ConversationSaver>>,
    user_id: Option<String>,
    observer: Arc<dyn ChatObserver>,
    options: GenerationOptions,
}

impl LocalChatStrategy {
    pub fn new(
        source: Arc<dyn TokenSource>,
        gate: Arc<dyn CapabilityGate>,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Self {
        Self {
            state: Mutex::new(ConversationState::default()),
            source,
            gate,
            credentials,
            personas: None,
            saver: None,
            user_id: None,
            observer: Arc::new(NoopObserver),
            options: GenerationOptions::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ChatObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_persona_resolver(mut self, personas: Arc<dyn PersonaResolver>) -> Self {
        self.personas = Some(personas);
        self
    }

    pub fn with_saver(mut self, saver: Arc<dyn ConversationSaver>) -> Self {
        self.saver = Some(saver);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock_state().messages.clone()
    }

    pub fn stream_state(&self) -> StreamState {
        self.lock_state().stream.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock_state().stream.is_active()
    }

    /// True between send and the first provider event.
    pub fn is_loading(&self) -> bool {
        self.lock_state().stream.is_sending()
    }

    pub fn has_streaming_content(&self) -> bool {
        let state = self.lock_state();
        match &state.stream {
            StreamState::Streaming(target) => find_message(&state.messages, &target.message_id)
                .is_some_and(|(_, message)| message.has_generated_text()),
            _ => false,
        }
    }

    pub async fn send_message(&self, request: SendMessage) -> ChatResult<()> {
        const STAGE: &str = "send-message";
        if request.is_blank() {
            return Ok(());
        }
        let Some(selection) = self.admit(STAGE)? else {
            return Ok(());
        };

        let SendMessage {
            content,
            attachments,
            persona_id,
            persona_prompt,
            reasoning,
        } = request;
        let target = self.update(|state| {
            state.begin_exchange(None, content, attachments, &selection, STAGE)
        })?;

        tracing::debug!(
            generation = %target.generation,
            model = %selection.model,
            provider = %selection.provider,
            "send started"
        );
        let persona_prompt = self.resolve_persona(persona_prompt, persona_id).await;
        self.generate(target, selection, persona_prompt, reasoning)
            .await;
        Ok(())
    }

    /// Cuts the sequence before `id` and sends its content again. The gate
    /// and model are checked before anything is removed.
    pub async fn retry_user_message(&self, id: &MessageId) -> ChatResult<()> {
        const STAGE: &str = "retry-user-message";
        ensure!(!self.is_streaming(), GenerationInProgressSnafu { stage: STAGE });
        let validation = self.lock_state().resend_index(id, STAGE);
        if let Err(error) = validation {
            self.report(error);
            return Ok(());
        }
        let Some(selection) = self.admit(STAGE)? else {
            return Ok(());
        };

        let begun = self.update(|state| -> ChatResult<Option<StreamTarget>> {
            let index = state.resend_index(id, STAGE)?;
            let original = &state.messages[index];
            let request = SendMessage::new(original.content.clone())
                .with_attachments(original.attachments.clone().unwrap_or_default());
            if request.is_blank() {
                return Ok(None);
            }
            state
                .begin_exchange(
                    Some(index),
                    request.content,
                    request.attachments,
                    &selection,
                    STAGE,
                )
                .map(Some)
        });

        let target = match begun {
            Ok(Some(target)) => target,
            Ok(None) => return Ok(()),
            Err(error @ ChatError::GenerationInProgress { .. }) => return Err(error),
            Err(error) => {
                self.report(error);
                return Ok(());
            }
        };
        tracing::debug!(generation = %target.generation, "user message resent");
        self.generate(target, selection, None, None).await;
        Ok(())
    }

    /// Replaces the assistant message `id` with a fresh generation answering
    /// the user message right before it.
    pub async fn retry_assistant_message(&self, id: &MessageId) -> ChatResult<()> {
        const STAGE: &str = "retry-assistant-message";
        let validation = self.lock_state().regeneration_index(id, STAGE);
        if let Err(error) = validation {
            self.report(error);
            return Ok(());
        }
        let Some(selection) = self.admit(STAGE)? else {
            return Ok(());
        };

        let begun = self.update(|state| -> ChatResult<StreamTarget> {
            let index = state.regeneration_index(id, STAGE)?;
            let parent_id = state.messages[index - 1].id.clone();
            let placeholder_id = MessageId::new_v7();
            let target = state.start_generation(placeholder_id.clone(), STAGE)?;

            let placeholder =
                ChatMessage::assistant_placeholder(placeholder_id, parent_id, &selection, state.tick());
            state.messages = add_message(&truncate_before(&state.messages, index), placeholder);
            state.publish_messages();
            state.publish(Notice::Streaming(true));
            Ok(target)
        });

        let target = match begun {
            Ok(target) => target,
            Err(error @ ChatError::GenerationInProgress { .. }) => return Err(error),
            Err(error) => {
                self.report(error);
                return Ok(());
            }
        };
        self.generate(target, selection, None, None).await;
        Ok(())
    }

    /// Idempotent. The message keeps its partial content, marked stopped.
    pub fn stop_generation(&self) {
        self.update(|state| {
            let Some(target) = state.stream.active_target().cloned() else {
                return;
            };
            if let Some(generation) = state.generation.as_mut() {
                generation.halt();
            }
            state.transition(StreamTransition::Cancel(target.clone()));
            let metadata = MessageMetadata {
                duration_ms: state.end_generation(),
                ..MessageMetadata::user_stopped()
            };
            state.merge_metadata(&target.message_id, metadata);
            state.publish_messages();
            state.publish(Notice::Streaming(false));
            tracing::info!(generation = %target.generation, "generation stopped");
        });
    }

    /// Deleting the message being generated stops its generation first.
    pub fn delete_message(&self, id: &MessageId) {
        let deletes_active = self
            .lock_state()
            .stream
            .active_target()
            .is_some_and(|target| &target.message_id == id);
        if deletes_active {
            self.stop_generation();
        }

        self.update(|state| {
            if find_message(&state.messages, id).is_none() {
                return;
            }
            state.messages = remove_message(&state.messages, id);
            state.publish_messages();
        });
    }

    pub fn edit_message(&self, id: &MessageId, content: String) {
        self.update(|state| {
            if find_message(&state.messages, id).is_none() {
                return;
            }
            state.patch(id, MessagePatch::content(content));
            state.publish_messages();
        });
    }

    /// Submits every message as one batch; clears the session only once the
    /// backend returns an id.
    pub async fn save_to_backend(&self) -> ChatResult<ConversationId> {
        const STAGE: &str = "save-to-backend";
        let saver = self.saver.clone().context(SaveUnavailableSnafu {
            stage: STAGE,
            reason: "no durable backend is configured",
        })?;
        let user_id = self.user_id.clone().context(SaveUnavailableSnafu {
            stage: STAGE,
            reason: "no user is signed in",
        })?;
        let batch = self.promotion_batch(user_id, STAGE)?;
        let message_count = batch.messages.len();

        match saver.save_conversation(batch).await {
            Ok(Some(conversation_id)) => {
                self.update(|state| {
                    state.messages.clear();
                    state.publish_messages();
                    state.publish(Notice::ConversationCreated(conversation_id.clone()));
                });
                tracing::info!(
                    conversation_id = %conversation_id,
                    message_count,
                    "local conversation promoted"
                );
                Ok(conversation_id)
            }
            Ok(None) => {
                tracing::warn!(message_count, "backend declined the conversation batch");
                SaveRejectedSnafu { stage: STAGE }.fail()
            }
            Err(source) => {
                tracing::warn!(message_count, error = %source, "conversation promotion failed");
                Err(ChatError::Save {
                    stage: STAGE,
                    source,
                })
            }
        }
    }

    pub fn cleanup(&self) {
        self.stop_generation();
    }

    fn lock_state(&self) -> MutexGuard<'_, ConversationState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Applies one locked change, then delivers whatever it queued.
    fn update<R>(&self, apply: impl FnOnce(&mut ConversationState) -> R) -> R {
        let (result, should_flush) = {
            let mut state = self.lock_state();
            let result = apply(&mut state);
            let should_flush = !state.delivering && !state.outbox.is_empty();
            if should_flush {
                state.delivering = true;
            }
            (result, should_flush)
        };
        if should_flush {
            self.flush();
        }
        result
    }

    fn flush(&self) {
        loop {
            let notice = {
                let mut state = self.lock_state();
                match state.outbox.pop_front() {
                    Some(notice) => notice,
                    None => {
                        state.delivering = false;
                        return;
                    }
                }
            };
            match &notice {
                Notice::Messages(messages) => self.observer.on_messages_change(messages),
                Notice::Streaming(is_streaming) => {
                    self.observer.on_streaming_state_change(*is_streaming)
                }
                Notice::Error(error) => self.observer.on_error(error),
                Notice::ConversationCreated(conversation_id) => {
                    self.observer.on_conversation_create(conversation_id)
                }
            }
        }
    }

    fn report(&self, error: ChatError) {
        tracing::debug!(stage = error.stage(), error = %error, "reporting chat error");
        self.update(|state| state.publish(Notice::Error(error)));
    }

    fn admit(&self, stage: &'static str) -> ChatResult<Option<ModelSelection>> {
        ensure!(!self.is_streaming(), GenerationInProgressSnafu { stage });
        if !self.gate.can_send_message() {
            self.report(LimitReachedSnafu { stage }.build());
            return Ok(None);
        }
        self.gate
            .selected_model()
            .context(NoModelSelectedSnafu { stage })
            .map(Some)
    }

    async fn resolve_persona(
        &self,
        persona_prompt: Option<String>,
        persona_id: Option<String>,
    ) -> Option<String> {
        if let Some(prompt) = persona_prompt.filter(|prompt| !prompt.trim().is_empty()) {
            return Some(prompt);
        }
        let (Some(persona_id), Some(personas)) = (persona_id, self.personas.as_ref()) else {
            return None;
        };
        personas.resolve_prompt(persona_id).await
    }

    async fn generate(
        &self,
        target: StreamTarget,
        selection: ModelSelection,
        persona_prompt: Option<String>,
        reasoning: Option<ReasoningConfig>,
    ) {
        let api_key = self
            .credentials
            .resolve_api_key(selection.provider.clone())
            .await;
        let Some(request) = self.build_request(
            &target,
            &selection,
            persona_prompt.as_deref(),
            api_key,
            reasoning,
        ) else {
            tracing::debug!(generation = %target.generation, "generation stopped before its stream opened");
            return;
        };

        let handle = match self.source.stream_chat(request) {
            Ok(handle) => handle,
            Err(source) => {
                tracing::error!(
                    generation = %target.generation,
                    provider = %selection.provider,
                    error = %source,
                    "failed to open provider stream"
                );
                let error = ChatError::StartStream {
                    stage: "open-stream",
                    source,
                };
                self.update(|state| state.fail(&target, error));
                return;
            }
        };

        let ProviderStreamHandle {
            stream,
            canceller,
            worker,
        } = handle;
        let Some(stop) = self.attach_canceller(&target, canceller) else {
            tracing::debug!(generation = %target.generation, "generation stopped while its stream opened");
            return;
        };
        drive(self, &target, stream, worker, stop).await;
    }

    fn build_request(
        &self,
        target: &StreamTarget,
        selection: &ModelSelection,
        persona_prompt: Option<&str>,
        api_key: Option<String>,
        reasoning: Option<ReasoningConfig>,
    ) -> Option<StreamRequest> {
        let history = {
            let state = self.lock_state();
            if !state.stream.accepts_stream_event(target) {
                return None;
            }
            build_history(
                &state.messages,
                &target.message_id,
                self.options.system_prompt.as_deref(),
                persona_prompt,
            )
        };

        let mut request =
            StreamRequest::new(selection.model.clone(), selection.provider.clone(), history);
        if let Some(api_key) = api_key {
            request = request.with_api_key(api_key);
        }
        if let Some(reasoning) = reasoning {
            request = request.with_reasoning(reasoning);
        }
        if let Some(temperature) = self.options.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.options.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        Some(request)
    }

    /// Hands the canceller to the active generation. A generation stopped
    /// in the meantime gets `None`, and dropping the canceller aborts the
    /// transport.
    fn attach_canceller(
        &self,
        target: &StreamTarget,
        canceller: StreamCanceller,
    ) -> Option<Arc<Notify>> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if !state.stream.accepts_stream_event(target) {
            return None;
        }
        let generation = state
            .generation
            .as_mut()
            .filter(|generation| &generation.target == target)?;
        generation.canceller = Some(canceller);
        Some(generation.stop.clone())
    }

    fn promotion_batch(
        &self,
        user_id: String,
        stage: &'static str,
    ) -> ChatResult<ConversationBatch> {
        let state = self.lock_state();
        ensure!(!state.stream.is_active(), GenerationInProgressSnafu { stage });
        ensure!(!state.messages.is_empty(), NothingToSaveSnafu { stage });
        let messages = state.messages.iter().map(ChatMessage::to_durable).collect();
        Ok(ConversationBatch::new(user_id, messages))
    }
}

impl GenerationSink for LocalChatStrategy {
    fn apply_event(&self, target: &StreamTarget, event: TokenEvent) -> EventFlow {
        self.update(|state| state.apply_token_event(target, event))
    }

    fn close_without_terminal(&self, target: &StreamTarget) {
        let failed = self.update(|state| {
            state.fail(
                target,
                ChatError::Stream {
                    stage: "stream-closed",
                    message: ENDED_WITHOUT_TERMINAL.to_string(),
                },
            )
        });
        if failed {
            tracing::warn!(generation = %target.generation, "{ENDED_WITHOUT_TERMINAL}");
        }
    }
}

impl ChatStrategy for LocalChatStrategy {
    fn mode(&self) -> ChatMode {
        ChatMode::Local
    }

    fn send_message(&self, request: SendMessage) -> BoxFuture<'_, ChatResult<()>> {
        Box::pin(LocalChatStrategy::send_message(self, request))
    }

    fn retry_user_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>> {
        Box::pin(async move { LocalChatStrategy::retry_user_message(self, &id).await })
    }

    fn retry_assistant_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>> {
        Box::pin(async move { LocalChatStrategy::retry_assistant_message(self, &id).await })
    }

    fn stop_generation(&self) -> BoxFuture<'_, ChatResult<()>> {
        LocalChatStrategy::stop_generation(self);
        Box::pin(async { Ok::<(), ChatError>(()) })
    }

    fn delete_message(&self, id: MessageId) -> BoxFuture<'_, ChatResult<()>> {
        LocalChatStrategy::delete_message(self, &id);
        Box::pin(async { Ok::<(), ChatError>(()) })
    }

    fn edit_message(&self, id: MessageId, content: String) -> BoxFuture<'_, ChatResult<()>> {
        LocalChatStrategy::edit_message(self, &id, content);
        Box::pin(async { Ok::<(), ChatError>(()) })
    }

    fn save_to_backend(&self) -> BoxFuture<'_, ChatResult<ConversationId>> {
        Box::pin(LocalChatStrategy::save_to_backend(self))
    }

    fn messages(&self) -> Vec<ChatMessage> {
        LocalChatStrategy::messages(self)
    }

    fn is_streaming(&self) -> bool {
        LocalChatStrategy::is_streaming(self)
    }

    fn is_loading(&self) -> bool {
        LocalChatStrategy::is_loading(self)
    }

    fn has_streaming_content(&self) -> bool {
        LocalChatStrategy::has_streaming_content(self)
    }

    fn cleanup(&self) {
        LocalChatStrategy::cleanup(self);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{OnceLock, Weak};

    use parley_llm::{ScriptedTokenSource, StreamFailure};

    use super::*;

    struct OpenGate;

    impl CapabilityGate for OpenGate {
        fn selected_model(&self) -> Option<ModelSelection> {
            Some(ModelSelection::new("scripted-model", "scripted"))
        }

        fn can_send_message(&self) -> bool {
            true
        }
    }

    struct NoCredentials;

    impl CredentialResolver for NoCredentials {
        fn resolve_api_key(&self, _provider: String) -> BoxFuture<'_, Option<String>> {
            Box::pin(async { None })
        }
    }

    fn strategy(source: ScriptedTokenSource) -> LocalChatStrategy {
        LocalChatStrategy::new(Arc::new(source), Arc::new(OpenGate), Arc::new(NoCredentials))
    }

    /// Starts a generation by hand, the way `send_message` does before the
    /// stream opens.
    fn begin(strategy: &LocalChatStrategy) -> StreamTarget {
        let selection = ModelSelection::new("scripted-model", "scripted");
        strategy.update(|state| {
            state
                .begin_exchange(None, "hello".to_string(), Vec::new(), &selection, "test")
                .unwrap()
        })
    }

    #[test]
    fn late_finish_after_stop_keeps_stopped_metadata() {
        let strategy = strategy(ScriptedTokenSource::new(Vec::new()));
        let target = begin(&strategy);

        assert_eq!(
            strategy.apply_event(&target, TokenEvent::Content("Hi".to_string())),
            EventFlow::Continue
        );
        strategy.stop_generation();
        assert_eq!(
            strategy.apply_event(&target, TokenEvent::Finish("length".to_string())),
            EventFlow::Stale
        );
        assert_eq!(
            strategy.apply_event(&target, TokenEvent::Error(StreamFailure::new("late"))),
            EventFlow::Stale
        );

        let messages = strategy.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Hi");
        assert!(messages[1].is_stopped());
        assert_eq!(messages[1].finish_reason(), Some(&FinishReason::Stop));
        assert!(!strategy.is_streaming());
        assert!(matches!(strategy.stream_state(), StreamState::Cancelled(_)));
    }

    #[test]
    fn loading_until_first_event_then_streaming_content() {
        let strategy = strategy(ScriptedTokenSource::new(Vec::new()));
        let target = begin(&strategy);
        assert!(strategy.is_loading());
        assert!(!strategy.has_streaming_content());

        strategy.apply_event(&target, TokenEvent::Reasoning("hmm".to_string()));
        assert!(!strategy.is_loading());
        assert!(strategy.is_streaming());
        assert!(strategy.has_streaming_content());
        assert_eq!(strategy.messages()[1].reasoning.as_deref(), Some("hmm"));
    }

    #[test]
    fn closed_channel_without_terminal_is_a_failure() {
        let strategy = strategy(ScriptedTokenSource::new(Vec::new()));
        let target = begin(&strategy);
        strategy.apply_event(&target, TokenEvent::Content("partial".to_string()));

        strategy.close_without_terminal(&target);
        let messages = strategy.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert!(matches!(strategy.stream_state(), StreamState::Failed { .. }));
    }

    #[test]
    fn stop_without_active_stream_is_a_no_op() {
        let strategy = strategy(ScriptedTokenSource::new(Vec::new()));
        strategy.stop_generation();
        strategy.stop_generation();
        assert_eq!(strategy.stream_state(), StreamState::Idle);
        assert!(strategy.messages().is_empty());
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let mut state = ConversationState {
            last_timestamp: i64::MAX - 10,
            ..ConversationState::default()
        };
        let first = state.tick();
        let second = state.tick();
        assert!(second > first);
    }

    struct StopOnStart {
        strategy: OnceLock<Weak<LocalChatStrategy>>,
        streaming_changes: Mutex<Vec<bool>>,
    }

    impl ChatObserver for StopOnStart {
        fn on_streaming_state_change(&self, is_streaming: bool) {
            self.streaming_changes.lock().unwrap().push(is_streaming);
            if is_streaming
                && let Some(strategy) = self.strategy.get().and_then(Weak::upgrade)
            {
                // Re-entrant call from inside a delivery.
                assert!(strategy.is_streaming());
                strategy.stop_generation();
            }
        }
    }

    #[tokio::test]
    async fn observer_can_stop_from_inside_a_callback() {
        let observer = Arc::new(StopOnStart {
            strategy: OnceLock::new(),
            streaming_changes: Mutex::new(Vec::new()),
        });
        let source = Arc::new(ScriptedTokenSource::from_chunks(["never"]));
        let strategy = Arc::new(
            LocalChatStrategy::new(source.clone(), Arc::new(OpenGate), Arc::new(NoCredentials))
                .with_observer(observer.clone()),
        );
        observer.strategy.set(Arc::downgrade(&strategy)).ok();

        strategy.send_message(SendMessage::new("hello")).await.unwrap();

        assert_eq!(*observer.streaming_changes.lock().unwrap(), [true, false]);
        assert_eq!(source.stream_count(), 0);
        let messages = strategy.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].is_stopped());
    }
}

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_chat::{
    BoxFuture, CapabilityGate, ChatError, ChatMessage, ChatObserver, ConversationId,
    CredentialResolver, LocalChatStrategy, ModelSelection, PersonaResolver,
};
use parley_llm::ScriptedTokenSource;
use parley_storage::{ConversationBatch, ConversationSaver, StorageError, StorageResult};

pub const MODEL: &str = "scripted-model";
pub const PROVIDER: &str = "scripted";

/// Every notification in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Messages(Vec<ChatMessage>),
    Streaming(bool),
    Error(String),
    Created(ConversationId),
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn streaming_changes(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Streaming(is_streaming) => Some(is_streaming),
                _ => None,
            })
            .collect()
    }

    pub fn contents(&self) -> Vec<Vec<String>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Messages(messages) => Some(
                    messages
                        .into_iter()
                        .map(|message| message.content)
                        .collect(),
                ),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl ChatObserver for RecordingObserver {
    fn on_messages_change(&self, messages: &[ChatMessage]) {
        self.push(Event::Messages(messages.to_vec()));
    }

    fn on_streaming_state_change(&self, is_streaming: bool) {
        self.push(Event::Streaming(is_streaming));
    }

    fn on_error(&self, error: &ChatError) {
        self.push(Event::Error(error.to_string()));
    }

    fn on_conversation_create(&self, conversation_id: &ConversationId) {
        self.push(Event::Created(conversation_id.clone()));
    }
}

pub struct StaticGate {
    model: Mutex<Option<ModelSelection>>,
    can_send: AtomicBool,
}

impl StaticGate {
    pub fn open() -> Self {
        Self {
            model: Mutex::new(Some(ModelSelection::new(MODEL, PROVIDER))),
            can_send: AtomicBool::new(true),
        }
    }

    pub fn closed() -> Self {
        let gate = Self::open();
        gate.set_can_send(false);
        gate
    }

    pub fn without_model() -> Self {
        let gate = Self::open();
        gate.set_model(None);
        gate
    }

    pub fn set_can_send(&self, can_send: bool) {
        self.can_send.store(can_send, Ordering::SeqCst);
    }

    pub fn set_model(&self, model: Option<ModelSelection>) {
        *self.model.lock().unwrap() = model;
    }
}

impl CapabilityGate for StaticGate {
    fn selected_model(&self) -> Option<ModelSelection> {
        self.model.lock().unwrap().clone()
    }

    fn can_send_message(&self) -> bool {
        self.can_send.load(Ordering::SeqCst)
    }
}

pub struct StaticCredentials(pub Option<String>);

impl CredentialResolver for StaticCredentials {
    fn resolve_api_key(&self, _provider: String) -> BoxFuture<'_, Option<String>> {
        let key = self.0.clone();
        Box::pin(async move { key })
    }
}

pub struct StaticPersonas(pub Vec<(String, String)>);

impl PersonaResolver for StaticPersonas {
    fn resolve_prompt(&self, persona_id: String) -> BoxFuture<'_, Option<String>> {
        let prompt = self
            .0
            .iter()
            .find(|(id, _)| *id == persona_id)
            .map(|(_, prompt)| prompt.clone());
        Box::pin(async move { prompt })
    }
}

/// Saver that declines or fails every batch, counting the attempts.
pub struct RefusingSaver {
    pub fail: bool,
    pub attempts: Mutex<usize>,
}

impl RefusingSaver {
    pub fn declining() -> Self {
        Self {
            fail: false,
            attempts: Mutex::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            attempts: Mutex::new(0),
        }
    }
}

impl ConversationSaver for RefusingSaver {
    fn save_conversation(
        &self,
        _batch: ConversationBatch,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationId>>> {
        *self.attempts.lock().unwrap() += 1;
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                Err(StorageError::InvariantViolation {
                    stage: "test-save",
                    details: "backend unavailable".to_string(),
                })
            } else {
                Ok(None)
            }
        })
    }
}

pub struct Harness {
    pub strategy: Arc<LocalChatStrategy>,
    pub gate: Arc<StaticGate>,
    pub source: Arc<ScriptedTokenSource>,
    pub observer: Arc<RecordingObserver>,
}

pub fn harness(source: ScriptedTokenSource) -> Harness {
    harness_with(source, StaticGate::open(), |strategy| strategy)
}

pub fn harness_with(
    source: ScriptedTokenSource,
    gate: StaticGate,
    configure: impl FnOnce(LocalChatStrategy) -> LocalChatStrategy,
) -> Harness {
    let source = Arc::new(source);
    let observer = Arc::new(RecordingObserver::default());
    let gate = Arc::new(gate);
    let strategy = LocalChatStrategy::new(
        source.clone(),
        gate.clone(),
        Arc::new(StaticCredentials(Some("sk-test".to_string()))),
    )
    .with_observer(observer.clone());
    Harness {
        strategy: Arc::new(configure(strategy)),
        gate,
        source,
        observer,
    }
}

/// Polls `condition` until it holds or a second has passed.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

//! Wiring between the terminal, the settings file and the chat engine.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use parley_chat::{
    BoxFuture, CapabilityGate, ChatError, ChatMessage, ChatObserver, ConversationId,
    CredentialResolver, LocalChatStrategy, MessageId, ModelSelection, PersonaResolver, Role,
};
use parley_llm::create_token_source;
use parley_storage::SqliteStorage;
use snafu::ResultExt;

use super::error::{CliResult, TokenSourceSnafu};
use super::settings::SettingsStore;

/// The model comes from the live settings; usage limits are not enforced
/// locally.
pub struct SettingsGate {
    settings: Arc<SettingsStore>,
}

impl SettingsGate {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }
}

impl CapabilityGate for SettingsGate {
    fn selected_model(&self) -> Option<ModelSelection> {
        self.settings.settings().model_selection()
    }

    fn can_send_message(&self) -> bool {
        true
    }
}

pub struct SettingsCredentials {
    settings: Arc<SettingsStore>,
}

impl SettingsCredentials {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }
}

impl CredentialResolver for SettingsCredentials {
    fn resolve_api_key(&self, provider: String) -> BoxFuture<'_, Option<String>> {
        let settings = self.settings.settings();
        let api_key = (settings.provider_id == provider)
            .then(|| settings.api_key())
            .flatten();
        Box::pin(async move { api_key })
    }
}

pub struct SettingsPersonas {
    settings: Arc<SettingsStore>,
}

impl SettingsPersonas {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }
}

impl PersonaResolver for SettingsPersonas {
    fn resolve_prompt(&self, persona_id: String) -> BoxFuture<'_, Option<String>> {
        let prompt = self.settings.settings().personas.get(&persona_id).cloned();
        Box::pin(async move { prompt })
    }
}

#[derive(Debug, Default)]
struct PrintedReply {
    message_id: Option<MessageId>,
    printed_len: usize,
    stopped: bool,
}

/// Prints each assistant reply incrementally as snapshots arrive.
pub struct TerminalObserver<W: Write + Send> {
    out: Mutex<W>,
    reply: Mutex<PrintedReply>,
}

impl TerminalObserver<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> TerminalObserver<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            reply: Mutex::new(PrintedReply::default()),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self, text: &str) {
        let mut out = lock_unpoisoned(&self.out);
        if let Err(error) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
            tracing::debug!(error = %error, "terminal write failed");
        }
    }
}

impl<W: Write + Send> ChatObserver for TerminalObserver<W> {
    fn on_messages_change(&self, messages: &[ChatMessage]) {
        let mut reply = lock_unpoisoned(&self.reply);
        let Some(last) = messages.last().filter(|message| message.role == Role::Assistant) else {
            *reply = PrintedReply::default();
            return;
        };

        let mut text = String::new();
        if reply.message_id.as_ref() != Some(&last.id) {
            *reply = PrintedReply {
                message_id: Some(last.id.clone()),
                ..PrintedReply::default()
            };
            text.push_str("assistant> ");
        }
        // An edit can shorten the reply; print nothing rather than slice badly.
        if let Some(delta) = last.content.get(reply.printed_len..) {
            text.push_str(delta);
            reply.printed_len = last.content.len();
        }
        reply.stopped = last.is_stopped();
        drop(reply);

        if !text.is_empty() {
            self.write(&text);
        }
    }

    fn on_streaming_state_change(&self, is_streaming: bool) {
        if is_streaming {
            return;
        }
        let stopped = lock_unpoisoned(&self.reply).stopped;
        self.write(if stopped { " [stopped]\n" } else { "\n" });
    }

    fn on_error(&self, error: &ChatError) {
        self.write(&format!("error: {error}\n"));
    }

    fn on_conversation_create(&self, conversation_id: &ConversationId) {
        self.write(&format!("saved as conversation {conversation_id}\n"));
    }
}

pub struct Session {
    pub settings: Arc<SettingsStore>,
    pub strategy: Arc<LocalChatStrategy>,
    pub storage: Option<Arc<SqliteStorage>>,
}

pub async fn open_session(
    settings: Arc<SettingsStore>,
    observer: Arc<dyn ChatObserver>,
) -> CliResult<Session> {
    let current = settings.settings();
    let source = create_token_source(current.to_provider_config()).context(TokenSourceSnafu {
        stage: "open-session-token-source",
    })?;

    let storage = match SqliteStorage::open(&current.database_path).await {
        Ok(storage) => Some(Arc::new(storage)),
        Err(error) => {
            tracing::warn!(
                database_path = %current.database_path,
                error = %error,
                "durable storage unavailable, saving is disabled"
            );
            None
        }
    };

    let mut strategy = LocalChatStrategy::new(
        source,
        Arc::new(SettingsGate::new(settings.clone())),
        Arc::new(SettingsCredentials::new(settings.clone())),
    )
    .with_persona_resolver(Arc::new(SettingsPersonas::new(settings.clone())))
    .with_observer(observer)
    .with_options(current.generation_options())
    .with_user_id(current.user_id.clone());
    if let Some(storage) = &storage {
        strategy = strategy.with_saver(storage.clone());
    }

    tracing::info!(
        provider = %current.provider_id,
        model = %current.model,
        config_path = %settings.config_path().display(),
        "session ready"
    );
    Ok(Session {
        settings,
        strategy: Arc::new(strategy),
        storage,
    })
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

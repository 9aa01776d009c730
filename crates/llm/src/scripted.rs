//! Deterministic token source that replays scripted events.
//!
//! Each `stream_chat` call consumes the next queued script (the last one is
//! reused once the queue drains). An echo source with no scripts answers
//! with the last user turn, which makes it usable as an offline provider.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, oneshot};

use super::provider::{
    ProviderResult, ProviderStreamHandle, ProviderWorker, StreamFailure, StreamRequest,
    TokenEvent, TokenSource, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(TokenEvent),
    Delay(Duration),
    /// Park the worker until the latch is notified.
    WaitFor(Arc<Notify>),
}

impl ScriptStep {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Emit(TokenEvent::Content(text.into()))
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Emit(TokenEvent::Reasoning(text.into()))
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self::Emit(TokenEvent::Finish(reason.into()))
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Emit(TokenEvent::Error(StreamFailure::new(message)))
    }
}

#[derive(Debug)]
pub struct ScriptedTokenSource {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    echo_delay: Option<Duration>,
    honour_cancel: bool,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedTokenSource {
    const ECHO_TOKEN_DELAY_MS: u64 = 30;

    #[must_use]
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self::with_scripts(vec![script])
    }

    #[must_use]
    pub fn with_scripts(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            echo_delay: None,
            honour_cancel: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Content chunks followed by a `stop` finish.
    #[must_use]
    pub fn from_chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut script = chunks
            .into_iter()
            .map(ScriptStep::content)
            .collect::<Vec<_>>();
        script.push(ScriptStep::finish("stop"));
        Self::new(script)
    }

    #[must_use]
    pub fn echo() -> Self {
        Self {
            echo_delay: Some(Duration::from_millis(Self::ECHO_TOKEN_DELAY_MS)),
            ..Self::with_scripts(Vec::new())
        }
    }

    /// Keep replaying after cancellation, like a transport whose abort
    /// arrives late.
    #[must_use]
    pub fn ignoring_cancel(mut self) -> Self {
        self.honour_cancel = false;
        self
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    pub fn stream_count(&self) -> usize {
        lock_unpoisoned(&self.requests).len()
    }

    fn next_script(&self, request: &StreamRequest) -> Vec<ScriptStep> {
        let mut scripts = lock_unpoisoned(&self.scripts);
        if scripts.len() > 1 {
            if let Some(script) = scripts.pop_front() {
                return script;
            }
        }
        if let Some(script) = scripts.front() {
            return script.clone();
        }
        drop(scripts);

        match self.echo_delay {
            Some(delay) => echo_script(request.last_user_content().unwrap_or_default(), delay),
            None => vec![ScriptStep::finish("stop")],
        }
    }

    async fn run_script(
        script: Vec<ScriptStep>,
        honour_cancel: bool,
        event_tx: mpsc::UnboundedSender<TokenEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for step in script {
            if honour_cancel && cancel_rx.try_recv().is_ok() {
                let _ = event_tx.send(TokenEvent::Error(StreamFailure::aborted()));
                return;
            }

            match step {
                ScriptStep::Emit(event) => {
                    let terminal = event.is_terminal();
                    if event_tx.send(event).is_err() || terminal {
                        return;
                    }
                }
                ScriptStep::Delay(delay) if honour_cancel => {
                    tokio::select! {
                        _ = &mut cancel_rx => {
                            let _ = event_tx.send(TokenEvent::Error(StreamFailure::aborted()));
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                ScriptStep::Delay(delay) => tokio::time::sleep(delay).await,
                ScriptStep::WaitFor(latch) if honour_cancel => {
                    tokio::select! {
                        _ = &mut cancel_rx => {
                            let _ = event_tx.send(TokenEvent::Error(StreamFailure::aborted()));
                            return;
                        }
                        _ = latch.notified() => {}
                    }
                }
                ScriptStep::WaitFor(latch) => latch.notified().await,
            }
        }
        tracing::debug!("scripted stream ended without a terminal step");
    }
}

impl TokenSource for ScriptedTokenSource {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let script = self.next_script(&request);
        lock_unpoisoned(&self.requests).push(request);

        let (event_tx, stream, canceller, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_script(
            script,
            self.honour_cancel,
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

fn echo_script(prompt: &str, delay: Duration) -> Vec<ScriptStep> {
    let mut script = Vec::new();
    let mut pending_token = String::new();
    for ch in prompt.chars() {
        pending_token.push(ch);
        if ch.is_whitespace() {
            script.push(ScriptStep::content(std::mem::take(&mut pending_token)));
            script.push(ScriptStep::Delay(delay));
        }
    }
    if !pending_token.is_empty() {
        script.push(ScriptStep::content(pending_token));
    }
    script.push(ScriptStep::finish("stop"));
    script
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

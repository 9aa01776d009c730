//! Stream lifecycle for one strategy: a state machine keyed by generation so
//! late events from a replaced or stopped stream are rejected structurally,
//! plus the loop that feeds provider events into the message sequence.

use std::fmt;
use std::sync::Arc;

use parley_llm::{ProviderEventStream, ProviderMessage, ProviderWorker, Role, TokenEvent};
use tokio::sync::Notify;

use super::message::{ChatMessage, MessageId};

/// Monotonically increasing counter identifying one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "#{}", self.0)
    }
}

/// Routing key used for stale-event rejection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub generation: Generation,
    pub message_id: MessageId,
}

impl StreamTarget {
    pub fn new(generation: Generation, message_id: MessageId) -> Self {
        Self {
            generation,
            message_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    /// Placeholder created, no provider event yet.
    Sending(StreamTarget),
    Streaming(StreamTarget),
    Finished(StreamTarget),
    Cancelled(StreamTarget),
    Failed {
        target: StreamTarget,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTarget),
    Receive(StreamTarget),
    Complete(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
    Cancel(StreamTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    /// The target of a generation still receiving events.
    pub fn active_target(&self) -> Option<&StreamTarget> {
        match self {
            Self::Sending(target) | Self::Streaming(target) => Some(target),
            Self::Idle | Self::Finished(_) | Self::Cancelled(_) | Self::Failed { .. } => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_target().is_some()
    }

    pub fn is_sending(&self) -> bool {
        matches!(self, Self::Sending(_))
    }

    pub fn accepts_stream_event(&self, target: &StreamTarget) -> bool {
        self.active_target() == Some(target)
    }

    /// Terminal transitions must name the active generation exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(target) => self.apply_start(target),
            StreamTransition::Receive(target) => {
                self.ensure_active(&target)?;
                Ok(Self::Streaming(target))
            }
            StreamTransition::Complete(target) => {
                self.ensure_active(&target)?;
                Ok(Self::Finished(target))
            }
            StreamTransition::Fail { target, message } => {
                self.ensure_active(&target)?;
                Ok(Self::Failed { target, message })
            }
            StreamTransition::Cancel(target) => {
                self.ensure_active(&target)?;
                Ok(Self::Cancelled(target))
            }
        }
    }

    fn apply_start(&self, target: StreamTarget) -> StreamTransitionResult {
        match self.active_target() {
            Some(active) => Err(StreamTransitionRejection::AlreadyStreaming {
                active: active.clone(),
                attempted: target,
            }),
            None => Ok(Self::Sending(target)),
        }
    }

    fn ensure_active(&self, target: &StreamTarget) -> Result<(), StreamTransitionRejection> {
        match self.active_target() {
            Some(active) if active == target => Ok(()),
            Some(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: active.clone(),
                attempted: target.clone(),
            }),
            None => Err(StreamTransitionRejection::NoActiveStream),
        }
    }
}

/// Provider input for one generation: prompts first, then every message a
/// model may see, minus the placeholder and empty assistant turns.
pub fn build_history(
    messages: &[ChatMessage],
    placeholder_id: &MessageId,
    system_prompt: Option<&str>,
    persona_prompt: Option<&str>,
) -> Vec<ProviderMessage> {
    let prompts = [system_prompt, persona_prompt]
        .into_iter()
        .flatten()
        .filter(|prompt| !prompt.trim().is_empty())
        .map(|prompt| ProviderMessage::new(Role::System, prompt));

    let turns = messages
        .iter()
        .filter(|message| &message.id != placeholder_id)
        .filter(|message| {
            !(message.role == super::message::Role::Assistant && message.content.trim().is_empty())
        })
        .filter_map(ChatMessage::to_provider_message);

    prompts.chain(turns).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventFlow {
    Continue,
    Terminal,
    /// The generation was stopped or replaced; the event was ignored.
    Stale,
}

pub(crate) trait GenerationSink: Sync {
    fn apply_event(&self, target: &StreamTarget, event: TokenEvent) -> EventFlow;
    fn close_without_terminal(&self, target: &StreamTarget);
}

/// Consumes provider events in order until a terminal event, a stop signal
/// or channel close. Each event is fully applied before the next is read.
pub(crate) async fn drive<S: GenerationSink>(
    sink: &S,
    target: &StreamTarget,
    mut stream: ProviderEventStream,
    worker: ProviderWorker,
    stop: Arc<Notify>,
) {
    let worker = tokio::spawn(worker);

    let closed_without_terminal = loop {
        tokio::select! {
            biased;
            _ = stop.notified() => {
                tracing::debug!(generation = %target.generation, "generation stopped, releasing stream");
                break false;
            }
            event = stream.recv() => match event {
                Some(event) => match sink.apply_event(target, event) {
                    EventFlow::Continue => {}
                    EventFlow::Terminal | EventFlow::Stale => break false,
                },
                None => break true,
            },
        }
    };

    if closed_without_terminal {
        sink.close_without_terminal(target);
    }
    worker.abort();
}

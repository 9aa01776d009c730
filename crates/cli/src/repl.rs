//! Line-oriented chat loop.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use parley_chat::{
    ChatMessage, ChatResult, ConversationId, LocalChatStrategy, Role, SendMessage, StorageActions,
};
use parley_storage::MessageBackend;
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::app::Session;
use super::error::{CliResult, SettingsSnafu, TerminalSnafu};
use super::settings::Settings;

const HELP: &str = "\
commands:
  /retry                 resend your last message
  /regenerate            regenerate the last reply
  /edit <n> <text>       replace the text of message n
  /delete <n>            delete message n
  /messages              show the current conversation
  /save                  store the conversation and start a new one
  /conversations         list stored conversations
  /history <id>          show a stored conversation
  /persona [id]          use a configured persona, or clear it
  /model <name>          switch model (saved to settings)
  /quit                  leave
Ctrl-C stops a reply in progress.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Retry,
    Regenerate,
    Edit { index: usize, content: String },
    Delete(usize),
    Messages,
    Save,
    Conversations,
    History(String),
    Persona(Option<String>),
    Model(String),
    Help,
    Quit,
    Empty,
    /// Carries the usage hint to print.
    Invalid(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, rest)| (name, rest.trim()));
    match name {
        "retry" => Command::Retry,
        "regenerate" => Command::Regenerate,
        "edit" => {
            let (index, content) = rest
                .split_once(char::is_whitespace)
                .map_or((rest, ""), |(index, content)| (index, content.trim()));
            match parse_index(index) {
                Some(index) if !content.is_empty() => Command::Edit {
                    index,
                    content: content.to_string(),
                },
                _ => Command::Invalid("usage: /edit <n> <text>".to_string()),
            }
        }
        "delete" => parse_index(rest)
            .map(Command::Delete)
            .unwrap_or_else(|| Command::Invalid("usage: /delete <n>".to_string())),
        "messages" => Command::Messages,
        "save" => Command::Save,
        "conversations" => Command::Conversations,
        "history" if !rest.is_empty() => Command::History(rest.to_string()),
        "history" => Command::Invalid("usage: /history <conversation-id>".to_string()),
        "persona" => Command::Persona((!rest.is_empty()).then(|| rest.to_string())),
        "model" if !rest.is_empty() => Command::Model(rest.to_string()),
        "model" => Command::Invalid("usage: /model <name>".to_string()),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => Command::Invalid(format!("unknown command /{other}, try /help")),
    }
}

/// One-based, as shown by `/messages`.
fn parse_index(raw: &str) -> Option<usize> {
    raw.parse::<usize>().ok().filter(|index| *index > 0)
}

pub fn format_transcript(messages: &[ChatMessage]) -> String {
    let mut transcript = String::new();
    for (position, message) in messages.iter().enumerate() {
        let speaker = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Context => "context",
        };
        transcript.push_str(&format!("{:>3}. {speaker}: {}", position + 1, message.content));
        if message.is_stopped() {
            transcript.push_str(" [stopped]");
        }
        transcript.push('\n');
    }
    transcript
}

pub async fn run(session: Session) -> CliResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut persona: Option<String> = None;
    println!("parley: type a message, or /help for commands");

    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => line.context(TerminalSnafu { stage: "read-line" })?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match parse_command(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Help => println!("{HELP}"),
            Command::Invalid(hint) => println!("{hint}"),
            Command::Send(content) => {
                let mut request = SendMessage::new(content);
                if let Some(persona_id) = &persona {
                    request = request.with_persona_id(persona_id.clone());
                }
                let strategy = &session.strategy;
                report(interruptible(strategy, strategy.send_message(request)).await);
            }
            Command::Retry => match last_with_role(&session.strategy, Role::User) {
                Some(message) => {
                    let strategy = &session.strategy;
                    report(interruptible(strategy, strategy.retry_user_message(&message.id)).await);
                }
                None => println!("nothing to retry"),
            },
            Command::Regenerate => match last_with_role(&session.strategy, Role::Assistant) {
                Some(message) => {
                    let strategy = &session.strategy;
                    report(
                        interruptible(strategy, strategy.retry_assistant_message(&message.id))
                            .await,
                    );
                }
                None => println!("nothing to regenerate"),
            },
            Command::Edit { index, content } => match message_at(&session.strategy, index) {
                Some(message) => session.strategy.edit_message(&message.id, content),
                None => println!("no message #{index}"),
            },
            Command::Delete(index) => match message_at(&session.strategy, index) {
                Some(message) => session.strategy.delete_message(&message.id),
                None => println!("no message #{index}"),
            },
            Command::Messages => print!("{}", format_transcript(&session.strategy.messages())),
            Command::Save => {
                if let Err(error) = session.strategy.save_to_backend().await {
                    eprintln!("error: {error}");
                }
            }
            Command::Conversations => list_conversations(&session).await,
            Command::History(raw_id) => show_history(&session, ConversationId::from(raw_id)).await,
            Command::Persona(None) => {
                persona = None;
                println!("persona cleared");
            }
            Command::Persona(Some(persona_id)) => {
                if session.settings.settings().personas.contains_key(&persona_id) {
                    println!("persona set to {persona_id}");
                    persona = Some(persona_id);
                } else {
                    println!("no persona named {persona_id} in settings");
                }
            }
            Command::Model(model) => {
                let current = session.settings.settings();
                session
                    .settings
                    .update(Settings {
                        model,
                        ..(*current).clone()
                    })
                    .context(SettingsSnafu {
                        stage: "switch-model",
                    })?;
                println!("model set to {}", session.settings.settings().model);
            }
        }
    }

    session.strategy.cleanup();
    Ok(())
}

/// Runs a generation; Ctrl-C stops it and the action then settles.
async fn interruptible(
    strategy: &LocalChatStrategy,
    action: impl Future<Output = ChatResult<()>>,
) -> ChatResult<()> {
    tokio::pin!(action);
    let mut listening = true;
    loop {
        tokio::select! {
            result = &mut action => return result,
            signal = tokio::signal::ctrl_c(), if listening => {
                if let Err(error) = signal {
                    tracing::warn!(error = %error, "cannot listen for Ctrl-C");
                    listening = false;
                }
                strategy.stop_generation();
            }
        }
    }
}

fn report(result: ChatResult<()>) {
    if let Err(error) = result {
        eprintln!("error: {error}");
    }
}

fn prompt() -> CliResult<()> {
    let mut stdout = std::io::stdout();
    stdout
        .write_all(b"you> ")
        .and_then(|()| stdout.flush())
        .context(TerminalSnafu {
            stage: "write-prompt",
        })
}

fn last_with_role(strategy: &LocalChatStrategy, role: Role) -> Option<ChatMessage> {
    strategy
        .messages()
        .into_iter()
        .rev()
        .find(|message| message.role == role)
}

fn message_at(strategy: &LocalChatStrategy, index: usize) -> Option<ChatMessage> {
    strategy.messages().into_iter().nth(index - 1)
}

async fn list_conversations(session: &Session) {
    let Some(storage) = &session.storage else {
        println!("durable storage is unavailable");
        return;
    };
    let user_id = session.settings.settings().user_id.clone();
    match storage.list_conversations(user_id).await {
        Ok(records) if records.is_empty() => println!("no stored conversations"),
        Ok(records) => {
            for record in records {
                println!("{}  {} ({} messages)", record.id, record.title, record.message_count);
            }
        }
        Err(error) => eprintln!("error: {error}"),
    }
}

async fn show_history(session: &Session, conversation_id: ConversationId) {
    let Some(storage) = &session.storage else {
        println!("durable storage is unavailable");
        return;
    };
    let actions = StorageActions::new(Arc::clone(storage), conversation_id);
    match actions.load_messages().await {
        Ok(messages) => print!("{}", format_transcript(&messages)),
        Err(error) => eprintln!("error: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use parley_chat::{MessageId, MessageMetadata};

    use super::*;

    #[test]
    fn plain_text_is_a_send() {
        assert_eq!(parse_command("  hello there "), Command::Send("hello there".to_string()));
        assert_eq!(parse_command("   "), Command::Empty);
    }

    #[test]
    fn commands_parse_with_arguments() {
        assert_eq!(parse_command("/retry"), Command::Retry);
        assert_eq!(parse_command("/regenerate"), Command::Regenerate);
        assert_eq!(
            parse_command("/edit 3  fixed  text "),
            Command::Edit {
                index: 3,
                content: "fixed  text".to_string(),
            }
        );
        assert_eq!(parse_command("/delete 2"), Command::Delete(2));
        assert_eq!(
            parse_command("/history conv-1"),
            Command::History("conv-1".to_string())
        );
        assert_eq!(parse_command("/persona"), Command::Persona(None));
        assert_eq!(
            parse_command("/persona pirate"),
            Command::Persona(Some("pirate".to_string()))
        );
        assert_eq!(parse_command("/model gpt-4.1"), Command::Model("gpt-4.1".to_string()));
        assert_eq!(parse_command("/exit"), Command::Quit);
    }

    #[test]
    fn malformed_commands_carry_a_hint() {
        for line in ["/edit", "/edit 0 text", "/edit two text", "/edit 2", "/delete x", "/history", "/model", "/nope"] {
            assert!(
                matches!(parse_command(line), Command::Invalid(_)),
                "{line} should be invalid"
            );
        }
    }

    #[test]
    fn transcript_numbers_messages_from_one() {
        let mut reply = ChatMessage::new(MessageId::from("a1"), Role::Assistant, "Hi", 2);
        reply.metadata = Some(MessageMetadata::user_stopped());
        let transcript = format_transcript(&[
            ChatMessage::new(MessageId::from("u1"), Role::User, "Hello", 1),
            reply,
        ]);
        assert_eq!(transcript, "  1. you: Hello\n  2. assistant: Hi [stopped]\n");
    }
}

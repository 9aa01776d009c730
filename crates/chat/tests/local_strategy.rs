mod support;

use std::sync::Arc;

use parley_chat::{
    ChatError, ChatStrategy, FinishReason, GenerationOptions, Role, SendMessage, StreamState,
};
use parley_llm::{Role as ProviderRole, ScriptStep, ScriptedTokenSource, SourceCitation, StreamFailure, TokenEvent};
use tokio::sync::Notify;

use support::{Event, StaticGate, StaticPersonas, harness, harness_with, wait_until};

#[tokio::test]
async fn hello_streams_into_the_placeholder() {
    let latch = Arc::new(Notify::new());
    let h = harness(ScriptedTokenSource::new(vec![
        ScriptStep::WaitFor(latch.clone()),
        ScriptStep::content("Hi"),
        ScriptStep::content(" there"),
        ScriptStep::content("!"),
        ScriptStep::finish("stop"),
    ]));

    let strategy = h.strategy.clone();
    let send = tokio::spawn(async move { strategy.send_message(SendMessage::new("Hello")).await });

    wait_until(|| h.source.stream_count() == 1).await;
    let messages = h.strategy.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!((messages[0].role, messages[0].content.as_str()), (Role::User, "Hello"));
    assert_eq!((messages[1].role, messages[1].content.as_str()), (Role::Assistant, ""));
    assert_eq!(messages[1].parent_id.as_ref(), Some(&messages[0].id));
    assert_eq!(messages[1].model.as_deref(), Some(support::MODEL));
    assert!(messages[0].created_at < messages[1].created_at);
    assert!(h.strategy.is_streaming());
    assert!(h.strategy.is_loading());
    assert!(!h.strategy.has_streaming_content());

    latch.notify_one();
    send.await.unwrap().unwrap();

    let messages = h.strategy.messages();
    assert_eq!(messages[1].content, "Hi there!");
    assert_eq!(messages[1].finish_reason(), Some(&FinishReason::Stop));
    assert!(!messages[1].is_stopped());
    assert!(!h.strategy.is_streaming());
    assert!(!h.strategy.is_loading());

    let mut progression = h
        .observer
        .contents()
        .into_iter()
        .filter_map(|snapshot| snapshot.get(1).cloned())
        .collect::<Vec<_>>();
    progression.dedup();
    assert_eq!(progression, ["", "Hi", "Hi there", "Hi there!"]);
    assert_eq!(h.observer.streaming_changes(), [true, false]);
    assert!(matches!(h.observer.events().first(), Some(Event::Messages(_))));
    assert_eq!(h.observer.events().last(), Some(&Event::Streaming(false)));
}

#[tokio::test]
async fn request_carries_model_key_and_history() {
    let h = harness(ScriptedTokenSource::from_chunks(["ok"]));
    h.strategy.send_message(SendMessage::new("Hello")).await.unwrap();

    let requests = h.source.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].model_id, support::MODEL);
    assert_eq!(requests[0].provider_id, support::PROVIDER);
    assert_eq!(requests[0].api_key.as_deref(), Some("sk-test"));
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].last_user_content(), Some("Hello"));
}

#[tokio::test]
async fn prompts_are_prepended_and_explicit_persona_wins() {
    let h = harness_with(
        ScriptedTokenSource::from_chunks(["ok"]),
        StaticGate::open(),
        |strategy| {
            strategy
                .with_persona_resolver(Arc::new(StaticPersonas(vec![(
                    "pirate".to_string(),
                    "Talk like a pirate.".to_string(),
                )])))
                .with_options(GenerationOptions {
                    system_prompt: Some("Be brief.".to_string()),
                    temperature: Some(0.2),
                    max_tokens: Some(64),
                })
        },
    );

    h.strategy
        .send_message(SendMessage::new("Hello").with_persona_id("pirate"))
        .await
        .unwrap();
    h.strategy
        .send_message(
            SendMessage::new("Again")
                .with_persona_id("pirate")
                .with_persona_prompt("Talk like a robot."),
        )
        .await
        .unwrap();

    let requests = h.source.requests();
    let prompts = |index: usize| {
        requests[index]
            .messages
            .iter()
            .filter(|message| message.role == ProviderRole::System)
            .map(|message| message.content.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(prompts(0), ["Be brief.", "Talk like a pirate."]);
    assert_eq!(prompts(1), ["Be brief.", "Talk like a robot."]);
    assert_eq!(requests[0].temperature, Some(0.2));
    assert_eq!(requests[0].max_tokens, Some(64));
    // Second request sees the finished first exchange.
    assert_eq!(
        requests[1]
            .messages
            .iter()
            .filter(|message| message.role != ProviderRole::System)
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>(),
        ["Hello", "ok", "Again"]
    );
}

#[tokio::test]
async fn reasoning_and_citations_land_on_the_placeholder() {
    let h = harness(ScriptedTokenSource::new(vec![
        ScriptStep::reasoning("thinking "),
        ScriptStep::reasoning("hard"),
        ScriptStep::Emit(TokenEvent::Citations(vec![SourceCitation {
            url: "https://example.com/a".to_string(),
            title: Some("A".to_string()),
        }])),
        ScriptStep::content("Answer"),
        ScriptStep::finish("length"),
    ]));
    h.strategy.send_message(SendMessage::new("Why?")).await.unwrap();

    let reply = &h.strategy.messages()[1];
    assert_eq!(reply.reasoning.as_deref(), Some("thinking hard"));
    assert_eq!(reply.content, "Answer");
    let citations = reply.citations.as_ref().unwrap();
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0].url, "https://example.com/a");
    assert_eq!(reply.finish_reason(), Some(&FinishReason::Length));
}

#[tokio::test]
async fn provider_error_removes_the_placeholder() {
    let h = harness(ScriptedTokenSource::new(vec![
        ScriptStep::content("par"),
        ScriptStep::fail("rate limited"),
    ]));
    h.strategy.send_message(SendMessage::new("Hello")).await.unwrap();

    let messages = h.strategy.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert!(!h.strategy.is_streaming());
    assert!(matches!(h.strategy.stream_state(), StreamState::Failed { .. }));
    assert_eq!(h.observer.errors(), ["The response failed: rate limited"]);
    assert_eq!(h.observer.streaming_changes(), [true, false]);
}

#[tokio::test]
async fn stream_closing_without_terminal_is_a_failure() {
    let h = harness(ScriptedTokenSource::new(vec![ScriptStep::content("half")]));
    h.strategy.send_message(SendMessage::new("Hello")).await.unwrap();

    assert_eq!(h.strategy.messages().len(), 1);
    assert_eq!(
        h.observer.errors(),
        ["The response failed: provider stream ended before a terminal event"]
    );
}

#[tokio::test]
async fn transport_abort_keeps_the_partial_reply() {
    let h = harness(ScriptedTokenSource::new(vec![
        ScriptStep::content("Hi"),
        ScriptStep::Emit(TokenEvent::Error(
            StreamFailure::new("The operation was aborted").with_name("DOMException"),
        )),
    ]));
    h.strategy.send_message(SendMessage::new("Hello")).await.unwrap();

    let messages = h.strategy.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Hi");
    assert!(messages[1].is_stopped());
    assert!(h.observer.errors().is_empty());
    assert!(matches!(h.strategy.stream_state(), StreamState::Cancelled(_)));
}

#[tokio::test]
async fn stop_wins_against_a_transport_that_ignores_cancel() {
    let latch = Arc::new(Notify::new());
    let h = harness(
        ScriptedTokenSource::new(vec![
            ScriptStep::content("Hi"),
            ScriptStep::WaitFor(latch.clone()),
            ScriptStep::content(" late"),
            ScriptStep::finish("length"),
        ])
        .ignoring_cancel(),
    );

    let strategy = h.strategy.clone();
    let send = tokio::spawn(async move { strategy.send_message(SendMessage::new("Hello")).await });
    wait_until(|| h.strategy.has_streaming_content()).await;

    h.strategy.stop_generation();
    assert!(!h.strategy.is_streaming());
    // The send resolves without the transport ever finishing.
    send.await.unwrap().unwrap();

    latch.notify_one();
    tokio::task::yield_now().await;

    let reply = &h.strategy.messages()[1];
    assert_eq!(reply.content, "Hi");
    assert!(reply.is_stopped());
    assert_eq!(reply.finish_reason(), Some(&FinishReason::Stop));
    assert!(h.observer.errors().is_empty());
    assert_eq!(h.observer.streaming_changes(), [true, false]);

    h.strategy.stop_generation();
    assert_eq!(h.observer.streaming_changes(), [true, false]);
}

#[tokio::test]
async fn second_send_while_streaming_is_rejected() {
    let latch = Arc::new(Notify::new());
    let h = harness(ScriptedTokenSource::new(vec![
        ScriptStep::WaitFor(latch.clone()),
        ScriptStep::finish("stop"),
    ]));

    let strategy = h.strategy.clone();
    let send = tokio::spawn(async move { strategy.send_message(SendMessage::new("one")).await });
    wait_until(|| h.source.stream_count() == 1).await;

    let error = h
        .strategy
        .send_message(SendMessage::new("two"))
        .await
        .unwrap_err();
    assert!(matches!(error, ChatError::GenerationInProgress { .. }));
    assert_eq!(h.strategy.messages().len(), 2);

    latch.notify_one();
    send.await.unwrap().unwrap();
    assert_eq!(h.source.stream_count(), 1);
}

#[tokio::test]
async fn deleting_the_streaming_reply_stops_it() {
    let latch = Arc::new(Notify::new());
    let h = harness(ScriptedTokenSource::new(vec![
        ScriptStep::content("Hi"),
        ScriptStep::WaitFor(latch.clone()),
        ScriptStep::finish("stop"),
    ]));

    let strategy = h.strategy.clone();
    let send = tokio::spawn(async move { strategy.send_message(SendMessage::new("Hello")).await });
    wait_until(|| h.strategy.has_streaming_content()).await;

    let placeholder = h.strategy.messages()[1].id.clone();
    h.strategy.delete_message(&placeholder);
    send.await.unwrap().unwrap();

    let messages = h.strategy.messages();
    assert_eq!(messages.len(), 1);
    assert!(!h.strategy.is_streaming());
}

#[tokio::test]
async fn edit_and_delete_touch_only_known_ids() {
    let h = harness(ScriptedTokenSource::from_chunks(["Hi"]));
    h.strategy.send_message(SendMessage::new("Hello")).await.unwrap();
    let before = h.observer.events().len();

    h.strategy
        .edit_message(&"missing".into(), "ignored".to_string());
    h.strategy.delete_message(&"missing".into());
    assert_eq!(h.observer.events().len(), before);

    let user = h.strategy.messages()[0].id.clone();
    h.strategy.edit_message(&user, "Hello again".to_string());
    assert_eq!(h.strategy.messages()[0].content, "Hello again");
}

#[tokio::test]
async fn blank_send_does_nothing() {
    let h = harness(ScriptedTokenSource::from_chunks(["Hi"]));
    h.strategy.send_message(SendMessage::new("  \n")).await.unwrap();
    assert!(h.strategy.messages().is_empty());
    assert!(h.observer.events().is_empty());
    assert_eq!(h.source.stream_count(), 0);
}

#[tokio::test]
async fn closed_gate_reports_limit_and_leaves_state_alone() {
    let h = harness_with(
        ScriptedTokenSource::from_chunks(["Hi"]),
        StaticGate::closed(),
        |strategy| strategy,
    );
    h.strategy.send_message(SendMessage::new("Hello")).await.unwrap();

    assert!(h.strategy.messages().is_empty());
    assert_eq!(h.observer.errors(), ["You've reached your message limit"]);
    assert_eq!(h.source.stream_count(), 0);
}

#[tokio::test]
async fn missing_model_is_returned() {
    let h = harness_with(
        ScriptedTokenSource::from_chunks(["Hi"]),
        StaticGate::without_model(),
        |strategy| strategy,
    );
    let error = h
        .strategy
        .send_message(SendMessage::new("Hello"))
        .await
        .unwrap_err();

    assert!(matches!(error, ChatError::NoModelSelected { .. }));
    assert!(h.strategy.messages().is_empty());
    assert!(h.observer.events().is_empty());
}

#[tokio::test]
async fn works_through_the_trait_object() {
    let h = harness(ScriptedTokenSource::from_chunks(["Hi", "!"]));
    let strategy: Arc<dyn ChatStrategy> = h.strategy.clone();

    strategy.send_message(SendMessage::new("Hello")).await.unwrap();
    assert_eq!(strategy.messages()[1].content, "Hi!");
    assert!(!strategy.is_streaming());

    let reply = strategy.messages()[1].id.clone();
    strategy.delete_message(reply).await.unwrap();
    assert_eq!(strategy.messages().len(), 1);
    strategy.cleanup();
}

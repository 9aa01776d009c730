mod support;

use std::sync::Arc;

use parley_chat::{ChatError, SendMessage, convert_server_messages};
use parley_llm::{ScriptStep, ScriptedTokenSource};
use parley_storage::{InMemoryStorage, MessageBackend, MessageRole, SqliteStorage};
use tokio::sync::Notify;

use support::{Event, RefusingSaver, StaticGate, harness, harness_with, wait_until};

fn with_saver(
    saver: Arc<dyn parley_storage::ConversationSaver>,
) -> impl FnOnce(parley_chat::LocalChatStrategy) -> parley_chat::LocalChatStrategy {
    move |strategy| strategy.with_saver(saver).with_user_id("user-1")
}

#[tokio::test]
async fn successful_promotion_clears_the_session() {
    let storage = Arc::new(InMemoryStorage::new());
    let h = harness_with(
        ScriptedTokenSource::from_chunks(["Hi there!"]),
        StaticGate::open(),
        with_saver(storage.clone()),
    );
    h.strategy.send_message(SendMessage::new("Hello")).await.unwrap();

    let conversation_id = h.strategy.save_to_backend().await.unwrap();

    assert!(h.strategy.messages().is_empty());
    let events = h.observer.events();
    assert_eq!(events[events.len() - 2], Event::Messages(Vec::new()));
    assert_eq!(events[events.len() - 1], Event::Created(conversation_id.clone()));

    let stored = storage.list_messages(conversation_id.clone()).await.unwrap();
    let messages = convert_server_messages(&stored);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "Hello");
    assert_eq!(messages[1].content, "Hi there!");
    assert_eq!(messages[1].model.as_deref(), Some(support::MODEL));
    assert_eq!(
        messages[1].finish_reason(),
        Some(&parley_chat::FinishReason::Stop)
    );

    let conversations = storage.list_conversations("user-1".to_string()).await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].title, "Hello");
}

#[tokio::test]
async fn sqlite_promotion_is_one_batch() {
    let storage = Arc::new(SqliteStorage::open("sqlite::memory:").await.unwrap());
    let h = harness_with(
        ScriptedTokenSource::from_chunks(["Hi", " there!"]),
        StaticGate::open(),
        with_saver(storage.clone()),
    );
    h.strategy.send_message(SendMessage::new("Hello")).await.unwrap();
    h.strategy.send_message(SendMessage::new("Bye")).await.unwrap();

    let conversation_id = h.strategy.save_to_backend().await.unwrap();

    let stored = storage.list_messages(conversation_id).await.unwrap();
    let roles = stored.iter().map(|document| document.role).collect::<Vec<_>>();
    assert_eq!(
        roles,
        [
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::User,
            MessageRole::Assistant
        ]
    );
    assert_eq!(stored[3].content, "Hi there!");
    // Replies stay linked to their prompts under the new ids.
    assert_eq!(stored[1].parent_id.as_ref(), Some(&stored[0].id));
    assert_eq!(stored[3].parent_id.as_ref(), Some(&stored[2].id));
    assert_eq!(stored[0].parent_id, None);
    assert!(stored.iter().all(|document| document.is_main_branch == Some(true)));
    assert!(h.strategy.messages().is_empty());
}

#[tokio::test]
async fn failed_promotion_keeps_every_message() {
    for (saver, rejected) in [
        (Arc::new(RefusingSaver::declining()), true),
        (Arc::new(RefusingSaver::failing()), false),
    ] {
        let h = harness_with(
            ScriptedTokenSource::from_chunks(["Hi"]),
            StaticGate::open(),
            with_saver(saver.clone()),
        );
        h.strategy.send_message(SendMessage::new("Hello")).await.unwrap();
        let before = h.strategy.messages();

        let error = h.strategy.save_to_backend().await.unwrap_err();
        if rejected {
            assert!(matches!(error, ChatError::SaveRejected { .. }));
        } else {
            assert!(matches!(error, ChatError::Save { .. }));
        }
        assert_eq!(h.strategy.messages(), before);
        assert_eq!(*saver.attempts.lock().unwrap(), 1);
        assert!(
            !h.observer
                .events()
                .iter()
                .any(|event| matches!(event, Event::Created(_)))
        );
    }
}

#[tokio::test]
async fn promotion_preconditions_fail_fast() {
    let h = harness(ScriptedTokenSource::from_chunks(["Hi"]));
    h.strategy.send_message(SendMessage::new("Hello")).await.unwrap();
    let unavailable = h.strategy.save_to_backend().await.unwrap_err();
    assert!(matches!(unavailable, ChatError::SaveUnavailable { .. }));

    let saver = Arc::new(RefusingSaver::declining());
    let anonymous = harness_with(
        ScriptedTokenSource::from_chunks(["Hi"]),
        StaticGate::open(),
        {
            let saver = saver.clone();
            move |strategy| strategy.with_saver(saver)
        },
    );
    anonymous.strategy.send_message(SendMessage::new("Hello")).await.unwrap();
    let no_user = anonymous.strategy.save_to_backend().await.unwrap_err();
    assert!(matches!(no_user, ChatError::SaveUnavailable { .. }));

    let empty = harness_with(
        ScriptedTokenSource::from_chunks(["Hi"]),
        StaticGate::open(),
        with_saver(saver.clone()),
    );
    let nothing = empty.strategy.save_to_backend().await.unwrap_err();
    assert!(matches!(nothing, ChatError::NothingToSave { .. }));
    assert_eq!(*saver.attempts.lock().unwrap(), 0);
}

#[tokio::test]
async fn promotion_waits_for_the_stream_to_end() {
    let latch = Arc::new(Notify::new());
    let storage = Arc::new(InMemoryStorage::new());
    let h = harness_with(
        ScriptedTokenSource::new(vec![
            ScriptStep::WaitFor(latch.clone()),
            ScriptStep::finish("stop"),
        ]),
        StaticGate::open(),
        with_saver(storage.clone()),
    );

    let strategy = h.strategy.clone();
    let send = tokio::spawn(async move { strategy.send_message(SendMessage::new("Hello")).await });
    wait_until(|| h.source.stream_count() == 1).await;

    let error = h.strategy.save_to_backend().await.unwrap_err();
    assert!(matches!(error, ChatError::GenerationInProgress { .. }));
    assert_eq!(storage.conversation_count(), 0);

    latch.notify_one();
    send.await.unwrap().unwrap();
    h.strategy.save_to_backend().await.unwrap();
    assert_eq!(storage.conversation_count(), 1);
}

//! Pure operations over an ordered message sequence. Each returns a new
//! vector and leaves its input untouched.

use super::message::{ChatMessage, MessageId, MessagePatch};

pub fn add_message(messages: &[ChatMessage], message: ChatMessage) -> Vec<ChatMessage> {
    let mut next = Vec::with_capacity(messages.len() + 1);
    next.extend_from_slice(messages);
    next.push(message);
    next
}

/// No-op when `id` is absent.
pub fn update_message(
    messages: &[ChatMessage],
    id: &MessageId,
    patch: MessagePatch,
) -> Vec<ChatMessage> {
    let mut next = messages.to_vec();
    if let Some(message) = next.iter_mut().find(|message| &message.id == id) {
        patch.apply_to(message);
    }
    next
}

pub fn remove_message(messages: &[ChatMessage], id: &MessageId) -> Vec<ChatMessage> {
    messages
        .iter()
        .filter(|message| &message.id != id)
        .cloned()
        .collect()
}

pub fn find_message<'a>(
    messages: &'a [ChatMessage],
    id: &MessageId,
) -> Option<(usize, &'a ChatMessage)> {
    messages
        .iter()
        .enumerate()
        .find(|(_, message)| &message.id == id)
}

/// Keeps `messages[..index]`.
pub fn truncate_before(messages: &[ChatMessage], index: usize) -> Vec<ChatMessage> {
    messages[..index.min(messages.len())].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageMetadata, Role};

    fn message(id: &str, role: Role, content: &str) -> ChatMessage {
        ChatMessage::new(MessageId::from(id), role, content, 0)
    }

    fn conversation() -> Vec<ChatMessage> {
        vec![
            message("u0", Role::User, "hi"),
            message("a0", Role::Assistant, "hello"),
            message("u1", Role::User, "again"),
            message("a1", Role::Assistant, "sure"),
        ]
    }

    fn ids(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|message| message.id.as_str()).collect()
    }

    #[test]
    fn add_appends_without_touching_input() {
        let before = conversation();
        let after = add_message(&before, message("u2", Role::User, "more"));
        assert_eq!(before.len(), 4);
        assert_eq!(ids(&after), ["u0", "a0", "u1", "a1", "u2"]);
    }

    #[test]
    fn update_merges_only_set_fields() {
        let messages = vec![ChatMessage {
            reasoning: Some("thinking".to_string()),
            ..message("a0", Role::Assistant, "partial")
        }];
        let updated = update_message(
            &messages,
            &MessageId::from("a0"),
            MessagePatch::metadata(MessageMetadata::user_stopped()),
        );
        assert_eq!(updated[0].content, "partial");
        assert_eq!(updated[0].reasoning.as_deref(), Some("thinking"));
        assert!(updated[0].is_stopped());
        assert_eq!(messages[0].metadata, None);
    }

    #[test]
    fn update_of_missing_id_is_a_no_op() {
        let messages = conversation();
        let updated = update_message(&messages, &MessageId::from("zz"), MessagePatch::content("x"));
        assert_eq!(updated, messages);
    }

    #[test]
    fn remove_and_find() {
        let messages = remove_message(&conversation(), &MessageId::from("a0"));
        assert_eq!(ids(&messages), ["u0", "u1", "a1"]);

        let (index, found) = find_message(&messages, &MessageId::from("a1")).unwrap();
        assert_eq!(index, 2);
        assert_eq!(found.content, "sure");
        assert!(find_message(&messages, &MessageId::from("a0")).is_none());
    }

    #[test]
    fn truncate_drops_target_and_everything_after() {
        let messages = conversation();
        assert_eq!(ids(&truncate_before(&messages, 2)), ["u0", "a0"]);
        assert!(truncate_before(&messages, 0).is_empty());
        assert_eq!(truncate_before(&messages, 9).len(), 4);
    }
}

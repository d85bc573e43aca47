//! Shared domain types for the Courier server.
//!
//! This module defines the records that flow through the authentication and
//! chat-delivery pipeline: identities, conversations, persisted messages and
//! the transient [`ChatEvent`] that clients submit.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a registered user.
pub type UserId = i64;

/// Identifier of a conversation.
pub type ConversationId = i64;

/// Identifier of a persisted message.
pub type MessageId = i64;

/// The kind of a chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatEventKind {
    Chat,
    Join,
    Leave,
}

impl fmt::Display for ChatEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => f.write_str("CHAT"),
            Self::Join => f.write_str("JOIN"),
            Self::Leave => f.write_str("LEAVE"),
        }
    }
}

/// An inbound chat event, as submitted over a live connection or request body.
///
/// Events are transient: a `CHAT` event is translated into a persisted
/// [`Message`], while `JOIN` and `LEAVE` mutate conversation membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(rename = "type")]
    pub kind: ChatEventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// The acting user. Accepted as `userId` or `actorId` on the wire.
    #[serde(rename = "userId", alias = "actorId")]
    pub actor_id: UserId,

    pub conversation_id: ConversationId,
}

impl ChatEvent {
    /// Creates a `CHAT` event carrying `content`.
    pub fn chat(content: impl Into<String>, actor_id: UserId, conversation_id: ConversationId) -> Self {
        Self {
            kind: ChatEventKind::Chat,
            content: Some(content.into()),
            actor_id,
            conversation_id,
        }
    }

    /// Creates a `JOIN` event.
    pub fn join(actor_id: UserId, conversation_id: ConversationId) -> Self {
        Self {
            kind: ChatEventKind::Join,
            content: None,
            actor_id,
            conversation_id,
        }
    }

    /// Creates a `LEAVE` event.
    pub fn leave(actor_id: UserId, conversation_id: ConversationId) -> Self {
        Self {
            kind: ChatEventKind::Leave,
            content: None,
            actor_id,
            conversation_id,
        }
    }

    /// Checks the structural rules of an event.
    ///
    /// Content is required (and must not be blank) for `CHAT` events only.
    pub fn validate(&self) -> Result<(), String> {
        if self.kind == ChatEventKind::Chat {
            match self.content.as_deref() {
                Some(content) if !content.trim().is_empty() => {}
                _ => return Err("content is required for CHAT events".to_string()),
            }
        }
        Ok(())
    }
}

/// A chat event wrapped for transport through the broker.
///
/// The `id` is assigned once at ingress and doubles as the idempotency key
/// for persistence, so redelivered envelopes never create a second message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: Uuid,
    pub event: ChatEvent,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    /// Wraps an event with a fresh identifier.
    pub fn new(event: ChatEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            published_at: Utc::now(),
        }
    }
}

/// A registered identity, as read from user storage.
#[derive(Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub password_hash: String,
    /// Base32 TOTP secret, present once enrollment has started.
    pub totp_secret: Option<String>,
    pub two_factor_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            password_hash: password_hash.into(),
            totp_secret: None,
            two_factor_enabled: false,
            created_at: Utc::now(),
        }
    }
}

// Credentials stay out of Debug output so identities can be logged safely.
impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("password_hash", &"<redacted>")
            .field("totp_secret", &self.totp_secret.as_ref().map(|_| "<redacted>"))
            .field("two_factor_enabled", &self.two_factor_enabled)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// A conversation and its participant set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: BTreeSet<UserId>,
}

impl Conversation {
    pub fn new(id: ConversationId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            participants: BTreeSet::new(),
        }
    }

    /// Adds a participant. Returns `false` if they were already a member.
    pub fn add_participant(&mut self, user_id: UserId) -> bool {
        self.participants.insert(user_id)
    }

    /// Removes a participant. Returns `false` if they were not a member.
    pub fn remove_participant(&mut self, user_id: UserId) -> bool {
        self.participants.remove(&user_id)
    }

    pub fn is_member(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
}

/// A request to persist a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub content: String,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub idempotency_key: Option<Uuid>,
}

/// Changes to a stored message. Absent ids keep the current value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    pub content: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
}

impl NewMessage {
    /// Builds a persistence request from a `CHAT` event.
    ///
    /// Returns `None` for membership events or a chat event without content.
    pub fn from_event(event: &ChatEvent, idempotency_key: Option<Uuid>) -> Option<Self> {
        if event.kind != ChatEventKind::Chat {
            return None;
        }
        let content = event.content.clone()?;
        Some(Self {
            content,
            user_id: event.actor_id,
            conversation_id: event.conversation_id,
            idempotency_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_event_serializes_with_wire_names() {
        let event = ChatEvent::chat("hi", 1, 2);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "CHAT");
        assert_eq!(json["content"], "hi");
        assert_eq!(json["userId"], 1);
        assert_eq!(json["conversationId"], 2);
    }

    #[test]
    fn chat_event_accepts_actor_id_alias() {
        let json = r#"{"type":"JOIN","actorId":7,"conversationId":3}"#;
        let event: ChatEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event, ChatEvent::join(7, 3));
    }

    #[test]
    fn chat_event_rejects_unknown_kind() {
        let json = r#"{"type":"TYPING","userId":7,"conversationId":3}"#;
        assert!(serde_json::from_str::<ChatEvent>(json).is_err());
    }

    #[test]
    fn validate_requires_content_for_chat() {
        let mut event = ChatEvent::chat("hello", 1, 1);
        assert!(event.validate().is_ok());

        event.content = None;
        assert!(event.validate().is_err());

        event.content = Some("   ".to_string());
        assert!(event.validate().is_err());
    }

    #[test]
    fn validate_allows_membership_events_without_content() {
        assert!(ChatEvent::join(1, 1).validate().is_ok());
        assert!(ChatEvent::leave(1, 1).validate().is_ok());
    }

    #[test]
    fn conversation_membership_is_a_set() {
        let mut conversation = Conversation::new(1, None);

        assert!(conversation.add_participant(5));
        assert!(!conversation.add_participant(5));
        assert_eq!(conversation.participants.len(), 1);

        assert!(conversation.remove_participant(5));
        assert!(!conversation.remove_participant(5));
        assert!(conversation.participants.is_empty());
    }

    #[test]
    fn user_debug_redacts_credentials() {
        let mut user = User::new(1, "alice", "$2b$12$secret-hash");
        user.totp_secret = Some("JBSWY3DPEHPK3PXP".to_string());

        let debug = format!("{user:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("secret-hash"));
        assert!(!debug.contains("JBSWY3DPEHPK3PXP"));
    }

    #[test]
    fn new_message_only_from_chat_events() {
        let key = Uuid::new_v4();
        let request = NewMessage::from_event(&ChatEvent::chat("hi", 1, 2), Some(key)).unwrap();
        assert_eq!(request.content, "hi");
        assert_eq!(request.user_id, 1);
        assert_eq!(request.conversation_id, 2);
        assert_eq!(request.idempotency_key, Some(key));

        assert!(NewMessage::from_event(&ChatEvent::join(1, 2), None).is_none());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = Envelope::new(ChatEvent::chat("hi", 1, 1));
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }
}

//! State transitions for inbound chat events.
//!
//! [`MessageTypeProcessor::process`] dispatches on the event kind:
//!
//! | Kind    | Effect                                   | Outcomes                    |
//! |---------|------------------------------------------|-----------------------------|
//! | `CHAT`  | persist a message                        | `Persisted`                 |
//! | `JOIN`  | add the actor to the conversation        | `Joined`, `AlreadyMember`   |
//! | `LEAVE` | remove the actor from the conversation   | `Left`, `NotMember`         |
//!
//! A no-op membership change is a successful outcome with different text,
//! never an error. Each event touches at most one conversation.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, ServerError};
use crate::messages::MessageService;
use crate::store::{ConversationRepository, UserRepository};
use crate::types::{ChatEvent, ChatEventKind, ConversationId, MessageId, NewMessage, User};

/// Result of processing one chat event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum Outcome {
    #[serde(rename_all = "camelCase")]
    Persisted { message_id: MessageId },
    #[serde(rename_all = "camelCase")]
    Joined {
        username: String,
        conversation_id: ConversationId,
    },
    #[serde(rename_all = "camelCase")]
    AlreadyMember {
        username: String,
        conversation_id: ConversationId,
    },
    #[serde(rename_all = "camelCase")]
    Left {
        username: String,
        conversation_id: ConversationId,
    },
    #[serde(rename_all = "camelCase")]
    NotMember {
        username: String,
        conversation_id: ConversationId,
    },
}

impl Outcome {
    /// Returns `true` if processing changed stored state.
    pub fn changed_state(&self) -> bool {
        matches!(
            self,
            Self::Persisted { .. } | Self::Joined { .. } | Self::Left { .. }
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persisted { .. } => write!(f, "Chat message processed and persisted."),
            Self::Joined {
                username,
                conversation_id,
            } => write!(f, "User {username} joined conversation {conversation_id}."),
            Self::AlreadyMember {
                username,
                conversation_id,
            } => write!(
                f,
                "User {username} is already part of conversation {conversation_id}."
            ),
            Self::Left {
                username,
                conversation_id,
            } => write!(f, "User {username} left conversation {conversation_id}."),
            Self::NotMember {
                username,
                conversation_id,
            } => write!(
                f,
                "User {username} was not part of conversation {conversation_id}."
            ),
        }
    }
}

/// Applies chat events to storage.
#[derive(Clone)]
pub struct MessageTypeProcessor {
    messages: MessageService,
    users: Arc<dyn UserRepository>,
    conversations: Arc<dyn ConversationRepository>,
}

impl MessageTypeProcessor {
    pub fn new(
        messages: MessageService,
        users: Arc<dyn UserRepository>,
        conversations: Arc<dyn ConversationRepository>,
    ) -> Self {
        Self {
            messages,
            users,
            conversations,
        }
    }

    /// Processes `event`; `idempotency_key` deduplicates CHAT persistence.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Validation`] for a CHAT event without content
    /// - [`ServerError::NotFound`] if the actor or conversation is absent
    /// - storage failures, unchanged
    pub async fn process(&self, event: &ChatEvent, idempotency_key: Option<Uuid>) -> Result<Outcome> {
        match event.kind {
            ChatEventKind::Chat => self.process_chat(event, idempotency_key).await,
            ChatEventKind::Join => self.process_join(event).await,
            ChatEventKind::Leave => self.process_leave(event).await,
        }
    }

    async fn process_chat(&self, event: &ChatEvent, idempotency_key: Option<Uuid>) -> Result<Outcome> {
        event.validate().map_err(ServerError::validation)?;
        let request = NewMessage::from_event(event, idempotency_key)
            .ok_or_else(|| ServerError::validation("CHAT event requires content"))?;

        let message = self.messages.create_message(request).await?;
        Ok(Outcome::Persisted {
            message_id: message.id,
        })
    }

    async fn process_join(&self, event: &ChatEvent) -> Result<Outcome> {
        let user = self.resolve_actor(event, "JOIN event").await?;
        let changed = self
            .conversations
            .add_participant(event.conversation_id, user.id)
            .await?
            .ok_or_else(|| membership_not_found("JOIN event", event))?;

        let username = user.username;
        let conversation_id = event.conversation_id;
        Ok(if changed {
            Outcome::Joined {
                username,
                conversation_id,
            }
        } else {
            Outcome::AlreadyMember {
                username,
                conversation_id,
            }
        })
    }

    async fn process_leave(&self, event: &ChatEvent) -> Result<Outcome> {
        let user = self.resolve_actor(event, "LEAVE event").await?;
        let changed = self
            .conversations
            .remove_participant(event.conversation_id, user.id)
            .await?
            .ok_or_else(|| membership_not_found("LEAVE event", event))?;

        let username = user.username;
        let conversation_id = event.conversation_id;
        Ok(if changed {
            Outcome::Left {
                username,
                conversation_id,
            }
        } else {
            Outcome::NotMember {
                username,
                conversation_id,
            }
        })
    }

    async fn resolve_actor(&self, event: &ChatEvent, resource: &'static str) -> Result<User> {
        self.users
            .find_by_id(event.actor_id)
            .await?
            .ok_or_else(|| membership_not_found(resource, event))
    }
}

impl fmt::Debug for MessageTypeProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTypeProcessor").finish_non_exhaustive()
    }
}

fn membership_not_found(resource: &'static str, event: &ChatEvent) -> ServerError {
    ServerError::not_found(
        resource,
        "userId/conversationId",
        format!("{}/{}", event.actor_id, event.conversation_id),
    )
}

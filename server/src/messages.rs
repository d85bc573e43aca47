//! Message persistence with referential checks.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Result, ServerError};
use crate::store::{ConversationRepository, MessageRepository, UserRepository};
use crate::types::{ConversationId, Message, MessageId, MessageUpdate, NewMessage, UserId};

/// Persists, reads, edits and deletes chat messages.
///
/// The author and conversation must exist before a message is stored.
#[derive(Clone)]
pub struct MessageService {
    users: Arc<dyn UserRepository>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
}

impl MessageService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
    ) -> Self {
        Self {
            users,
            conversations,
            messages,
        }
    }

    /// Stores `request`, or returns the message already stored under its
    /// idempotency key.
    ///
    /// # Errors
    ///
    /// [`ServerError::NotFound`] if the author or conversation is absent;
    /// storage failures propagate unchanged.
    pub async fn create_message(&self, request: NewMessage) -> Result<Message> {
        self.require_user(request.user_id).await?;
        self.require_conversation(request.conversation_id).await?;

        let message = self.messages.insert(request).await?;
        debug!(
            message_id = message.id,
            conversation_id = message.conversation_id,
            "Message stored"
        );
        Ok(message)
    }

    pub async fn get_message(&self, id: MessageId) -> Result<Message> {
        self.messages
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServerError::not_found("Message", "id", id))
    }

    pub async fn list_messages(&self, conversation_id: Option<ConversationId>) -> Result<Vec<Message>> {
        Ok(self.messages.list(conversation_id).await?)
    }

    /// Replaces the content of message `id` and optionally moves it to
    /// another author or conversation.
    ///
    /// # Errors
    ///
    /// [`ServerError::NotFound`] if the message, a new author or a new
    /// conversation is absent.
    pub async fn update_message(&self, id: MessageId, update: MessageUpdate) -> Result<Message> {
        let mut message = self.get_message(id).await?;

        if let Some(user_id) = update.user_id {
            self.require_user(user_id).await?;
            message.user_id = user_id;
        }
        if let Some(conversation_id) = update.conversation_id {
            self.require_conversation(conversation_id).await?;
            message.conversation_id = conversation_id;
        }
        message.content = update.content;

        let updated = self
            .messages
            .update(message)
            .await?
            .ok_or_else(|| ServerError::not_found("Message", "id", id))?;
        info!(message_id = id, "Message updated");
        Ok(updated)
    }

    /// Deletes message `id`.
    ///
    /// # Errors
    ///
    /// [`ServerError::NotFound`] if the message is absent.
    pub async fn delete_message(&self, id: MessageId) -> Result<()> {
        if !self.messages.delete(id).await? {
            return Err(ServerError::not_found("Message", "id", id));
        }
        info!(message_id = id, "Message deleted");
        Ok(())
    }

    async fn require_user(&self, id: UserId) -> Result<()> {
        match self.users.find_by_id(id).await? {
            Some(_) => Ok(()),
            None => Err(ServerError::not_found("User", "id", id)),
        }
    }

    async fn require_conversation(&self, id: ConversationId) -> Result<()> {
        match self.conversations.find_by_id(id).await? {
            Some(_) => Ok(()),
            None => Err(ServerError::not_found("Conversation", "id", id)),
        }
    }
}

impl std::fmt::Debug for MessageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageService").finish_non_exhaustive()
    }
}

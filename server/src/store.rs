//! Repository contracts and in-memory implementations.
//!
//! Persistent storage of users, conversations and messages sits behind the
//! three async traits in this module. The in-memory implementations back the
//! server binary and the test suite; a relational store would implement the
//! same traits.
//!
//! The message repository honours idempotency keys: inserting a
//! [`NewMessage`] whose key was already stored returns the existing message
//! instead of creating a second one.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::credentials;
use crate::types::{Conversation, ConversationId, Message, MessageId, NewMessage, User, UserId};

/// Errors raised by storage backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or failed mid-operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Seed data could not be read or applied.
    #[error("invalid seed data: {0}")]
    Seed(String),
}

/// Access to registered identities.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Inserts or replaces a user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if another user already owns the username.
    async fn save(&self, user: User) -> Result<(), StoreError>;
}

/// Access to conversations and their membership sets.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_by_id(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError>;

    async fn save(&self, conversation: Conversation) -> Result<(), StoreError>;

    /// Adds `user_id` to the conversation.
    ///
    /// Returns `None` if the conversation does not exist, otherwise whether
    /// the membership set changed.
    async fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<bool>, StoreError>;

    /// Removes `user_id` from the conversation.
    ///
    /// Returns `None` if the conversation does not exist, otherwise whether
    /// the membership set changed.
    async fn remove_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<bool>, StoreError>;
}

/// Access to persisted messages.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Persists a message, deduplicating on its idempotency key.
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Lists messages in insertion order, optionally for one conversation.
    async fn list(&self, conversation_id: Option<ConversationId>) -> Result<Vec<Message>, StoreError>;

    /// Replaces the stored message with the same id.
    ///
    /// Returns `None` if no such message exists.
    async fn update(&self, message: Message) -> Result<Option<Message>, StoreError>;

    /// Removes a message. Returns `false` if it did not exist.
    async fn delete(&self, id: MessageId) -> Result<bool, StoreError>;
}

// ============================================================================
// In-memory users
// ============================================================================

#[derive(Debug, Default)]
struct UserIndex {
    users: HashMap<UserId, User>,
    by_username: HashMap<String, UserId>,
}

/// Users keyed by id with a username index.
///
/// Both maps sit behind one lock so a rename moves the index entry and the
/// record together.
#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    index: RwLock<UserIndex>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|index| index.users.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, UserIndex>, StoreError> {
        self.index
            .read()
            .map_err(|_| StoreError::Unavailable("user index lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, UserIndex>, StoreError> {
        self.index
            .write()
            .map_err(|_| StoreError::Unavailable("user index lock poisoned".to_string()))
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let index = self.read()?;
        Ok(index
            .by_username
            .get(username)
            .and_then(|id| index.users.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.read()?.users.get(&id).cloned())
    }

    async fn save(&self, user: User) -> Result<(), StoreError> {
        let mut index = self.write()?;
        if let Some(owner) = index.by_username.get(&user.username) {
            if *owner != user.id {
                return Err(StoreError::Conflict(format!(
                    "username '{}' is already taken",
                    user.username
                )));
            }
        }

        let username = user.username.clone();
        index.by_username.insert(username.clone(), user.id);
        if let Some(previous) = index.users.insert(user.id, user) {
            if previous.username != username {
                index.by_username.remove(&previous.username);
            }
        }
        Ok(())
    }
}

// ============================================================================
// In-memory conversations
// ============================================================================

/// Conversations keyed by id; membership updates lock only their own entry.
#[derive(Debug, Default)]
pub struct InMemoryConversationRepository {
    conversations: DashMap<ConversationId, Conversation>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn find_by_id(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.get(&id).map(|c| c.clone()))
    }

    async fn save(&self, conversation: Conversation) -> Result<(), StoreError> {
        self.conversations.insert(conversation.id, conversation);
        Ok(())
    }

    async fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<bool>, StoreError> {
        Ok(self
            .conversations
            .get_mut(&conversation_id)
            .map(|mut c| c.add_participant(user_id)))
    }

    async fn remove_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<bool>, StoreError> {
        Ok(self
            .conversations
            .get_mut(&conversation_id)
            .map(|mut c| c.remove_participant(user_id)))
    }
}

// ============================================================================
// In-memory messages
// ============================================================================

#[derive(Debug, Default)]
struct MessageLog {
    messages: BTreeMap<MessageId, Message>,
    by_key: HashMap<Uuid, MessageId>,
}

/// Message log ordered by id with idempotency-key deduplication.
#[derive(Debug)]
pub struct InMemoryMessageRepository {
    log: Mutex<MessageLog>,
    next_id: AtomicI64,
}

impl Default for InMemoryMessageRepository {
    fn default() -> Self {
        Self {
            log: Mutex::new(MessageLog::default()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MessageLog>, StoreError> {
        self.log
            .lock()
            .map_err(|_| StoreError::Unavailable("message log lock poisoned".to_string()))
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut log = self.lock()?;

        if let Some(key) = message.idempotency_key {
            if let Some(existing) = log.by_key.get(&key).and_then(|id| log.messages.get(id)) {
                return Ok(existing.clone());
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stored = Message {
            id,
            content: message.content,
            user_id: message.user_id,
            conversation_id: message.conversation_id,
            created_at: Utc::now(),
        };

        if let Some(key) = message.idempotency_key {
            log.by_key.insert(key, id);
        }
        log.messages.insert(id, stored.clone());

        Ok(stored)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.lock()?.messages.get(&id).cloned())
    }

    async fn list(&self, conversation_id: Option<ConversationId>) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .lock()?
            .messages
            .values()
            .filter(|m| conversation_id.map_or(true, |id| m.conversation_id == id))
            .cloned()
            .collect())
    }

    async fn update(&self, message: Message) -> Result<Option<Message>, StoreError> {
        let mut log = self.lock()?;
        let Some(stored) = log.messages.get_mut(&message.id) else {
            return Ok(None);
        };
        *stored = message;
        Ok(Some(stored.clone()))
    }

    async fn delete(&self, id: MessageId) -> Result<bool, StoreError> {
        let mut log = self.lock()?;
        if log.messages.remove(&id).is_none() {
            return Ok(false);
        }
        log.by_key.retain(|_, stored| *stored != id);
        Ok(true)
    }
}

// ============================================================================
// Store bundle and seed data
// ============================================================================

/// The three repositories the server runs against.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
}

impl Stores {
    /// Empty in-memory repositories.
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(InMemoryUserRepository::new()),
            conversations: Arc::new(InMemoryConversationRepository::new()),
            messages: Arc::new(InMemoryMessageRepository::new()),
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedUser {
    id: UserId,
    username: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    password_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedConversation {
    id: ConversationId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    participants: Vec<UserId>,
}

/// Users and conversations to preload into the repositories.
#[derive(Debug, Default, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    users: Vec<SeedUser>,
    #[serde(default)]
    conversations: Vec<SeedConversation>,
}

impl SeedData {
    /// Parses seed JSON.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        serde_json::from_str(json).map_err(|e| StoreError::Seed(e.to_string()))
    }

    /// Reads and parses a seed file.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::Seed(format!("failed to read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Writes the seed into `stores`. Plain passwords are hashed with `bcrypt_cost`.
    pub async fn apply(self, stores: &Stores, bcrypt_cost: u32) -> Result<(), StoreError> {
        let user_count = self.users.len();
        let conversation_count = self.conversations.len();

        for seed in self.users {
            let hash = match (seed.password_hash, seed.password) {
                (Some(hash), _) => hash,
                (None, Some(password)) => {
                    let cost = bcrypt_cost;
                    tokio::task::spawn_blocking(move || credentials::hash_password_with_cost(&password, cost))
                        .await
                        .map_err(|e| StoreError::Seed(format!("hashing task failed: {e}")))?
                        .map_err(|e| StoreError::Seed(e.to_string()))?
                }
                (None, None) => {
                    return Err(StoreError::Seed(format!(
                        "user '{}' needs a password or passwordHash",
                        seed.username
                    )));
                }
            };
            stores.users.save(User::new(seed.id, seed.username, hash)).await?;
        }

        for seed in self.conversations {
            let mut conversation = Conversation::new(seed.id, seed.name);
            conversation.participants.extend(seed.participants);
            stores.conversations.save(conversation).await?;
        }

        info!(
            users = user_count,
            conversations = conversation_count,
            "Seed data loaded"
        );
        Ok(())
    }
}

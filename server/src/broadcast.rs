//! Fan-out of persisted chat events to live subscribers.
//!
//! The egress stage hands each event to the [`ChatBroadcaster`] after
//! persistence; every WebSocket connection holds a receiver on the same
//! channel and forwards what passes its [`SubscriberFilter`].
//!
//! # Example
//!
//! ```rust
//! use courier_server::broadcast::{ChatBroadcaster, SubscriberFilter};
//! use courier_server::types::ChatEvent;
//!
//! let broadcaster = ChatBroadcaster::new();
//! let _rx = broadcaster.subscribe();
//!
//! let event = ChatEvent::chat("hi", 1, 1);
//! assert_eq!(broadcaster.broadcast(event.clone()), 1);
//!
//! let filter = SubscriberFilter::new().with_conversation(1);
//! assert!(filter.matches(&event));
//! ```

use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::types::{ChatEvent, ChatEventKind, ConversationId};

/// Name of the public topic every connection subscribes to.
pub const PUBLIC_TOPIC: &str = "/topic/public";

/// Default channel capacity.
///
/// Receivers that fall further behind than this get `RecvError::Lagged` and
/// skip the missed events.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Multi-subscriber hub for chat events.
///
/// Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct ChatBroadcaster {
    sender: Sender<ChatEvent>,
}

impl ChatBroadcaster {
    /// Creates a broadcaster with [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a broadcaster holding up to `capacity` undelivered events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        debug!(capacity, topic = PUBLIC_TOPIC, "Created chat broadcaster");
        Self { sender }
    }

    /// Receives every event broadcast after this call.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<ChatEvent> {
        let rx = self.sender.subscribe();
        debug!(
            subscriber_count = self.subscriber_count(),
            "New subscriber added"
        );
        rx
    }

    /// Sends `event` to all subscribers and returns how many there were.
    ///
    /// Never blocks. With no subscribers the event is discarded.
    pub fn broadcast(&self, event: ChatEvent) -> usize {
        trace!(
            kind = %event.kind,
            conversation_id = event.conversation_id,
            actor_id = event.actor_id,
            "Broadcasting chat event"
        );

        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No live subscribers for chat event");
                0
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChatBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection selection of events. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberFilter {
    conversation_id: Option<ConversationId>,
    kind: Option<ChatEventKind>,
}

impl SubscriberFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ChatEventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// AND across all set criteria.
    #[must_use]
    pub fn matches(&self, event: &ChatEvent) -> bool {
        self.conversation_id
            .map_or(true, |id| id == event.conversation_id)
            && self.kind.map_or(true, |kind| kind == event.kind)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversation_id.is_none() && self.kind.is_none()
    }
}

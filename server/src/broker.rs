//! Message broker contract and an in-process durable implementation.
//!
//! Publishers only see the [`Broker`] trait: a payload goes to a named
//! exchange with a routing key. The [`InMemoryBroker`] routes it to every
//! queue whose binding pattern matches the key, using AMQP topic rules:
//!
//! - words are separated by `.`
//! - `*` matches exactly one word
//! - `#` matches zero or more words
//!
//! Queues are FIFO and at-least-once. A [`Delivery`] stays unacknowledged
//! until it is acked or nacked; dropping it unsettled returns the message to
//! the head of its queue flagged as redelivered.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Exchange chat events are published to.
pub const CHAT_EXCHANGE: &str = "chat.exchange";

/// Durable queue the egress stage consumes.
pub const CHAT_QUEUE: &str = "chat.queue";

/// Routing key binding [`CHAT_QUEUE`] to [`CHAT_EXCHANGE`].
pub const CHAT_ROUTING_KEY: &str = "chat.message";

/// Errors raised by broker operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("exchange '{0}' is not declared")]
    UnknownExchange(String),

    #[error("queue '{0}' is not declared")]
    UnknownQueue(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("broker is closed")]
    Closed,

    #[error("broker state is unavailable")]
    Poisoned,
}

/// Publishing side of a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Routes `payload` through `exchange` using `routing_key`.
    ///
    /// Returns the number of queues the message was stored in.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<usize, BrokerError>;
}

/// Returns `true` if `routing_key` matches the topic `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            match_words(&pattern[1..], key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => match_words(&pattern[1..], &key[1..]),
        (Some(word), Some(k)) if word == k => match_words(&pattern[1..], &key[1..]),
        _ => false,
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Arc<[u8]>,
    redelivered: bool,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    next_tag: u64,
}

#[derive(Debug)]
struct Queue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

impl Queue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, BrokerError> {
        self.state.lock().map_err(|_| BrokerError::Poisoned)
    }

    fn push(&self, payload: Arc<[u8]>) -> Result<(), BrokerError> {
        self.lock()?.ready.push_back(StoredMessage {
            payload,
            redelivered: false,
            delivery_count: 0,
        });
        self.notify.notify_one();
        Ok(())
    }

    fn take(&self) -> Result<Option<(u64, StoredMessage)>, BrokerError> {
        let mut state = self.lock()?;
        let Some(mut message) = state.ready.pop_front() else {
            return Ok(None);
        };
        message.delivery_count += 1;
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(tag, message.clone());
        Ok(Some((tag, message)))
    }

    fn settle(&self, tag: u64, requeue: bool) {
        let Ok(mut state) = self.lock() else {
            warn!(queue = %self.name, tag, "Queue lock poisoned, settlement lost");
            return;
        };
        let Some(mut message) = state.unacked.remove(&tag) else {
            return;
        };
        if requeue {
            message.redelivered = true;
            state.ready.push_front(message);
            drop(state);
            self.notify.notify_one();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

// ============================================================================
// Broker
// ============================================================================

#[derive(Debug)]
struct Binding {
    pattern: String,
    queue: Arc<Queue>,
}

#[derive(Debug, Default)]
struct Topology {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, Arc<Queue>>,
}

/// In-process topic broker with durable, acknowledged queues.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    topology: RwLock<Topology>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker with the chat exchange, queue and binding declared.
    pub fn with_chat_topology() -> Result<Self, BrokerError> {
        let broker = Self::new();
        broker.declare_exchange(CHAT_EXCHANGE)?;
        broker.declare_queue(CHAT_QUEUE)?;
        broker.bind(CHAT_QUEUE, CHAT_EXCHANGE, CHAT_ROUTING_KEY)?;
        Ok(broker)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Topology>, BrokerError> {
        self.topology.read().map_err(|_| BrokerError::Poisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Topology>, BrokerError> {
        self.topology.write().map_err(|_| BrokerError::Poisoned)
    }

    /// Declares a topic exchange. Redeclaring is a no-op.
    pub fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.write()?.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    /// Declares a queue. Redeclaring keeps the existing messages.
    pub fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.write()?
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Queue::new(name)));
        Ok(())
    }

    /// Binds `queue` to `exchange` for keys matching `pattern`.
    pub fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        let mut topology = self.write()?;
        let queue = topology
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let bindings = topology
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        if !bindings
            .iter()
            .any(|b| b.pattern == pattern && Arc::ptr_eq(&b.queue, &queue))
        {
            bindings.push(Binding {
                pattern: pattern.to_string(),
                queue,
            });
        }
        Ok(())
    }

    /// Opens a consumer on `queue`. Several consumers compete for messages.
    pub fn consume(&self, queue: &str) -> Result<QueueConsumer, BrokerError> {
        let queue = self
            .read()?
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        Ok(QueueConsumer { queue })
    }

    /// Returns `(ready, unacked)` message counts for `queue`.
    pub fn queue_depth(&self, queue: &str) -> Result<(usize, usize), BrokerError> {
        let queue = self
            .read()?
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let state = queue.lock()?;
        Ok((state.ready.len(), state.unacked.len()))
    }

    /// Wakes all consumers and makes further `next` calls return `None`.
    pub fn close(&self) {
        if let Ok(topology) = self.read() {
            for queue in topology.queues.values() {
                queue.close();
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<usize, BrokerError> {
        let payload: Arc<[u8]> = payload.into();
        let topology = self.read()?;
        let bindings = topology
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        let mut routed = 0;
        for binding in bindings {
            if binding.queue.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }
            if topic_matches(&binding.pattern, routing_key) {
                binding.queue.push(Arc::clone(&payload))?;
                routed += 1;
            }
        }

        if routed == 0 {
            debug!(exchange, routing_key, "Published message matched no binding");
        } else {
            trace!(exchange, routing_key, routed, "Message routed");
        }
        Ok(routed)
    }
}

// ============================================================================
// Consumption
// ============================================================================

/// Receives deliveries from one queue.
#[derive(Debug, Clone)]
pub struct QueueConsumer {
    queue: Arc<Queue>,
}

impl QueueConsumer {
    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    /// Waits for the next message. Returns `None` once the broker is closed.
    pub async fn next(&self) -> Option<Delivery> {
        loop {
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            match self.queue.take() {
                Ok(Some((tag, message))) => {
                    return Some(Delivery {
                        tag,
                        payload: message.payload,
                        redelivered: message.redelivered,
                        delivery_count: message.delivery_count,
                        queue: Arc::clone(&self.queue),
                        settled: false,
                    });
                }
                Ok(None) => self.queue.notify.notified().await,
                Err(e) => {
                    warn!(queue = %self.queue.name, error = %e, "Consumer stopped");
                    return None;
                }
            }
        }
    }
}

/// One message handed to a consumer, pending settlement.
#[derive(Debug)]
pub struct Delivery {
    tag: u64,
    payload: Arc<[u8]>,
    redelivered: bool,
    delivery_count: u32,
    queue: Arc<Queue>,
    settled: bool,
}

impl Delivery {
    pub fn delivery_tag(&self) -> u64 {
        self.tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// `true` if this message was delivered before and not acked.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Number of times this message has been delivered, this one included.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Deserializes the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        serde_json::from_slice(&self.payload).map_err(|e| BrokerError::Decode(e.to_string()))
    }

    /// Removes the message from the queue.
    pub fn ack(mut self) {
        self.settled = true;
        self.queue.settle(self.tag, false);
    }

    /// Rejects the message, returning it to the head of the queue if `requeue`.
    pub fn nack(mut self, requeue: bool) {
        self.settled = true;
        self.queue.settle(self.tag, requeue);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            debug!(queue = %self.queue.name, tag = self.tag, "Unsettled delivery requeued");
            self.queue.settle(self.tag, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn publish(broker: &InMemoryBroker, body: &str) -> usize {
        broker
            .publish(CHAT_EXCHANGE, CHAT_ROUTING_KEY, body.as_bytes().to_vec())
            .await
            .unwrap()
    }

    async fn next(consumer: &QueueConsumer) -> Delivery {
        timeout(Duration::from_secs(1), consumer.next())
            .await
            .expect("timed out waiting for delivery")
            .expect("consumer closed")
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("chat.message", "chat.message"));
        assert!(!topic_matches("chat.message", "chat.messages"));
        assert!(topic_matches("chat.*", "chat.message"));
        assert!(!topic_matches("chat.*", "chat.message.edit"));
        assert!(topic_matches("chat.#", "chat"));
        assert!(topic_matches("chat.#", "chat.message.edit"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.message", "chat.message"));
        assert!(!topic_matches("*.message", "message"));
    }

    #[tokio::test]
    async fn routes_to_bound_queue_in_fifo_order() {
        let broker = InMemoryBroker::with_chat_topology().unwrap();
        assert_eq!(publish(&broker, "one").await, 1);
        publish(&broker, "two").await;

        let consumer = broker.consume(CHAT_QUEUE).unwrap();
        let first = next(&consumer).await;
        assert_eq!(first.payload(), b"one");
        first.ack();
        let second = next(&consumer).await;
        assert_eq!(second.payload(), b"two");
        second.ack();

        assert_eq!(broker.queue_depth(CHAT_QUEUE).unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn unmatched_key_is_dropped() {
        let broker = InMemoryBroker::with_chat_topology().unwrap();
        let routed = broker
            .publish(CHAT_EXCHANGE, "presence.update", b"x".to_vec())
            .await
            .unwrap();
        assert_eq!(routed, 0);
        assert_eq!(broker.queue_depth(CHAT_QUEUE).unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn unknown_exchange_and_queue_are_errors() {
        let broker = InMemoryBroker::new();
        assert_eq!(
            broker.publish("nope", "k", vec![]).await,
            Err(BrokerError::UnknownExchange("nope".into()))
        );
        assert!(matches!(
            broker.consume("nope"),
            Err(BrokerError::UnknownQueue(_))
        ));
        assert!(matches!(
            broker.bind("nope", "nope", "#"),
            Err(BrokerError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn fanout_to_multiple_matching_queues() {
        let broker = InMemoryBroker::with_chat_topology().unwrap();
        broker.declare_queue("audit").unwrap();
        broker.bind("audit", CHAT_EXCHANGE, "chat.#").unwrap();

        assert_eq!(publish(&broker, "hi").await, 2);
        assert_eq!(broker.queue_depth("audit").unwrap(), (1, 0));
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers_at_head() {
        let broker = InMemoryBroker::with_chat_topology().unwrap();
        publish(&broker, "one").await;
        publish(&broker, "two").await;
        let consumer = broker.consume(CHAT_QUEUE).unwrap();

        let first = next(&consumer).await;
        assert!(!first.redelivered());
        assert_eq!(first.delivery_count(), 1);
        first.nack(true);

        let again = next(&consumer).await;
        assert_eq!(again.payload(), b"one");
        assert!(again.redelivered());
        assert_eq!(again.delivery_count(), 2);
        again.ack();
    }

    #[tokio::test]
    async fn nack_without_requeue_discards() {
        let broker = InMemoryBroker::with_chat_topology().unwrap();
        publish(&broker, "poison").await;
        let consumer = broker.consume(CHAT_QUEUE).unwrap();

        next(&consumer).await.nack(false);

        assert_eq!(broker.queue_depth(CHAT_QUEUE).unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn unsettled_delivery_is_retained_then_requeued_on_drop() {
        let broker = InMemoryBroker::with_chat_topology().unwrap();
        publish(&broker, "one").await;
        let consumer = broker.consume(CHAT_QUEUE).unwrap();

        let delivery = next(&consumer).await;
        assert_eq!(broker.queue_depth(CHAT_QUEUE).unwrap(), (0, 1));
        drop(delivery);

        assert_eq!(broker.queue_depth(CHAT_QUEUE).unwrap(), (1, 0));
        assert!(next(&consumer).await.redelivered());
    }

    #[tokio::test]
    async fn consumer_waits_for_publish() {
        let broker = Arc::new(InMemoryBroker::with_chat_topology().unwrap());
        let consumer = broker.consume(CHAT_QUEUE).unwrap();

        let publisher = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publish(&publisher, "late").await;
        });

        assert_eq!(next(&consumer).await.payload(), b"late");
    }

    #[tokio::test]
    async fn close_ends_consumption_and_rejects_publish() {
        let broker = InMemoryBroker::with_chat_topology().unwrap();
        let consumer = broker.consume(CHAT_QUEUE).unwrap();

        broker.close();

        assert!(consumer.next().await.is_none());
        assert_eq!(
            broker
                .publish(CHAT_EXCHANGE, CHAT_ROUTING_KEY, vec![])
                .await,
            Err(BrokerError::Closed)
        );
    }

    #[tokio::test]
    async fn decode_reads_json_payload() {
        let broker = InMemoryBroker::with_chat_topology().unwrap();
        publish(&broker, r#"{"n": 3}"#).await;
        let consumer = broker.consume(CHAT_QUEUE).unwrap();

        let delivery = next(&consumer).await;
        let value: serde_json::Value = delivery.decode().unwrap();
        assert_eq!(value["n"], 3);

        let bad = InMemoryBroker::with_chat_topology().unwrap();
        publish(&bad, "not json").await;
        let delivery = next(&bad.consume(CHAT_QUEUE).unwrap()).await;
        assert!(matches!(
            delivery.decode::<serde_json::Value>(),
            Err(BrokerError::Decode(_))
        ));
    }
}

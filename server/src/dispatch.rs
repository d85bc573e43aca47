//! The two-stage chat delivery pipeline.
//!
//! ```text
//!   client ──► ChatDispatcher ──► WorkerPool ──► MessageTypeProcessor
//!                                                   │ ok
//!                                                   ▼
//!                                      Broker (chat.exchange / chat.message)
//!                                                   │
//!   subscribers ◄── ChatBroadcaster ◄── EgressConsumer (chat.queue)
//! ```
//!
//! Ingress never blocks the caller: [`ChatDispatcher::submit`] returns a
//! [`Submission`] whose outcome can be awaited or ignored. Egress is a
//! separate task that only talks to the broker queue, persists, and then
//! broadcasts, so an event is durable before it is visible.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broadcast::ChatBroadcaster;
use crate::broker::{Broker, BrokerError, Delivery, QueueConsumer, CHAT_EXCHANGE, CHAT_ROUTING_KEY};
use crate::error::{Result, ServerError};
use crate::messages::MessageService;
use crate::pool::{PoolError, WorkerPool};
use crate::processor::{MessageTypeProcessor, Outcome};
use crate::types::{ChatEvent, ChatEventKind, Envelope, NewMessage};

/// Deliveries of one envelope before egress gives up on it.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Base delay before a failed delivery is requeued.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(100);

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Ingress
// ============================================================================

/// A chat event accepted for asynchronous processing.
#[derive(Debug)]
pub struct Submission {
    envelope_id: Uuid,
    receiver: oneshot::Receiver<Result<Outcome>>,
}

impl Submission {
    /// Identifier carried through the broker and used as idempotency key.
    pub fn envelope_id(&self) -> Uuid {
        self.envelope_id
    }

    /// Waits for processing to finish.
    pub async fn outcome(self) -> Result<Outcome> {
        self.receiver
            .await
            .map_err(|_| ServerError::internal("chat processing task ended without a result"))?
    }
}

/// Accepts chat events and runs them through the ingress stage.
#[derive(Clone)]
pub struct ChatDispatcher {
    pool: WorkerPool,
    processor: MessageTypeProcessor,
    broker: Arc<dyn Broker>,
}

impl ChatDispatcher {
    pub fn new(pool: WorkerPool, processor: MessageTypeProcessor, broker: Arc<dyn Broker>) -> Self {
        Self {
            pool,
            processor,
            broker,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Validates `event` and schedules it on the worker pool.
    ///
    /// The scheduled job applies the event through the processor and, on
    /// success, publishes it to the chat exchange.
    ///
    /// # Errors
    ///
    /// [`ServerError::Validation`] for a malformed event and
    /// [`ServerError::Unavailable`] when the pool cannot take more work.
    /// Processing failures are reported through [`Submission::outcome`].
    pub fn submit(&self, event: ChatEvent) -> Result<Submission> {
        event.validate().map_err(ServerError::validation)?;

        let envelope = Envelope::new(event);
        let envelope_id = envelope.id;
        let processor = self.processor.clone();
        let broker = Arc::clone(&self.broker);

        let receiver = self
            .pool
            .submit(async move { ingest(processor, broker, envelope).await })
            .map_err(|e| match e {
                PoolError::Saturated => ServerError::unavailable("chat worker pool is saturated"),
                PoolError::Closed => ServerError::unavailable("chat worker pool is shut down"),
            })?;

        debug!(envelope_id = %envelope_id, "Chat event accepted");
        Ok(Submission {
            envelope_id,
            receiver,
        })
    }
}

impl std::fmt::Debug for ChatDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatDispatcher")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

async fn ingest(
    processor: MessageTypeProcessor,
    broker: Arc<dyn Broker>,
    envelope: Envelope,
) -> Result<Outcome> {
    let kind = envelope.event.kind;
    let outcome = match processor.process(&envelope.event, Some(envelope.id)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(envelope_id = %envelope.id, %kind, error = %e, "Error processing chat event");
            return Err(e);
        }
    };
    info!(envelope_id = %envelope.id, %kind, outcome = %outcome, "Processed chat event");

    let payload = serde_json::to_vec(&envelope)
        .map_err(|e| ServerError::from(BrokerError::Encode(e.to_string())))?;
    broker
        .publish(CHAT_EXCHANGE, CHAT_ROUTING_KEY, payload)
        .await
        .inspect_err(|e| {
            error!(envelope_id = %envelope.id, error = %e, "Failed to publish chat event");
        })?;

    Ok(outcome)
}

// ============================================================================
// Egress
// ============================================================================

/// What egress did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressOutcome {
    /// Persisted (if CHAT), broadcast and acked.
    Delivered,
    /// Returned to the queue for another attempt.
    Requeued,
    /// Acked or rejected without broadcast.
    Discarded,
}

/// Consumes the chat queue, persists CHAT events and fans out every event.
pub struct EgressConsumer {
    consumer: QueueConsumer,
    messages: MessageService,
    broadcaster: ChatBroadcaster,
    retry_base: Duration,
}

impl EgressConsumer {
    pub fn new(consumer: QueueConsumer, messages: MessageService, broadcaster: ChatBroadcaster) -> Self {
        Self {
            consumer,
            messages,
            broadcaster,
            retry_base: DEFAULT_RETRY_BASE,
        }
    }

    /// Overrides the base delay applied before requeueing a failed delivery.
    #[must_use]
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    /// Runs [`EgressConsumer::run`] on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Handles deliveries until the broker closes.
    pub async fn run(self) {
        info!(queue = self.consumer.queue_name(), "Egress consumer started");
        while let Some(delivery) = self.consumer.next().await {
            self.handle(delivery).await;
        }
        info!("Egress consumer stopped");
    }

    /// Settles one delivery.
    pub async fn handle(&self, delivery: Delivery) -> EgressOutcome {
        let envelope: Envelope = match delivery.decode() {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(tag = delivery.delivery_tag(), error = %e, "Undecodable chat envelope, dropping");
                delivery.nack(false);
                return EgressOutcome::Discarded;
            }
        };

        if envelope.event.kind == ChatEventKind::Chat {
            let Some(request) = NewMessage::from_event(&envelope.event, Some(envelope.id)) else {
                warn!(envelope_id = %envelope.id, "CHAT envelope without content, dropping");
                delivery.ack();
                return EgressOutcome::Discarded;
            };

            match self.messages.create_message(request).await {
                Ok(message) => {
                    debug!(
                        envelope_id = %envelope.id,
                        message_id = message.id,
                        redelivered = delivery.redelivered(),
                        "Persisted chat message"
                    );
                }
                Err(e) if e.is_not_found() => {
                    warn!(envelope_id = %envelope.id, error = %e, "Chat message references missing data, dropping");
                    delivery.ack();
                    return EgressOutcome::Discarded;
                }
                Err(e) => return self.retry_or_drop(delivery, &envelope, &e).await,
            }
        }

        let receivers = self.broadcaster.broadcast(envelope.event);
        debug!(envelope_id = %envelope.id, receivers, "Chat event broadcast");
        delivery.ack();
        EgressOutcome::Delivered
    }

    async fn retry_or_drop(&self, delivery: Delivery, envelope: &Envelope, err: &ServerError) -> EgressOutcome {
        let attempt = delivery.delivery_count();
        if attempt >= MAX_DELIVERY_ATTEMPTS {
            error!(
                envelope_id = %envelope.id,
                attempts = attempt,
                error = %err,
                "Chat message could not be persisted, giving up"
            );
            delivery.nack(false);
            return EgressOutcome::Discarded;
        }

        let delay = self.retry_delay(attempt);
        warn!(
            envelope_id = %envelope.id,
            attempt,
            max_attempts = MAX_DELIVERY_ATTEMPTS,
            delay_ms = delay.as_millis(),
            error = %err,
            "Chat message persistence failed, requeueing"
        );
        tokio::time::sleep(delay).await;
        delivery.nack(true);
        EgressOutcome::Requeued
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(MAX_RETRY_DELAY)
    }
}

impl std::fmt::Debug for EgressConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressConsumer")
            .field("queue", &self.consumer.queue_name())
            .field("retry_base", &self.retry_base)
            .finish_non_exhaustive()
    }
}

//! Room broker for event distribution.
//!
//! This module contains:
//! - `Broker` trait: connection-level capability (sessions, membership, close)
//! - `BrokerSession` trait: per-call publish and subscribe
//! - `Subscription`: cancellable stream of raw deliveries
//! - `publish_event`: the reliable publish path for domain events
//! - Implementations: AMQP (RabbitMQ), NATS, in-process channel, mock

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::{BrokerConfig, BrokerType};
use crate::event::Event;
use crate::proto;
use crate::routing::RoutingKey;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod confirm;
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use channel::ChannelBroker;
pub use confirm::{Confirmation, ConfirmTracker};
pub use mock::MockBroker;
#[cfg(feature = "nats")]
pub use nats::NatsBroker;

/// Buffered deliveries per subscription. Network pumps wait for room; the
/// in-process broker drops deliveries for a subscription that is full.
pub const SUBSCRIPTION_CAPACITY: usize = 64;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Broker nack-ed message #{delivery_tag}")]
    PublishRejected { delivery_tag: u64 },

    #[error("No ack for message #{delivery_tag} within the confirm wait")]
    PublishTimeout { delivery_tag: u64 },

    #[error("Expected delivery tag {expected}, got {got}")]
    SequenceMismatch { expected: u64, got: u64 },

    #[error("Encode failed: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("Event has no routing kind")]
    Unroutable,

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Membership query failed: {0}")]
    Membership(String),
}

/// Raw message received on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Concrete topic (routing key / subject) the message was published on.
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Connection-level broker capability, shared by all calls.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ topic exchange with publisher confirms
/// - `NatsBroker`: NATS subjects, fire-and-forget
/// - `ChannelBroker`: in-process, for single-node use and tests
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a session owned by exactly one call.
    ///
    /// Sessions are never shared: publisher acknowledgements are correlated
    /// per session.
    async fn session(&self) -> Result<Box<dyn BrokerSession>>;

    /// Advisory count of live subscriptions on exactly `pattern`.
    ///
    /// `None` when the backend cannot answer.
    async fn subscriber_count(&self, pattern: &RoutingKey) -> Result<Option<u32>>;

    /// Close the underlying connections.
    async fn close(&self) -> Result<()>;
}

/// Per-call broker session.
#[async_trait]
pub trait BrokerSession: Send {
    /// Publish one message.
    ///
    /// In confirm mode this returns once the broker acknowledged the message;
    /// otherwise as soon as it is sent.
    async fn publish(&mut self, key: &RoutingKey, payload: &[u8]) -> Result<()>;

    /// Subscribe to a topic pattern on behalf of `subscriber`.
    async fn subscribe(&mut self, pattern: &RoutingKey, subscriber: &str) -> Result<Subscription>;

    /// Release the session. Safe to call more than once.
    async fn close(&mut self);
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Cancels a subscription from anywhere. Idempotent.
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Live subscription: deliveries in broker order.
///
/// Dropping it cancels it, on every exit path.
pub struct Subscription {
    pattern: String,
    deliveries: mpsc::Receiver<Delivery>,
    cancelled: watch::Receiver<bool>,
    handle: CancelHandle,
}

/// Producer half of a subscription, driven by a backend pump task.
#[derive(Clone)]
pub struct DeliveryFeed {
    tx: mpsc::Sender<Delivery>,
    cancelled: watch::Receiver<bool>,
}

/// Create a linked feed/subscription pair for `pattern`.
pub fn subscription_channel(pattern: impl Into<String>) -> (DeliveryFeed, Subscription) {
    let (tx, deliveries) = mpsc::channel(SUBSCRIPTION_CAPACITY);
    let (cancel_tx, cancelled) = watch::channel(false);
    let feed = DeliveryFeed {
        tx,
        cancelled: cancelled.clone(),
    };
    let subscription = Subscription {
        pattern: pattern.into(),
        deliveries,
        cancelled,
        handle: CancelHandle(Arc::new(cancel_tx)),
    };
    (feed, subscription)
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Next delivery. `None` once cancelled or once the backend stopped.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            if *self.cancelled.borrow_and_update() {
                return None;
            }
            tokio::select! {
                delivery = self.deliveries.recv() => return delivery,
                changed = self.cancelled.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

/// Result of [`DeliveryFeed::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// Subscriber is behind; the delivery was dropped.
    Full,
    /// Subscription cancelled or dropped.
    Gone,
}

impl DeliveryFeed {
    /// Forward a delivery. `false` once the subscription is gone.
    pub async fn send(&self, delivery: Delivery) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.tx.send(delivery).await.is_ok()
    }

    /// Forward a delivery without waiting for buffer space.
    pub fn offer(&self, delivery: Delivery) -> Offer {
        if self.is_cancelled() {
            return Offer::Gone;
        }
        match self.tx.try_send(delivery) {
            Ok(()) => Offer::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => Offer::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Gone,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow() || self.tx.is_closed()
    }

    /// Resolves once the subscription is cancelled or dropped.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.cancelled.borrow_and_update() {
                return;
            }
            if self.cancelled.changed().await.is_err() {
                return;
            }
        }
    }
}

// ============================================================================
// Publish path
// ============================================================================

/// Serialize and publish a domain event on its routing key.
pub async fn publish_event(session: &mut dyn BrokerSession, event: &Event) -> Result<()> {
    let key = event.routing_key().ok_or(BusError::Unroutable)?;

    let wire = proto::Event::from(event);
    let mut payload = Vec::with_capacity(wire.encoded_len());
    wire.encode(&mut payload)?;

    debug!(rk = %key, bytes = payload.len(), "publishing");
    let start = Instant::now();
    session.publish(&key, &payload).await?;
    debug!(
        rk = %key,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "published"
    );
    Ok(())
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the broker selected by configuration.
///
/// Requires the corresponding feature to be enabled:
/// - AMQP: `--features amqp`
/// - NATS: `--features nats`
pub async fn init_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    match config.broker_type {
        BrokerType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker = AmqpBroker::connect(&config.amqp).await?;
                info!(broker_type = "amqp", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(BusError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        BrokerType::Nats => {
            #[cfg(feature = "nats")]
            {
                let broker = NatsBroker::connect(&config.nats).await?;
                info!(broker_type = "nats", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "nats"))]
            {
                Err(BusError::Connection(
                    "NATS support requires the 'nats' feature. Rebuild with --features nats"
                        .to_string(),
                ))
            }
        }
        BrokerType::Channel => {
            info!(broker_type = "channel", "Broker initialized");
            Ok(Arc::new(ChannelBroker::new()))
        }
    }
}

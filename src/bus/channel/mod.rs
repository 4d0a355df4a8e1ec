//! In-memory channel-based broker for single-node mode.
//!
//! Routes publishes to subscriptions within a single process, matching topics
//! against patterns with single-segment `*` wildcards like an AMQP topic
//! exchange or NATS subjects would.
//! Ideal for local development and testing without external dependencies.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    subscription_channel, Broker, BrokerSession, BusError, Delivery, DeliveryFeed, Offer,
    Result, Subscription,
};
use crate::routing::{topic_matches, RoutingKey};

/// One live subscription as seen by the publisher side.
struct Route {
    pattern: String,
    subscriber: String,
    feed: DeliveryFeed,
}

#[derive(Default)]
struct Routes {
    routes: Vec<Route>,
    closed: bool,
}

/// In-process broker.
///
/// Cloning yields a handle to the same routing table.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    routes: Arc<RwLock<Routes>>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        info!("Channel broker initialized");
        Self::default()
    }

    /// Subscribers currently routed, across all patterns.
    pub async fn route_count(&self) -> usize {
        let mut routes = self.routes.write().await;
        routes.routes.retain(|r| !r.feed.is_cancelled());
        routes.routes.len()
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn session(&self) -> Result<Box<dyn BrokerSession>> {
        if self.routes.read().await.closed {
            return Err(BusError::Connection("channel broker is closed".to_string()));
        }
        Ok(Box::new(ChannelSession {
            broker: self.clone(),
            closed: false,
        }))
    }

    async fn subscriber_count(&self, pattern: &RoutingKey) -> Result<Option<u32>> {
        let pattern = pattern.encode();
        let routes = self.routes.read().await;
        let count = routes
            .routes
            .iter()
            .filter(|r| r.pattern == pattern && !r.feed.is_cancelled())
            .count();
        Ok(Some(count as u32))
    }

    async fn close(&self) -> Result<()> {
        let mut routes = self.routes.write().await;
        routes.closed = true;
        // Dropping the feeds ends every live subscription
        routes.routes.clear();
        info!("Channel broker closed");
        Ok(())
    }
}

/// Session on the in-process broker. Publishes complete once handed to every
/// matching subscription.
pub struct ChannelSession {
    broker: ChannelBroker,
    closed: bool,
}

#[async_trait]
impl BrokerSession for ChannelSession {
    async fn publish(&mut self, key: &RoutingKey, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(BusError::Publish("session is closed".to_string()));
        }
        self.broker.deliver(&key.encode(), payload).await?;
        Ok(())
    }

    async fn subscribe(&mut self, pattern: &RoutingKey, subscriber: &str) -> Result<Subscription> {
        if self.closed {
            return Err(BusError::Subscribe("session is closed".to_string()));
        }
        let pattern = pattern.encode();
        let (feed, subscription) = subscription_channel(pattern.clone());

        let mut routes = self.broker.routes.write().await;
        if routes.closed {
            return Err(BusError::Subscribe("channel broker is closed".to_string()));
        }
        routes.routes.push(Route {
            pattern: pattern.clone(),
            subscriber: subscriber.to_string(),
            feed,
        });
        debug!(
            pattern = %pattern,
            subscriber = %subscriber,
            routes = routes.routes.len(),
            "Channel subscription added"
        );
        Ok(subscription)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

impl ChannelBroker {
    /// Hand a raw delivery to every subscription whose pattern matches
    /// `topic`. Returns the number of subscriptions reached.
    ///
    /// Never waits on a subscriber: a subscription whose buffer is full
    /// misses this delivery, so one stalled stream cannot block the room.
    pub async fn deliver(&self, topic: &str, payload: &[u8]) -> Result<usize> {
        let mut routes = self.routes.write().await;
        if routes.closed {
            return Err(BusError::Connection("channel broker is closed".to_string()));
        }
        routes.routes.retain(|r| !r.feed.is_cancelled());

        let mut delivered = 0usize;
        for route in routes.routes.iter().filter(|r| topic_matches(&r.pattern, topic)) {
            let delivery = Delivery {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            match route.feed.offer(delivery) {
                Offer::Accepted => delivered += 1,
                Offer::Full => warn!(
                    rk = %topic,
                    subscriber = %route.subscriber,
                    "Subscriber lagging, dropped delivery"
                ),
                Offer::Gone => {}
            }
        }
        debug!(rk = %topic, receivers = delivered, "Published to channel");
        Ok(delivered)
    }

    /// Subscribers routed on exactly `pattern`, for diagnostics.
    pub async fn subscribers_of(&self, pattern: &RoutingKey) -> Vec<String> {
        let pattern = pattern.encode();
        self.routes
            .read()
            .await
            .routes
            .iter()
            .filter(|r| r.pattern == pattern && !r.feed.is_cancelled())
            .map(|r| r.subscriber.clone())
            .collect()
    }
}

//! Mock broker implementation for testing.
//!
//! Routes through an in-process [`ChannelBroker`] and records every publish,
//! with switches to make individual operations fail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Broker, BrokerSession, BusError, ChannelBroker, Delivery, Result, Subscription};
use crate::routing::{EventKind, KindFilter, RoutingKey};

#[derive(Default)]
struct Switches {
    fail_on_session: bool,
    fail_on_publish: bool,
    fail_on_subscribe: bool,
    fail_on_membership: bool,
    fail_kinds: Vec<EventKind>,
    publish_delay: Option<Duration>,
}

/// Mock broker for testing.
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: ChannelBroker,
    switches: Arc<RwLock<Switches>>,
    published: Arc<RwLock<Vec<Delivery>>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The in-process broker the mock routes through.
    pub fn channel(&self) -> &ChannelBroker {
        &self.inner
    }

    pub async fn set_fail_on_session(&self, fail: bool) {
        self.switches.write().await.fail_on_session = fail;
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        self.switches.write().await.fail_on_publish = fail;
    }

    pub async fn set_fail_on_subscribe(&self, fail: bool) {
        self.switches.write().await.fail_on_subscribe = fail;
    }

    pub async fn set_fail_on_membership(&self, fail: bool) {
        self.switches.write().await.fail_on_membership = fail;
    }

    /// Fail publishes of one event kind only.
    pub async fn fail_publish_of(&self, kind: EventKind) {
        self.switches.write().await.fail_kinds.push(kind);
    }

    /// Delay every publish, e.g. to outlast a call deadline.
    pub async fn set_publish_delay(&self, delay: Option<Duration>) {
        self.switches.write().await.publish_delay = delay;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<Delivery> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn session(&self) -> Result<Box<dyn BrokerSession>> {
        if self.switches.read().await.fail_on_session {
            return Err(BusError::Connection("Mock session failure".to_string()));
        }
        let inner = self.inner.session().await?;
        Ok(Box::new(MockSession {
            inner,
            switches: self.switches.clone(),
            published: self.published.clone(),
        }))
    }

    async fn subscriber_count(&self, pattern: &RoutingKey) -> Result<Option<u32>> {
        if self.switches.read().await.fail_on_membership {
            return Err(BusError::Membership("Mock membership failure".to_string()));
        }
        self.inner.subscriber_count(pattern).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

struct MockSession {
    inner: Box<dyn BrokerSession>,
    switches: Arc<RwLock<Switches>>,
    published: Arc<RwLock<Vec<Delivery>>>,
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn publish(&mut self, key: &RoutingKey, payload: &[u8]) -> Result<()> {
        let (fail, delay) = {
            let switches = self.switches.read().await;
            let kind_fails = matches!(key.kind, KindFilter::Exact(kind) if switches.fail_kinds.contains(&kind));
            (switches.fail_on_publish || kind_fails, switches.publish_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        self.published.write().await.push(Delivery {
            topic: key.encode(),
            payload: payload.to_vec(),
        });
        self.inner.publish(key, payload).await
    }

    async fn subscribe(&mut self, pattern: &RoutingKey, subscriber: &str) -> Result<Subscription> {
        if self.switches.read().await.fail_on_subscribe {
            return Err(BusError::Subscribe("Mock subscribe failure".to_string()));
        }
        self.inner.subscribe(pattern, subscriber).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

//! NATS broker implementation.
//!
//! Routing keys map one-to-one onto NATS subjects: both use `.` as the
//! hierarchy separator and `*` as the single-token wildcard. Publishes are
//! fire-and-forget; there are no publisher confirms on core NATS.
//!
//! Room membership is answered by the server's monitoring endpoint
//! (`/connz?subs=1`), which lists every subscription per client connection.

use std::time::Duration;

use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::{subscription_channel, Broker, BrokerSession, BusError, Delivery, Result, Subscription};
use crate::config::NatsConfig;
use crate::routing::RoutingKey;
use crate::utils::bootstrap::{connect_with_retry, RetryPolicy};

/// Bound on one monitoring query.
const MONITOR_TIMEOUT: Duration = Duration::from_secs(2);

/// NATS broker.
pub struct NatsBroker {
    client: Client,
    http: reqwest::Client,
    monitor_url: String,
}

impl NatsBroker {
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        let address = config.server_address();
        let client = connect_with_retry("nats", &address, RetryPolicy::default(), || {
            options(config).connect(address.as_str())
        })
        .await
        .map_err(|e| BusError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(MONITOR_TIMEOUT)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to build HTTP client: {}", e)))?;

        info!(address = %address, monitor = %config.monitor_url, "Connected to NATS");
        Ok(Self {
            client,
            http,
            monitor_url: config.monitor_url.trim_end_matches('/').to_string(),
        })
    }
}

fn options(config: &NatsConfig) -> ConnectOptions {
    let options = if config.user.is_empty() {
        ConnectOptions::new()
    } else {
        ConnectOptions::with_user_and_password(config.user.clone(), config.password.clone())
    };
    options.event_callback(|event| async move {
        match event {
            Event::Connected => info!("NATS connected"),
            Event::Disconnected => warn!("NATS disconnected"),
            Event::Closed => info!("NATS connection closed"),
            other => debug!(event = %other, "NATS event"),
        }
    })
}

/// `GET /connz?subs=1` response, reduced to what membership needs.
#[derive(Debug, Default, Deserialize)]
pub struct Connz {
    #[serde(default)]
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub subscriptions_list: Vec<String>,
}

impl Connz {
    /// Subscriptions on exactly `subject`, across every connection.
    pub fn count_subscriptions(&self, subject: &str) -> u32 {
        self.connections
            .iter()
            .flat_map(|c| c.subscriptions_list.iter())
            .filter(|s| s.as_str() == subject)
            .count() as u32
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn session(&self) -> Result<Box<dyn BrokerSession>> {
        Ok(Box::new(NatsSession {
            client: self.client.clone(),
            closed: false,
        }))
    }

    async fn subscriber_count(&self, pattern: &RoutingKey) -> Result<Option<u32>> {
        let url = format!("{}/connz?subs=1", self.monitor_url);
        let connz: Connz = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BusError::Membership(e.to_string()))?
            .json()
            .await
            .map_err(|e| BusError::Membership(e.to_string()))?;

        let subject = pattern.encode();
        let count = connz.count_subscriptions(&subject);
        debug!(subject = %subject, count, "Queried NATS membership");
        Ok(Some(count))
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to flush NATS: {}", e)))?;
        info!("NATS broker closed");
        Ok(())
    }
}

/// NATS shares one multiplexed connection; a session only tracks its own
/// lifecycle.
pub struct NatsSession {
    client: Client,
    closed: bool,
}

#[async_trait]
impl BrokerSession for NatsSession {
    async fn publish(&mut self, key: &RoutingKey, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(BusError::Publish("session is closed".to_string()));
        }
        self.client
            .publish(key.encode(), Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))
    }

    async fn subscribe(&mut self, pattern: &RoutingKey, subscriber: &str) -> Result<Subscription> {
        if self.closed {
            return Err(BusError::Subscribe("session is closed".to_string()));
        }
        let subject = pattern.encode();
        let mut messages = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to subscribe: {}", e)))?;
        debug!(subject = %subject, subscriber = %subscriber, "Subscribed");

        let (mut feed, subscription) = subscription_channel(subject.clone());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = feed.cancelled() => break,
                    next = messages.next() => match next {
                        Some(message) => {
                            let forwarded = Delivery {
                                topic: message.subject.to_string(),
                                payload: message.payload.to_vec(),
                            };
                            if !feed.send(forwarded).await {
                                break;
                            }
                        }
                        None => {
                            info!(subject = %subject, "Subscription stream ended");
                            break;
                        }
                    },
                }
            }
            if let Err(e) = messages.unsubscribe().await {
                error!(error = %e, subject = %subject, "Failed to unsubscribe");
            }
        });

        Ok(subscription)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

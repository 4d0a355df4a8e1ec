//! AMQP (RabbitMQ) broker implementation.
//!
//! Events are published to a topic exchange on their routing key. Each call
//! session owns one AMQP channel in confirm mode; each subscription is an
//! exclusive auto-delete queue bound to the room pattern.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, error, info, warn};

use super::{
    subscription_channel, Broker, BrokerSession, BusError, Confirmation, ConfirmTracker, Delivery,
    Result, Subscription,
};
use crate::config::AmqpConfig;
use crate::routing::RoutingKey;
use crate::utils::bootstrap::{connect_with_retry, RetryPolicy};

/// Application id stamped on every publish.
const APP_ID: &str = "hypercards";

const CONTENT_TYPE: &str = "application/protobuf";

/// Transient delivery mode.
const DELIVERY_MODE_TRANSIENT: u8 = 1;

const POOL_SIZE: usize = 16;

/// AMQP broker using RabbitMQ.
pub struct AmqpBroker {
    pool: Pool,
    config: AmqpConfig,
}

impl AmqpBroker {
    /// Connect, with retry, and declare the topic exchange.
    pub async fn connect(config: &AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.uri(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        let address = config.redacted_uri();
        let channel = connect_with_retry("rabbitmq", &address, RetryPolicy::default(), || {
            open_channel(&pool)
        })
        .await?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;
        let _ = channel.close(200, "exchange declared").await;

        info!(
            exchange = %config.exchange,
            uri = %address,
            "Connected to AMQP"
        );

        Ok(Self {
            pool,
            config: config.clone(),
        })
    }
}

async fn open_channel(pool: &Pool) -> Result<Channel> {
    let conn = pool.get().await.map_err(|e: PoolError| {
        BusError::Connection(format!("Failed to get connection from pool: {}", e))
    })?;

    conn.create_channel()
        .await
        .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn session(&self) -> Result<Box<dyn BrokerSession>> {
        let channel = open_channel(&self.pool).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable confirms: {}", e)))?;

        debug!(channel_id = channel.id(), "Opened AMQP session");
        Ok(Box::new(AmqpSession {
            channel,
            exchange: self.config.exchange.clone(),
            expiration_ms: self.config.message_ttl_secs * 1000,
            confirms: ConfirmTracker::new(Duration::from_secs(self.config.ack_timeout_secs)),
            closed: false,
        }))
    }

    async fn subscriber_count(&self, _pattern: &RoutingKey) -> Result<Option<u32>> {
        // The management API is not part of the AMQP protocol
        Ok(None)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        info!(exchange = %self.config.exchange, "AMQP broker closed");
        Ok(())
    }
}

/// One AMQP channel in confirm mode, owned by a single call.
pub struct AmqpSession {
    channel: Channel,
    exchange: String,
    expiration_ms: u64,
    confirms: ConfirmTracker,
    closed: bool,
}

impl AmqpSession {
    fn properties(&self) -> BasicProperties {
        BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(DELIVERY_MODE_TRANSIENT)
            .with_expiration(self.expiration_ms.to_string().into())
            .with_app_id(APP_ID.into())
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn publish(&mut self, key: &RoutingKey, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(BusError::Publish("session is closed".to_string()));
        }
        self.confirms.check()?;

        let routing_key = key.encode();
        let pending = self
            .channel
            .basic_publish(
                &self.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                payload,
                self.properties(),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        // lapin pairs confirms with publishes per channel and does not expose
        // the broker's tag; the ack settles the tag the tracker assigned.
        let delivery_tag = self.confirms.next_tag();
        self.confirms
            .settle(async move {
                let outcome = pending
                    .await
                    .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;
                let ack = match outcome {
                    publisher_confirm::Confirmation::Ack(_) => true,
                    publisher_confirm::Confirmation::Nack(_) => false,
                    publisher_confirm::Confirmation::NotRequested => {
                        return Err(BusError::Publish(
                            "channel is not in confirm mode".to_string(),
                        ))
                    }
                };
                Ok(Confirmation { delivery_tag, ack })
            })
            .await?;

        debug!(
            exchange = %self.exchange,
            rk = %routing_key,
            delivery_tag,
            "Publish confirmed"
        );
        Ok(())
    }

    async fn subscribe(&mut self, pattern: &RoutingKey, subscriber: &str) -> Result<Subscription> {
        if self.closed {
            return Err(BusError::Subscribe("session is closed".to_string()));
        }
        let binding = pattern.encode();
        let queue = format!("sub.{}.{}.{}", binding, subscriber, uuid::Uuid::new_v4().simple());

        let mut args = FieldTable::default();
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(self.expiration_ms as i64),
        );
        self.channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        self.channel
            .queue_bind(
                &queue,
                &self.exchange,
                &binding,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        let mut consumer = self
            .channel
            .basic_consume(
                &queue,
                &queue,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, pattern = %binding, "Bound queue to exchange");

        let (mut feed, subscription) = subscription_channel(binding);
        let channel = self.channel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = feed.cancelled() => break,
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => {
                            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                warn!(error = %e, queue = %queue, "Failed to ack message");
                            }
                            let forwarded = Delivery {
                                topic: delivery.routing_key.as_str().to_string(),
                                payload: delivery.data,
                            };
                            if !feed.send(forwarded).await {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, queue = %queue, "Consumer delivery error");
                            break;
                        }
                        None => {
                            info!(queue = %queue, "Consumer stream ended");
                            break;
                        }
                    },
                }
            }
            if let Err(e) = channel
                .basic_cancel(&queue, BasicCancelOptions::default())
                .await
            {
                debug!(error = %e, queue = %queue, "Consumer cancel failed");
            }
        });

        Ok(subscription)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.channel.close(200, "session closed").await {
            debug!(error = %e, channel_id = self.channel.id(), "Channel close failed");
        }
    }
}

impl Drop for AmqpSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            handle.spawn(async move {
                let _ = channel.close(200, "session dropped").await;
            });
        }
    }
}

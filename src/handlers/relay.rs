//! Event relay: turns a room subscription into a live client stream.
//!
//! ```text
//! Preparing -> Subscribed -> Streaming -> Closing -> Closed
//!     \             \             \           \
//!      +-------------+-------------+-----------+--> Failed
//! ```
//!
//! The caller's `UserJoinedRoom` is published before any delivery is relayed
//! and its `UserLeftRoom` after the loop exits, on every exit path.

use std::sync::Arc;

use prost::Message;
use tokio::sync::{mpsc, watch};
use tonic::Status;
use tracing::{debug, info, warn};

use crate::auth::RequestScope;
use crate::bus::{publish_event, Broker, BrokerSession, BusError, Delivery, Subscription};
use crate::error::WhiteboardError;
use crate::event::{Event, Payload};
use crate::proto;
use crate::routing::{check_segment, RoutingKey};

/// Outbound half of a `RecvEvents` stream.
pub type EventSender = mpsc::Sender<Result<proto::Event, Status>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Preparing,
    Subscribed,
    Streaming,
    Closing,
    Closed,
    Failed,
}

/// How a relay ended.
#[derive(Debug)]
pub struct RelayReport {
    pub state: RelayState,
    /// Status sent to the client on failure, if any.
    pub error: Option<Status>,
    /// Deliveries forwarded to the client.
    pub relayed: usize,
    /// Deliveries from the caller itself.
    pub excluded: usize,
    /// Deliveries dropped because their payload did not decode.
    pub skipped: usize,
}

/// What to do with one delivery.
enum Step {
    Forward(proto::Event),
    Exclude,
    Skip,
    Fail(WhiteboardError),
}

/// Why the streaming loop ended.
enum Exit {
    Cancelled(&'static str),
    PeerGone,
    Error(WhiteboardError),
}

/// One `RecvEvents` call.
pub struct Relay {
    broker: Arc<dyn Broker>,
    session: Box<dyn BrokerSession>,
    subscription: Subscription,
    user_id: String,
    room_id: String,
    pattern: RoutingKey,
    state: RelayState,
}

impl Relay {
    /// Prepare, subscribe to the room and announce the caller.
    ///
    /// Nothing is left behind on failure: an opened subscription is cancelled
    /// and the session closed before the error is returned.
    pub async fn open(
        broker: Arc<dyn Broker>,
        scope: &RequestScope,
        room_id: &str,
    ) -> Result<Self, WhiteboardError> {
        let user_id = scope.require_user()?.to_string();
        check_segment(room_id).map_err(|_| {
            WhiteboardError::bad_request("room id is empty or contains reserved characters")
        })?;

        let pattern = RoutingKey::room_pattern(room_id);
        let mut session = broker.session().await?;
        let subscription = match session.subscribe(&pattern, &user_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                session.close().await;
                return Err(e.into());
            }
        };

        let joined = Event::now(&user_id, room_id, Payload::UserJoinedRoom);
        if let Err(e) = publish_event(session.as_mut(), &joined).await {
            subscription.cancel();
            session.close().await;
            return Err(e.into());
        }
        info!(user = %user_id, room = %room_id, "Joined room");

        Ok(Self {
            broker,
            session,
            subscription,
            user_id,
            room_id: room_id.to_string(),
            pattern,
            state: RelayState::Subscribed,
        })
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Stream room events to `tx` until the client leaves, `shutdown` flips,
    /// or an unrecoverable error occurs.
    pub async fn run(mut self, tx: EventSender, mut shutdown: watch::Receiver<bool>) -> RelayReport {
        self.state = RelayState::Streaming;
        let mut report = RelayReport {
            state: self.state,
            error: None,
            relayed: 0,
            excluded: 0,
            skipped: 0,
        };

        let exit = match self.announce_membership(&tx).await {
            Err(exit) => exit,
            Ok(()) => loop {
                tokio::select! {
                    _ = tx.closed() => break Exit::Cancelled("client disconnected"),
                    _ = shutdown_requested(&mut shutdown) => break Exit::Cancelled("server shutting down"),
                    next = self.subscription.recv() => {
                        let Some(delivery) = next else {
                            break Exit::Error(BusError::Subscribe("subscription ended".to_string()).into());
                        };
                        match self.step(delivery) {
                            Step::Forward(event) => {
                                if tx.send(Ok(event)).await.is_err() {
                                    break Exit::PeerGone;
                                }
                                report.relayed += 1;
                            }
                            Step::Exclude => report.excluded += 1,
                            Step::Skip => report.skipped += 1,
                            Step::Fail(e) => break Exit::Error(e),
                        }
                    }
                }
            },
        };

        self.state = RelayState::Closing;
        self.leave().await;

        match exit {
            Exit::Cancelled(reason) => {
                info!(user = %self.user_id, room = %self.room_id, reason, "Left room");
                self.state = RelayState::Closed;
            }
            Exit::PeerGone => {
                info!(user = %self.user_id, room = %self.room_id, "Client gone, left room");
                self.state = RelayState::Failed;
            }
            Exit::Error(e) => {
                warn!(user = %self.user_id, room = %self.room_id, error = %e, "Relay failed");
                let status = Status::from(e);
                let _ = tx.send(Err(status.clone())).await;
                report.error = Some(status);
                self.state = RelayState::Failed;
            }
        }
        report.state = self.state;
        report
    }

    /// Send the advisory room occupancy before any delivery.
    async fn announce_membership(&mut self, tx: &EventSender) -> Result<(), Exit> {
        let count = match self.broker.subscriber_count(&self.pattern).await {
            Ok(Some(count)) => count,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(room = %self.room_id, error = %e, "Membership query failed, skipping count");
                return Ok(());
            }
        };
        let event = Event::now(&self.user_id, &self.room_id, Payload::UsersInRoom(count));
        if tx.send(Ok(proto::Event::from(&event))).await.is_err() {
            return Err(Exit::PeerGone);
        }
        debug!(room = %self.room_id, count, "Sent room occupancy");
        Ok(())
    }

    fn step(&self, delivery: Delivery) -> Step {
        let key = match RoutingKey::decode(&delivery.topic) {
            Ok(key) => key,
            Err(e) => return Step::Fail(e.into()),
        };
        if key.user_id == self.user_id {
            return Step::Exclude;
        }

        let decoded = proto::Event::decode(delivery.payload.as_slice())
            .map_err(WhiteboardError::from)
            .and_then(|wire| Event::try_from(wire).map_err(WhiteboardError::from));
        match decoded {
            Ok(event) => Step::Forward(proto::Event::from(&event)),
            Err(e) => {
                warn!(rk = %delivery.topic, error = %e, "Skipping undecodable delivery");
                Step::Skip
            }
        }
    }

    /// Drop the subscription, publish a best-effort `UserLeftRoom`, then
    /// close the session.
    ///
    /// The subscription goes first: nothing drains it any more, and the
    /// caller never receives its own leave.
    async fn leave(&mut self) {
        self.subscription.cancel();
        let left = Event::now(&self.user_id, &self.room_id, Payload::UserLeftRoom);
        if let Err(e) = publish_event(self.session.as_mut(), &left).await {
            warn!(user = %self.user_id, room = %self.room_id, error = %e, "Failed to publish leave");
        }
        self.session.close().await;
    }
}

/// Resolves once `shutdown` holds `true`. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

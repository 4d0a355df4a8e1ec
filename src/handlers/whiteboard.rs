//! Whiteboard gRPC service.
//!
//! `SendEvent` validates and publishes one event to each listed room;
//! `RecvEvents` hands the call to a [`Relay`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, Instrument};

use super::relay::Relay;
use crate::auth::{prepare, PrepareOptions, RequestScope};
use crate::bus::{publish_event, Broker};
use crate::config::{ServerConfig, StatusEventPolicy};
use crate::error::WhiteboardError;
use crate::event::{now_nanos, Event, Payload};
use crate::proto;
use crate::proto::whiteboard_server::Whiteboard;
use crate::validation::validate_outbound;

/// Buffered events per `RecvEvents` stream.
const STREAM_BUFFER: usize = 32;

pub struct WhiteboardService {
    broker: Arc<dyn Broker>,
    call_deadline: Duration,
    status_policy: StatusEventPolicy,
    shutdown: watch::Receiver<bool>,
}

impl WhiteboardService {
    /// `shutdown` flipping to `true` ends every live `RecvEvents` stream.
    pub fn new(
        broker: Arc<dyn Broker>,
        config: &ServerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker,
            call_deadline: config.call_deadline(),
            status_policy: config.status_events,
            shutdown,
        }
    }

    /// Publish `payload` from `user_id` to every room on one session.
    ///
    /// Stops at the first failed publish. All copies share one timestamp.
    async fn publish_to_rooms(
        &self,
        user_id: &str,
        room_ids: &[String],
        payload: Payload,
    ) -> Result<(), WhiteboardError> {
        let mut session = self.broker.session().await?;
        let created_at = now_nanos();

        let mut result = Ok(());
        for room_id in room_ids {
            let event = Event {
                created_at,
                by_user_id: user_id.to_string(),
                in_room_id: room_id.clone(),
                payload: payload.clone(),
            };
            if let Err(e) = publish_event(session.as_mut(), &event).await {
                result = Err(e.into());
                break;
            }
        }
        session.close().await;
        result
    }

    fn scope<T>(&self, request: &Request<T>, options: PrepareOptions) -> Result<RequestScope, Status> {
        prepare(request.metadata(), options, self.call_deadline).map_err(Status::from)
    }
}

#[tonic::async_trait]
impl Whiteboard for WhiteboardService {
    #[tracing::instrument(name = "send_event", skip_all, fields(user = tracing::field::Empty))]
    async fn send_event(
        &self,
        request: Request<proto::SendEventReq>,
    ) -> Result<Response<proto::SendEventRep>, Status> {
        let scope = self.scope(&request, PrepareOptions::default())?;
        let user_id = scope.require_user()?.to_string();
        tracing::Span::current().record("user", user_id.as_str());

        let req = request.into_inner();
        let payload = validate_outbound(&req, &user_id, self.status_policy)?;

        scope
            .bounded(self.publish_to_rooms(&user_id, &req.room_ids, payload))
            .await?;
        debug!(rooms = req.room_ids.len(), "Event published");
        Ok(Response::new(proto::SendEventRep {}))
    }

    type RecvEventsStream =
        Pin<Box<dyn Stream<Item = Result<proto::Event, Status>> + Send + 'static>>;

    #[tracing::instrument(name = "recv_events", skip_all, fields(user = tracing::field::Empty, room = tracing::field::Empty))]
    async fn recv_events(
        &self,
        request: Request<proto::RecvEventsReq>,
    ) -> Result<Response<Self::RecvEventsStream>, Status> {
        let scope = self.scope(&request, PrepareOptions::streaming())?;
        let room_id = request.into_inner().room_id;
        let span = tracing::Span::current();
        span.record("room", room_id.as_str());
        if let Some(user) = scope.user_id() {
            span.record("user", user);
        }

        let relay = Relay::open(self.broker.clone(), &scope, &room_id).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let shutdown = self.shutdown.clone();
        tokio::spawn(
            async move {
                let report = relay.run(tx, shutdown).await;
                info!(
                    state = ?report.state,
                    relayed = report.relayed,
                    excluded = report.excluded,
                    skipped = report.skipped,
                    "Event stream ended"
                );
            }
            .instrument(span),
        );

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn list_rooms(
        &self,
        request: Request<proto::ListRoomsReq>,
    ) -> Result<Response<proto::ListRoomsRep>, Status> {
        self.scope(&request, PrepareOptions::default())?;
        Ok(Response::new(proto::ListRoomsRep { room_ids: vec![] }))
    }

    async fn list_room_members(
        &self,
        request: Request<proto::ListRoomMembersReq>,
    ) -> Result<Response<proto::ListRoomMembersRep>, Status> {
        self.scope(&request, PrepareOptions::default())?;
        Ok(Response::new(proto::ListRoomMembersRep { user_ids: vec![] }))
    }
}

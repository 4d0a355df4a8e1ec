//! ScreenSharing gRPC service: latest canvas image per room.

use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::auth::{prepare, PrepareOptions};
use crate::cache::{screen_key, ScreenCache};
use crate::config::{CacheConfig, ServerConfig};
use crate::error::WhiteboardError;
use crate::proto;
use crate::proto::screen_sharing_server::ScreenSharing;
use crate::routing::check_segment;

pub struct ScreenSharingService {
    cache: Arc<dyn ScreenCache>,
    ttl: Duration,
    call_deadline: Duration,
}

impl ScreenSharingService {
    pub fn new(cache: Arc<dyn ScreenCache>, server: &ServerConfig, config: &CacheConfig) -> Self {
        Self {
            cache,
            ttl: config.ttl(),
            call_deadline: server.call_deadline(),
        }
    }
}

fn check_room(room_id: &str) -> Result<(), WhiteboardError> {
    check_segment(room_id).map_err(|_| {
        WhiteboardError::bad_request("room id is empty or contains reserved characters")
    })
}

#[tonic::async_trait]
impl ScreenSharing for ScreenSharingService {
    #[tracing::instrument(name = "send_screen", skip_all, fields(user = tracing::field::Empty, room = tracing::field::Empty))]
    async fn send_screen(
        &self,
        request: Request<proto::SendScreenReq>,
    ) -> Result<Response<proto::SendScreenRep>, Status> {
        let scope = prepare(request.metadata(), PrepareOptions::default(), self.call_deadline)?;
        let user_id = scope.require_user()?;
        let req = request.into_inner();

        let span = tracing::Span::current();
        span.record("user", user_id);
        span.record("room", req.room_id.as_str());

        check_room(&req.room_id)?;
        if req.screen_png.is_empty() {
            return Err(WhiteboardError::bad_request("screen image is empty").into());
        }

        let key = screen_key(&req.room_id);
        let bytes = req.screen_png.len();
        scope
            .bounded(async {
                self.cache
                    .set(&key, req.screen_png, self.ttl)
                    .await
                    .map_err(WhiteboardError::from)
            })
            .await?;
        debug!(bytes, "Screen stored");
        Ok(Response::new(proto::SendScreenRep {}))
    }

    #[tracing::instrument(name = "recv_screen", skip_all, fields(room = tracing::field::Empty))]
    async fn recv_screen(
        &self,
        request: Request<proto::RecvScreenReq>,
    ) -> Result<Response<proto::RecvScreenRep>, Status> {
        let room_id = request.into_inner().room_id;
        tracing::Span::current().record("room", room_id.as_str());
        check_room(&room_id)?;

        let canvas_png = self
            .cache
            .get(&screen_key(&room_id))
            .await
            .map_err(WhiteboardError::from)?
            .unwrap_or_default();
        Ok(Response::new(proto::RecvScreenRep { canvas_png }))
    }
}

//! Per-call identity and deadline preparation.
//!
//! Every RPC starts by deriving a [`RequestScope`] from its metadata. The
//! scope is an explicit, immutable value threaded to whatever needs the caller
//! identity or the call deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tracing::debug;

use crate::error::WhiteboardError;
use crate::routing;

/// gRPC metadata key carrying the caller identity.
pub const USER_ID_HEADER: &str = "x-user";

/// Default bound on unary calls.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_millis(500);

/// How a call wants its scope prepared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareOptions {
    /// Skip the identity requirement entirely.
    pub allow_anonymous: bool,
    /// No per-call deadline (long-lived streams).
    pub suppress_deadline: bool,
}

impl PrepareOptions {
    pub fn streaming() -> Self {
        Self {
            suppress_deadline: true,
            ..Default::default()
        }
    }

    pub fn anonymous() -> Self {
        Self {
            allow_anonymous: true,
            ..Default::default()
        }
    }
}

/// Identity and deadline of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScope {
    user_id: Option<String>,
    deadline: Option<Instant>,
}

impl RequestScope {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            deadline: None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Caller identity, or `Forbidden` for anonymous scopes.
    pub fn require_user(&self) -> Result<&str, WhiteboardError> {
        self.user_id()
            .ok_or_else(|| WhiteboardError::Forbidden("call requires an identity".to_string()))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run `fut` within the call deadline, if any.
    ///
    /// The timer lives inside the returned future: it is released on every
    /// exit path, including cancellation by the transport.
    pub async fn bounded<T, F>(&self, fut: F) -> Result<T, WhiteboardError>
    where
        F: Future<Output = Result<T, WhiteboardError>>,
    {
        match self.deadline {
            None => fut.await,
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| WhiteboardError::DeadlineExceeded)?,
        }
    }
}

/// Derive the request scope of a call.
///
/// Fails with `Forbidden` when the identity header is absent, repeated,
/// empty, padded with whitespace, or contains topic-reserved characters or
/// whitespace anywhere.
pub fn prepare(
    metadata: &MetadataMap,
    options: PrepareOptions,
    call_deadline: Duration,
) -> Result<RequestScope, WhiteboardError> {
    if options.allow_anonymous {
        return Ok(RequestScope::anonymous());
    }

    let user_id = identity(metadata)?;
    let deadline = (!options.suppress_deadline).then(|| Instant::now() + call_deadline);
    debug!(user = %user_id, ?deadline, "prepared request scope");

    Ok(RequestScope {
        user_id: Some(user_id),
        deadline,
    })
}

fn identity(metadata: &MetadataMap) -> Result<String, WhiteboardError> {
    let forbidden = |reason: &str| WhiteboardError::Forbidden(reason.to_string());

    let mut values = metadata.get_all(USER_ID_HEADER).iter();
    let value = values.next().ok_or_else(|| forbidden("missing identity"))?;
    if values.next().is_some() {
        return Err(forbidden("identity given more than once"));
    }

    let user_id = value
        .to_str()
        .map_err(|_| forbidden("identity is not printable ASCII"))?;
    if user_id.is_empty() {
        return Err(forbidden("empty identity"));
    }
    if user_id != user_id.trim() {
        return Err(forbidden("identity has surrounding whitespace"));
    }
    if !routing::is_topic_safe(user_id) {
        return Err(forbidden("identity contains reserved characters"));
    }
    Ok(user_id.to_string())
}

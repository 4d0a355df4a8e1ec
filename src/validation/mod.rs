//! Validation of client-originated events.
//!
//! Everything a client sends through `SendEvent` crosses a trust boundary:
//! identifiers end up as broker topic segments and payloads are relayed
//! verbatim to other room members.

use std::collections::HashSet;

use crate::config::StatusEventPolicy;
use crate::error::WhiteboardError;
use crate::event::{payload_count, payload_of, Payload};
use crate::proto;
use crate::routing::check_segment;

/// Error constants for validation failures.
pub mod errmsg {
    pub const EVENT_MISSING: &str = "event is required";
    pub const CREATED_AT_SET: &str = "created_at is assigned by the server";
    pub const BY_USER_ID_SET: &str = "by_user_id is assigned by the server";
    pub const IN_ROOM_ID_SET: &str = "in_room_id is assigned by the server";
    pub const USERS_IN_ROOM_SET: &str = "users_in_the_room is assigned by the server";

    pub const NO_PAYLOAD: &str = "event carries no payload";
    pub const MANY_PAYLOADS: &str = "event carries more than one payload";
    pub const STATUS_EVENT: &str = "join/leave events are emitted by the server";

    pub const NO_ROOMS: &str = "at least one room is required";
    pub const DUPLICATE_ROOM: &str = "room listed more than once";
    pub const INVALID_ROOM: &str = "room id is empty or contains reserved characters";
    pub const INVALID_CALLER: &str = "caller id contains reserved characters";

    pub const INVISIBLE_COLOR: &str = "drawing color must be visible";
    pub const DRAWING_SHAPE: &str =
        "drawing xs, ys, pressures and widths must have the same non-zero length";
}

/// Validate a `SendEvent` request from `caller`.
///
/// Rules are checked in order and the first failure wins:
/// 1. server-assigned fields are unset
/// 2. exactly one payload, and status events only when `policy` allows
/// 3. target rooms are present and unique
/// 4. rooms and caller are usable as topic segments
/// 5. drawings have a visible color and same-length, non-empty arrays
///
/// Returns the single payload to publish.
pub fn validate_outbound(
    req: &proto::SendEventReq,
    caller: &str,
    policy: StatusEventPolicy,
) -> Result<Payload, WhiteboardError> {
    let event = req
        .event
        .as_ref()
        .ok_or_else(|| WhiteboardError::bad_request(errmsg::EVENT_MISSING))?;

    // 1
    if event.created_at != 0 {
        return Err(WhiteboardError::bad_request(errmsg::CREATED_AT_SET));
    }
    if !event.by_user_id.is_empty() {
        return Err(WhiteboardError::bad_request(errmsg::BY_USER_ID_SET));
    }
    if !event.in_room_id.is_empty() {
        return Err(WhiteboardError::bad_request(errmsg::IN_ROOM_ID_SET));
    }
    if event.event_users_in_the_room.is_some() {
        return Err(WhiteboardError::bad_request(errmsg::USERS_IN_ROOM_SET));
    }

    // 2
    match payload_count(event) {
        0 => return Err(WhiteboardError::bad_request(errmsg::NO_PAYLOAD)),
        1 => {}
        _ => return Err(WhiteboardError::bad_request(errmsg::MANY_PAYLOADS)),
    }
    let is_status = event.event_user_joined_the_room || event.event_user_left_the_room;
    if is_status && policy == StatusEventPolicy::Reject {
        return Err(WhiteboardError::bad_request(errmsg::STATUS_EVENT));
    }

    // 3
    if req.room_ids.is_empty() {
        return Err(WhiteboardError::bad_request(errmsg::NO_ROOMS));
    }
    let mut seen = HashSet::with_capacity(req.room_ids.len());
    for room_id in &req.room_ids {
        if !seen.insert(room_id.as_str()) {
            return Err(WhiteboardError::bad_request(format!(
                "{}: {:?}",
                errmsg::DUPLICATE_ROOM,
                room_id
            )));
        }
    }

    // 4
    for room_id in &req.room_ids {
        check_segment(room_id).map_err(|_| {
            WhiteboardError::bad_request(format!("{}: {:?}", errmsg::INVALID_ROOM, room_id))
        })?;
    }
    check_segment(caller).map_err(|_| WhiteboardError::bad_request(errmsg::INVALID_CALLER))?;

    // 5
    if let Some(drawing) = &event.event_drawing {
        validate_drawing(drawing)?;
    }

    payload_of(event.clone()).map_err(|e| WhiteboardError::bad_request(e.to_string()))
}

fn validate_drawing(drawing: &proto::Drawing) -> Result<(), WhiteboardError> {
    match proto::drawing::Color::try_from(drawing.color) {
        Ok(proto::drawing::Color::Invisible) | Err(_) => {
            return Err(WhiteboardError::bad_request(errmsg::INVISIBLE_COLOR));
        }
        Ok(_) => {}
    }

    let n = drawing.xs.len();
    let same = [
        drawing.ys.len(),
        drawing.pressures.len(),
        drawing.widths.len(),
    ]
    .iter()
    .all(|&len| len == n);
    if n == 0 || !same {
        return Err(WhiteboardError::bad_request(errmsg::DRAWING_SHAPE));
    }
    Ok(())
}

#[cfg(test)]
mod tests;

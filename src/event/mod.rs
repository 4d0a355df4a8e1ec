//! Room events.
//!
//! The wire `Event` carries each payload kind as a separate field; the domain
//! [`Event`] carries exactly one [`Payload`]. Conversion from the wire is the
//! single place where "exactly one kind" is enforced.

use crate::proto;
use crate::routing::{EventKind, RoutingKey};

/// Drawing stroke color. The wire's `invisible` sentinel has no domain value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Black,
    White,
}

/// One stroke: per-sample arrays, all the same non-zero length.
#[derive(Debug, Clone, PartialEq)]
pub struct Drawing {
    pub xs: Vec<f32>,
    pub ys: Vec<f32>,
    pub pressures: Vec<f32>,
    pub widths: Vec<f32>,
    pub color: Color,
}

impl Drawing {
    /// Number of samples, if every array has the same non-zero length.
    pub fn samples(&self) -> Option<usize> {
        let n = self.xs.len();
        let same = [self.ys.len(), self.pressures.len(), self.widths.len()]
            .iter()
            .all(|&len| len == n);
        (n > 0 && same).then_some(n)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Drawing(Drawing),
    UserJoinedRoom,
    UserLeftRoom,
    /// Advisory room occupancy. Synthesized by the relay, never published.
    UsersInRoom(u32),
}

impl Payload {
    /// Routing kind, for payloads that travel through the broker.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Payload::Drawing(_) => Some(EventKind::Drawing),
            Payload::UserJoinedRoom => Some(EventKind::UserJoinedRoom),
            Payload::UserLeftRoom => Some(EventKind::UserLeftRoom),
            Payload::UsersInRoom(_) => None,
        }
    }
}

/// An immutable fact about a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Unix nanoseconds.
    pub created_at: i64,
    pub by_user_id: String,
    pub in_room_id: String,
    pub payload: Payload,
}

impl Event {
    /// Stamp a payload with the current time.
    pub fn now(by_user_id: impl Into<String>, in_room_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            created_at: now_nanos(),
            by_user_id: by_user_id.into(),
            in_room_id: in_room_id.into(),
            payload,
        }
    }

    /// Broker routing key. `None` for payloads that are never published.
    pub fn routing_key(&self) -> Option<RoutingKey> {
        self.payload
            .kind()
            .map(|kind| RoutingKey::event(&self.in_room_id, &self.by_user_id, kind))
    }
}

pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Why a wire event has no domain meaning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("event carries no payload")]
    Missing,
    #[error("event carries {0} payloads")]
    Ambiguous(usize),
    #[error("drawing color is invisible or unknown")]
    InvisibleColor,
}

impl TryFrom<proto::drawing::Color> for Color {
    type Error = PayloadError;

    fn try_from(color: proto::drawing::Color) -> Result<Self, Self::Error> {
        match color {
            proto::drawing::Color::Black => Ok(Color::Black),
            proto::drawing::Color::White => Ok(Color::White),
            proto::drawing::Color::Invisible => Err(PayloadError::InvisibleColor),
        }
    }
}

impl From<Color> for proto::drawing::Color {
    fn from(color: Color) -> Self {
        match color {
            Color::Black => proto::drawing::Color::Black,
            Color::White => proto::drawing::Color::White,
        }
    }
}

impl TryFrom<proto::Drawing> for Drawing {
    type Error = PayloadError;

    fn try_from(d: proto::Drawing) -> Result<Self, Self::Error> {
        let color = proto::drawing::Color::try_from(d.color)
            .map_err(|_| PayloadError::InvisibleColor)?
            .try_into()?;
        Ok(Self {
            xs: d.xs,
            ys: d.ys,
            pressures: d.pressures,
            widths: d.widths,
            color,
        })
    }
}

impl From<&Drawing> for proto::Drawing {
    fn from(d: &Drawing) -> Self {
        let mut wire = proto::Drawing {
            xs: d.xs.clone(),
            ys: d.ys.clone(),
            pressures: d.pressures.clone(),
            widths: d.widths.clone(),
            ..Default::default()
        };
        wire.set_color(d.color.into());
        wire
    }
}

/// Count of payload kinds set on a wire event.
pub fn payload_count(e: &proto::Event) -> usize {
    [
        e.event_drawing.is_some(),
        e.event_user_joined_the_room,
        e.event_user_left_the_room,
        e.event_users_in_the_room.is_some(),
    ]
    .into_iter()
    .filter(|&set| set)
    .count()
}

/// Extract the single payload of a wire event.
pub fn payload_of(e: proto::Event) -> Result<Payload, PayloadError> {
    match payload_count(&e) {
        0 => return Err(PayloadError::Missing),
        1 => {}
        n => return Err(PayloadError::Ambiguous(n)),
    }
    if let Some(d) = e.event_drawing {
        return Ok(Payload::Drawing(d.try_into()?));
    }
    if e.event_user_joined_the_room {
        return Ok(Payload::UserJoinedRoom);
    }
    if e.event_user_left_the_room {
        return Ok(Payload::UserLeftRoom);
    }
    match e.event_users_in_the_room {
        Some(count) => Ok(Payload::UsersInRoom(count)),
        None => Err(PayloadError::Missing),
    }
}

impl TryFrom<proto::Event> for Event {
    type Error = PayloadError;

    fn try_from(mut e: proto::Event) -> Result<Self, Self::Error> {
        let created_at = e.created_at;
        let by_user_id = std::mem::take(&mut e.by_user_id);
        let in_room_id = std::mem::take(&mut e.in_room_id);
        Ok(Self {
            created_at,
            by_user_id,
            in_room_id,
            payload: payload_of(e)?,
        })
    }
}

impl From<&Event> for proto::Event {
    fn from(e: &Event) -> Self {
        let mut wire = proto::Event {
            created_at: e.created_at,
            by_user_id: e.by_user_id.clone(),
            in_room_id: e.in_room_id.clone(),
            ..Default::default()
        };
        match &e.payload {
            Payload::Drawing(d) => wire.event_drawing = Some(d.into()),
            Payload::UserJoinedRoom => wire.event_user_joined_the_room = true,
            Payload::UserLeftRoom => wire.event_user_left_the_room = true,
            Payload::UsersInRoom(count) => wire.event_users_in_the_room = Some(*count),
        }
        wire
    }
}

//! Routing keys for room events.
//!
//! Events are addressed on the broker by a structured, versioned topic:
//!
//! ```text
//! hc.wb.1.evt.{room_id}.{user_id}.{kind}
//! ```
//!
//! Encoding the room, the user and the event kind into the topic lets the
//! broker filter server-side (per room, per user, per kind) with single-segment
//! `*` wildcards, so the relay never inspects payloads to route.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

/// Bump when breaking routing key backward compatibility.
pub const PROTOCOL_PREFIX: &str = "hc.wb.1";

/// Segment separator. Also the broker's hierarchy separator.
pub const SEPARATOR: char = '.';

/// Single-segment wildcard understood by both AMQP topic exchanges and NATS.
pub const WILDCARD: &str = "*";

/// Characters with meaning to at least one broker's topic syntax.
pub const RESERVED_CHARS: &[char] = &['.', '/', '*', '>', '#'];

const EVENT_TAG: &str = "evt";

/// Number of fields after the protocol prefix for an event key.
const EVENT_FIELD_COUNT: usize = 4;

/// Result type for routing key operations.
pub type Result<T> = std::result::Result<T, RoutingError>;

/// Errors produced by the routing key codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("bad routing key {topic:?}: {reason}")]
    BadRoutingKey { topic: String, reason: &'static str },

    #[error("empty routing key segment {fields:?}[{index}]")]
    EmptySegment { fields: Vec<String>, index: usize },

    #[error("routing key {fields:?} does not round-trip: got {got:?}")]
    RoundTrip { fields: Vec<String>, got: String },

    #[error("segment {0:?} is not topic-safe")]
    UnsafeSegment(String),
}

/// Kind of a published room event.
///
/// Must stay exhaustive over the publishable payloads: adding a payload that
/// travels through the broker means adding a kind here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Drawing,
    UserJoinedRoom,
    UserLeftRoom,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::Drawing,
        EventKind::UserJoinedRoom,
        EventKind::UserLeftRoom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Drawing => "drawing",
            EventKind::UserJoinedRoom => "userjoinedroom",
            EventKind::UserLeftRoom => "userleftroom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind segment of a routing key: a concrete kind, or `*` in patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindFilter {
    Exact(EventKind),
    Any,
}

impl KindFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            KindFilter::Exact(kind) => kind.as_str(),
            KindFilter::Any => WILDCARD,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        if s == WILDCARD {
            return Some(KindFilter::Any);
        }
        EventKind::parse(s).map(KindFilter::Exact)
    }
}

/// Structured routing key of a room event, or a subscription pattern.
///
/// `user_id` may be [`WILDCARD`] in patterns; identities can never contain
/// `*` so the two cannot be confused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub room_id: String,
    pub user_id: String,
    pub kind: KindFilter,
}

impl RoutingKey {
    /// Key of a concrete event.
    pub fn event(room_id: impl Into<String>, user_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            kind: KindFilter::Exact(kind),
        }
    }

    /// Pattern matching every event of every user in a room.
    pub fn room_pattern(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: WILDCARD.to_string(),
            kind: KindFilter::Any,
        }
    }

    pub fn is_pattern(&self) -> bool {
        self.user_id == WILDCARD || self.kind == KindFilter::Any
    }

    /// Ordered fields following the protocol prefix.
    pub fn fields(&self) -> [&str; EVENT_FIELD_COUNT] {
        [EVENT_TAG, &self.room_id, &self.user_id, self.kind.as_str()]
    }

    pub fn encode(&self) -> String {
        encode(&self.fields())
    }

    pub fn decode(topic: &str) -> Result<Self> {
        let bad = |reason| RoutingError::BadRoutingKey {
            topic: topic.to_string(),
            reason,
        };

        let rest = topic
            .strip_prefix(PROTOCOL_PREFIX)
            .ok_or_else(|| bad("protocol prefix mismatch"))?;
        let rest = rest
            .strip_prefix(SEPARATOR)
            .ok_or_else(|| bad("missing separator after prefix"))?;

        let parts: Vec<&str> = rest.split(SEPARATOR).collect();
        match parts.as_slice() {
            [tag, room_id, user_id, kind] if *tag == EVENT_TAG => {
                let kind = KindFilter::parse(kind).ok_or_else(|| bad("unknown event kind"))?;
                Ok(Self {
                    room_id: room_id.to_string(),
                    user_id: user_id.to_string(),
                    kind,
                })
            }
            [tag, ..] if *tag == EVENT_TAG => Err(bad("field count mismatch")),
            _ => Err(bad("unknown key shape")),
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for RoutingKey {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

/// Join fields under the protocol prefix.
///
/// Empty or `"0"` fields are a caller bug: brokers cannot round-trip empty
/// segments. They are logged, not rejected; [`verify`] is the strict check.
pub fn encode(fields: &[&str]) -> String {
    let mut topic = String::from(PROTOCOL_PREFIX);
    for field in fields {
        topic.push(SEPARATOR);
        topic.push_str(field);
        if is_empty_segment(field) {
            warn!(field = %field, fields = ?fields, "empty field in routing key");
        }
    }
    topic
}

fn is_empty_segment(field: &str) -> bool {
    field.is_empty() || field == "0"
}

/// Strict self-check of one key: no empty segment, and
/// `encode(decode(encode(k)))` reproduces the same topic.
///
/// Returns the number of fields on success.
pub fn verify(key: &RoutingKey) -> Result<usize> {
    let fields = key.fields();
    let owned = || fields.iter().map(|f| f.to_string()).collect::<Vec<_>>();

    if let Some(index) = fields.iter().position(|f| is_empty_segment(f)) {
        return Err(RoutingError::EmptySegment {
            fields: owned(),
            index,
        });
    }

    let encoded = encode(&fields);
    let decoded = RoutingKey::decode(&encoded)?;
    if decoded.fields() != fields {
        return Err(RoutingError::RoundTrip {
            fields: owned(),
            got: decoded.fields().join("."),
        });
    }
    let reencoded = decoded.encode();
    if reencoded != encoded {
        return Err(RoutingError::RoundTrip {
            fields: owned(),
            got: reencoded,
        });
    }
    Ok(fields.len())
}

/// Statically declared keys checked at process start.
pub fn sample_keys() -> Vec<RoutingKey> {
    let mut samples = vec![RoutingKey::room_pattern("room")];
    samples.extend(
        EventKind::ALL
            .into_iter()
            .map(|kind| RoutingKey::event("room", "user", kind)),
    );
    samples
}

/// Startup self-test. Any failure is an implementation bug and must abort
/// the process.
pub fn verify_samples() -> Result<()> {
    for key in sample_keys() {
        let n = verify(&key)?;
        if n != EVENT_FIELD_COUNT {
            return Err(RoutingError::RoundTrip {
                fields: key.fields().iter().map(|f| f.to_string()).collect(),
                got: format!("{n} fields"),
            });
        }
    }
    Ok(())
}

/// Whether `s` can be used verbatim as one topic segment: no reserved
/// broker characters and no whitespace.
pub fn is_topic_safe(s: &str) -> bool {
    !s.chars()
        .any(|c| RESERVED_CHARS.contains(&c) || c.is_whitespace())
}

/// Like [`is_topic_safe`], also rejecting the empty string.
pub fn check_segment(s: &str) -> Result<()> {
    if s.is_empty() || !is_topic_safe(s) {
        return Err(RoutingError::UnsafeSegment(s.to_string()));
    }
    Ok(())
}

/// Whether a concrete topic matches a pattern using single-segment `*`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split(SEPARATOR);
    let mut topic_parts = topic.split(SEPARATOR);
    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (None, None) => return true,
            (Some(p), Some(t)) if p == WILDCARD || p == t => continue,
            _ => return false,
        }
    }
}

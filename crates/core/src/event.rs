//! Event model: the immutable value types that describe stored facts.
//!
//! ## Lifecycle
//!
//! 1. **EventDescriptor**: authored by an aggregate (or a caller) with a type tag,
//!    an opaque JSON payload and optional metadata. It has no position yet.
//! 2. **EventRecord**: what the store hands back after a successful append. It
//!    carries a unique id, its stream, a zero-based offset and the append timestamp.
//!    Records are never mutated; they disappear only through truncation or deletion.
//! 3. **EventStreamDescriptor**: a summary of a stream's current extent.
//!
//! Offsets within a stream are contiguous (`0, 1, 2, ...`) and never reused, even
//! after the oldest records were truncated away.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};

/// Event type tag used for link events.
pub const LINK_EVENT_TYPE: &str = "$>";

/// A typed domain event that can be raised by an aggregate.
///
/// `EVENT_TYPE` is the tag written to the store and used for fold dispatch and
/// migration lookup, so it must stay stable once events of that type exist.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
}

/// An event ready to be appended to a stream (no offset assigned yet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub event_type: String,
    pub data: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
}

impl EventDescriptor {
    pub fn new(event_type: impl Into<String>, data: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            data: Some(data),
            metadata: None,
        }
    }

    /// A descriptor with a type tag and no payload (e.g. `user-logged-in`).
    pub fn of_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: None,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Serialize a typed domain event into a descriptor.
    pub fn from_event<E: DomainEvent>(event: &E) -> DomainResult<Self> {
        let data = serde_json::to_value(event).map_err(|e| DomainError::encode(E::EVENT_TYPE, e))?;
        Ok(Self::new(E::EVENT_TYPE, data))
    }

    /// Build a link event pointing at `record`.
    pub fn link_to(record: &EventRecord) -> Self {
        let target = LinkTarget {
            stream_id: record.stream_id.clone(),
            offset: record.offset,
        };
        Self::new(LINK_EVENT_TYPE, JsonValue::String(target.to_string()))
    }
}

/// A durable, ordered fact stored in a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub stream_id: String,
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub data: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
}

impl EventRecord {
    pub fn is_link(&self) -> bool {
        self.event_type == LINK_EVENT_TYPE
    }

    /// Decode the link target if this record is a link event.
    pub fn link_target(&self) -> Option<LinkTarget> {
        if !self.is_link() {
            return None;
        }
        self.data.as_ref()?.as_str()?.parse().ok()
    }

    /// Deserialize the payload into a typed value.
    ///
    /// A missing payload is decoded from `null`, which lets unit-like events carry
    /// no data at all.
    pub fn decode<T: DeserializeOwned>(&self) -> DomainResult<T> {
        let data = self.data.clone().unwrap_or(JsonValue::Null);
        serde_json::from_value(data).map_err(|e| DomainError::decode(&self.event_type, e))
    }

    /// Turn the record back into an appendable descriptor (drops id/offset/timestamp).
    pub fn to_descriptor(&self) -> EventDescriptor {
        EventDescriptor {
            event_type: self.event_type.clone(),
            data: self.data.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Summary of a stream's current extent.
///
/// `length` counts the records still retained. After a truncation `first_offset`
/// can be greater than zero, and both offsets are `None` once every record was
/// truncated away (the stream itself still exists).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStreamDescriptor {
    pub stream_id: String,
    pub length: u64,
    pub first_offset: Option<u64>,
    pub last_offset: Option<u64>,
    pub first_event_timestamp: Option<DateTime<Utc>>,
    pub last_event_timestamp: Option<DateTime<Utc>>,
}

/// Where a read or subscription starts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamPosition {
    /// A concrete zero-based offset.
    Offset(u64),
    /// Past the last record: only events appended from now on.
    EndOfStream,
}

impl StreamPosition {
    pub const START_OF_STREAM: StreamPosition = StreamPosition::Offset(0);

    /// Raw value of the start sentinel.
    pub const RAW_START_OF_STREAM: i64 = 0;
    /// Raw value of the end sentinel.
    pub const RAW_END_OF_STREAM: i64 = -1;

    pub fn offset(self) -> Option<u64> {
        match self {
            StreamPosition::Offset(o) => Some(o),
            StreamPosition::EndOfStream => None,
        }
    }

    /// Raw `i64` form. Offsets beyond `i64::MAX` saturate instead of wrapping into
    /// the negative sentinel range.
    pub fn as_raw(self) -> i64 {
        match self {
            StreamPosition::Offset(o) => i64::try_from(o).unwrap_or(i64::MAX),
            StreamPosition::EndOfStream => Self::RAW_END_OF_STREAM,
        }
    }
}

impl Default for StreamPosition {
    fn default() -> Self {
        Self::START_OF_STREAM
    }
}

impl TryFrom<i64> for StreamPosition {
    type Error = DomainError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        match raw {
            Self::RAW_END_OF_STREAM => Ok(StreamPosition::EndOfStream),
            o if o >= 0 => Ok(StreamPosition::Offset(o as u64)),
            other => Err(DomainError::validation(format!("invalid stream position {other}"))),
        }
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamPosition::Offset(o) => write!(f, "{o}"),
            StreamPosition::EndOfStream => f.write_str("end-of-stream"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamReadDirection {
    Forwards,
    Backwards,
}

/// Target of a link event, encoded as `"{offset}@{stream_id}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkTarget {
    pub stream_id: String,
    pub offset: u64,
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.offset, self.stream_id)
    }
}

impl FromStr for LinkTarget {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (offset, stream_id) = s
            .split_once('@')
            .ok_or_else(|| DomainError::validation(format!("malformed link '{s}'")))?;
        let offset = offset
            .parse()
            .map_err(|_| DomainError::validation(format!("malformed link offset in '{s}'")))?;
        if stream_id.is_empty() {
            return Err(DomainError::validation(format!("link '{s}' has no stream")));
        }
        Ok(Self {
            stream_id: stream_id.to_string(),
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(stream_id: &str, offset: u64) -> EventRecord {
        EventRecord {
            id: format!("{stream_id}-{offset}"),
            stream_id: stream_id.to_string(),
            offset,
            timestamp: Utc::now(),
            event_type: "user-created".to_string(),
            data: Some(json!({ "firstName": "John" })),
            metadata: None,
        }
    }

    #[test]
    fn stream_position_sentinels() {
        assert_eq!(StreamPosition::try_from(0).unwrap(), StreamPosition::START_OF_STREAM);
        assert_eq!(StreamPosition::try_from(-1).unwrap(), StreamPosition::EndOfStream);
        assert_eq!(StreamPosition::try_from(7).unwrap(), StreamPosition::Offset(7));
        assert!(StreamPosition::try_from(-2).is_err());
        assert_eq!(StreamPosition::EndOfStream.as_raw(), -1);
        assert_eq!(StreamPosition::Offset(42).as_raw(), 42);
        assert_eq!(StreamPosition::Offset(u64::MAX).as_raw(), i64::MAX);
        assert_eq!(StreamPosition::Offset(i64::MAX as u64 + 1).as_raw(), i64::MAX);
    }

    #[test]
    fn link_points_back_to_source_record() {
        let source = record("user-1", 3);
        let link = EventDescriptor::link_to(&source);
        assert_eq!(link.event_type, LINK_EVENT_TYPE);

        let stored = EventRecord {
            event_type: link.event_type.clone(),
            data: link.data.clone(),
            ..record("all-users", 0)
        };
        assert!(stored.is_link());
        assert_eq!(
            stored.link_target(),
            Some(LinkTarget {
                stream_id: "user-1".to_string(),
                offset: 3
            })
        );
    }

    #[test]
    fn malformed_links_are_rejected() {
        assert!("nope".parse::<LinkTarget>().is_err());
        assert!("x@stream".parse::<LinkTarget>().is_err());
        assert!("3@".parse::<LinkTarget>().is_err());
        assert!(record("s", 0).link_target().is_none());
    }

    #[test]
    fn decode_missing_payload_as_null() {
        let mut r = record("s", 0);
        r.data = None;
        assert!(r.decode::<()>().is_ok());
        assert!(r.decode::<String>().is_err());
    }
}

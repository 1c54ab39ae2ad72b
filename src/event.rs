//! Shared event model for the ingest and aggregation sides.
//!
//! An [`Event`] is one decoded unit of the upstream wiki edit feed. Its `id`
//! is the opaque resumption token handed out by the feed: structurally a
//! JSON array of [`PartitionDescriptor`], one per upstream partition mirror.
//! Exactly one descriptor in a well-formed id carries the event timestamp.

use serde::Deserialize;

/// One decoded stream event. Immutable once produced; ownership moves from
/// the stream reader into the shared channel and on to exactly one sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Upstream resumption token (JSON array of partition descriptors).
    pub id: String,
    /// SSE event type, `"message"` unless the wire says otherwise.
    pub event_type: String,
    /// Raw JSON payload describing one wiki edit.
    pub data: String,
}

/// Positional metadata for one upstream partition, embedded in an event id.
#[derive(Debug, Clone, Deserialize)]
pub struct PartitionDescriptor {
    pub topic: String,
    pub partition: i32,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug)]
pub enum EventError {
    /// The id is not a JSON array of partition descriptors.
    InvalidId(serde_json::Error),
    /// No descriptor in the id carries a timestamp.
    MissingTimestamp,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventError::InvalidId(e) => write!(f, "malformed event id: {}", e),
            EventError::MissingTimestamp => {
                write!(f, "no partition descriptor carries a timestamp")
            }
        }
    }
}

impl std::error::Error for EventError {}

/// Decode an event id and extract the millisecond timestamp from the single
/// descriptor that carries one.
///
/// An id whose descriptors all lack a timestamp is an error, never a silent
/// zero.
pub fn parse_timestamp(id: &str) -> Result<i64, EventError> {
    let descriptors: Vec<PartitionDescriptor> =
        serde_json::from_str(id).map_err(EventError::InvalidId)?;
    descriptors
        .iter()
        .find_map(|d| d.timestamp)
        .ok_or(EventError::MissingTimestamp)
}

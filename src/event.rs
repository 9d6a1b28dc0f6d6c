//! Types describing a Recorded Event as delivered by the event store to a
//! subscription, and the directives a handler uses to address a stream.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Globally ordered, monotonically increasing identifier assigned to an
/// event by the store. Strictly monotonic per subscription; gaps are
/// possible, reordering is not.
pub type EventNumber = u64;

/// Per-stream, strictly increasing version assigned to an event within its
/// own stream.
pub type StreamVersion = u64;

/// Free-form metadata attached to an event by whoever appended it.
pub type Metadata = HashMap<String, Json>;

/// An immutable record emitted by the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent<T> {
    /// Store-assigned identity for this specific event, stable across
    /// upcasting and redelivery.
    pub event_id: String,

    /// Position of this event in the subscription's ordering.
    pub event_number: EventNumber,

    /// Identifier of the stream this event belongs to.
    pub stream_id: String,

    /// Version of `stream_id` at the time this event was recorded.
    pub stream_version: StreamVersion,

    /// Domain name of the event, e.g. `"BankAccountOpened"`.
    pub event_type: String,

    /// The domain event payload.
    pub payload: T,

    /// Metadata recorded alongside the event by its producer.
    pub metadata: Metadata,

    /// When the store recorded this event.
    pub created_at: DateTime<Utc>,
}

impl<T> RecordedEvent<T> {
    /// Transforms the payload in place, keeping every other attribute
    /// (identity, ordering, metadata, timestamp) untouched.
    ///
    /// Used by the [upcaster][crate::upcast] to migrate a raw payload to its
    /// current domain shape without disturbing the event's envelope.
    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> RecordedEvent<U> {
        RecordedEvent {
            event_id: self.event_id,
            event_number: self.event_number,
            stream_id: self.stream_id,
            stream_version: self.stream_version,
            event_type: self.event_type,
            payload: f(self.payload),
            metadata: self.metadata,
            created_at: self.created_at,
        }
    }
}

/// Which slice of a stream (or all streams) a subscription should observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFilter {
    /// Observe every stream in the application.
    All,
    /// Observe a single, named stream.
    Stream(String),
}

impl Default for StreamFilter {
    fn default() -> Self {
        StreamFilter::All
    }
}

/// Where a subscription should begin reading from, consulted only the
/// first time a durable subscription is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Start from the very beginning of the filtered stream(s).
    Origin,
    /// Start from whatever is currently the end of the filtered stream(s).
    Current,
    /// Start immediately after the given event number.
    Offset(EventNumber),
}

impl Default for StartFrom {
    fn default() -> Self {
        StartFrom::Origin
    }
}

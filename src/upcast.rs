//! Pure schema-migration transform applied to recorded events before they
//! reach handler logic (§4.3 of the specification).

use std::convert::Infallible;

use crate::event::{Metadata, RecordedEvent};

/// Migrates a single raw recorded payload to its current domain shape.
///
/// Implementations must be pure with respect to the runtime: no I/O, no
/// shared mutable state. A failure for one event does not imply anything
/// about neighboring events in the same batch — each is upcast
/// independently, preserving order and arity of the batch.
pub trait Upcaster<Raw, Domain>: Send + Sync {
    /// Error raised when a payload cannot be migrated.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Migrates one recorded event's payload, leaving its envelope
    /// (identity, ordering, metadata, timestamp) untouched.
    fn upcast(&self, event: RecordedEvent<Raw>) -> Result<RecordedEvent<Domain>, Self::Error>;
}

/// An [`Upcaster`] for event types that are already in their current shape
/// and need no migration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl<T> Upcaster<T, T> for Identity
where
    T: Send + Sync,
{
    type Error = Infallible;

    fn upcast(&self, event: RecordedEvent<T>) -> Result<RecordedEvent<T>, Self::Error> {
        Ok(event)
    }
}

/// Merges `additional` into an event's metadata, then runs it through
/// `upcaster`. Returns a lazy, ordered iterator: each item is produced (and
/// can fail) independently of the others, so a failure on one event never
/// prevents the next from being yielded.
///
/// Enrichment happens before migration so `upcaster` implementations can
/// inspect the additional metadata (e.g. an `application` tag) if they need
/// context-sensitive migration rules.
pub fn upcast_batch<'a, U, Raw, Domain>(
    upcaster: &'a U,
    batch: Vec<RecordedEvent<Raw>>,
    additional: Metadata,
) -> impl Iterator<Item = Result<RecordedEvent<Domain>, U::Error>> + 'a
where
    U: Upcaster<Raw, Domain>,
    Raw: 'a,
{
    batch.into_iter().map(move |mut raw| {
        raw.metadata.extend(additional.clone());
        upcaster.upcast(raw)
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn sample(event_number: u64, payload: &'static str) -> RecordedEvent<&'static str> {
        RecordedEvent {
            event_id: format!("evt-{event_number}"),
            event_number,
            stream_id: "acc-1".into(),
            stream_version: event_number,
            event_type: "Sample".into(),
            payload,
            metadata: Metadata::default(),
            created_at: Utc::now(),
        }
    }

    struct UppercaseUpcaster;

    impl Upcaster<&'static str, String> for UppercaseUpcaster {
        type Error = Infallible;

        fn upcast(&self, event: RecordedEvent<&'static str>) -> Result<RecordedEvent<String>, Self::Error> {
            Ok(event.map_payload(str::to_uppercase))
        }
    }

    #[test]
    fn preserves_order_and_arity() {
        let batch = vec![sample(1, "a"), sample(2, "b"), sample(3, "c")];
        let out: Vec<_> = upcast_batch(&UppercaseUpcaster, batch, Metadata::default())
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].payload, "A");
        assert_eq!(out[1].event_number, 2);
        assert_eq!(out[2].payload, "C");
    }

    #[test]
    fn merges_additional_metadata_before_upcasting() {
        let mut additional = Metadata::default();
        additional.insert("application".to_string(), serde_json::json!("bank"));

        let batch = vec![sample(1, "a")];
        let out: Vec<_> = upcast_batch(&UppercaseUpcaster, batch, additional)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(out[0].metadata.get("application").unwrap(), "bank");
    }
}

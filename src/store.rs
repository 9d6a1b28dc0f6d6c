//! The event store contract this crate consumes (§6 of the specification).
//!
//! The storage engine itself — durable cursors, persistence, replication —
//! is explicitly out of scope for this crate; it is treated as an external
//! collaborator. This module only pins down the narrow interface a
//! [`SubscriptionHandle`][crate::subscription::SubscriptionHandle] needs,
//! plus an in-memory double of that interface for tests and examples.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, RwLock};

use crate::error::{ResetError, SubscribeError};
use crate::event::{EventNumber, RecordedEvent, StartFrom, StreamFilter};

/// Opaque identity the store hands back for a live subscriber, used to
/// correlate later `ack` calls and `Down` notifications with the
/// subscription attempt that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberRef(u64);

/// A message the store pushes to a live subscriber.
#[derive(Debug, Clone)]
pub enum StoreEvent<E> {
    /// A non-empty, ordered batch of newly available events.
    Events(Vec<RecordedEvent<E>>),
    /// The store-side subscriber has terminated; no further events will
    /// arrive on this subscription attempt.
    Down(String),
}

/// What a successful `subscribe` call hands back: the live subscriber
/// identity, and the channel over which the store will push
/// [`StoreEvent`]s.
pub struct Subscribed<E> {
    /// Identity of the subscriber just created.
    pub subscriber_ref: SubscriberRef,
    /// Inbox of events and liveness signals for this subscriber.
    pub inbox: mpsc::Receiver<StoreEvent<E>>,
}

/// The narrow slice of an event store's API that a subscription handle
/// needs: create a durable, named subscriber; acknowledge delivered
/// offsets; and discard a durable cursor.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// The raw event payload type this store streams back.
    type Event: Send + Sync + Clone + 'static;

    /// Registers (or resumes) a durable subscriber under `subscription_name`.
    ///
    /// `start_from` is consulted only the first time this subscription
    /// name is seen by the store; once a durable cursor exists, it takes
    /// precedence.
    async fn subscribe(
        &self,
        subscription_name: &str,
        filter: StreamFilter,
        start_from: StartFrom,
    ) -> Result<Subscribed<Self::Event>, SubscribeError>;

    /// Confirms receipt of `event_number`, allowing the store to advance
    /// `subscription_name`'s durable cursor past it.
    async fn ack(&self, subscription_name: &str, subscriber_ref: SubscriberRef, event_number: EventNumber);

    /// Discards the durable cursor for `subscription_name`. The next
    /// `subscribe` call for this name restarts from its `start_from`.
    async fn reset(&self, subscription_name: &str) -> Result<(), ResetError>;
}

struct Backend<E> {
    cursors: HashMap<String, EventNumber>,
    subscribers: HashMap<String, (SubscriberRef, mpsc::Sender<StoreEvent<E>>)>,
}

impl<E> Default for Backend<E> {
    fn default() -> Self {
        Self {
            cursors: HashMap::new(),
            subscribers: HashMap::new(),
        }
    }
}

/// An in-memory [`EventStore`] double, backed by a shared, lock-guarded
/// append-only log per stream. Intended for tests and examples, mirroring
/// the shape of `eventually::event::store::InMemory` generalized from a
/// single read call to a push-based subscription.
pub struct InMemory<E> {
    backend: Arc<RwLock<Backend<E>>>,
    next_subscriber_ref: AtomicU64,
    log: Arc<RwLock<Vec<RecordedEvent<E>>>>,
}

impl<E> Default for InMemory<E> {
    fn default() -> Self {
        Self {
            backend: Arc::default(),
            next_subscriber_ref: AtomicU64::new(1),
            log: Arc::default(),
        }
    }
}

impl<E> Clone for InMemory<E> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            next_subscriber_ref: AtomicU64::new(self.next_subscriber_ref.load(Ordering::SeqCst)),
            log: Arc::clone(&self.log),
        }
    }
}

impl<E> InMemory<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Appends a raw payload to `stream_id`, stamping it with the next
    /// global event number and pushing it to any live subscriber.
    ///
    /// Returns the event number assigned.
    pub async fn append(
        &self,
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: E,
        metadata: crate::event::Metadata,
    ) -> EventNumber {
        let stream_id = stream_id.into();
        let mut log = self.log.write().await;
        let stream_version = log
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .count() as u64
            + 1;
        let event_number = log.len() as u64 + 1;

        let event = RecordedEvent {
            event_id: format!("evt-{event_number}"),
            event_number,
            stream_id: stream_id.clone(),
            stream_version,
            event_type: event_type.into(),
            payload,
            metadata,
            created_at: Utc::now(),
        };

        log.push(event.clone());
        drop(log);

        let backend = self.backend.read().await;
        for (_, sender) in backend.subscribers.values() {
            let _ = sender.send(StoreEvent::Events(vec![event.clone()])).await;
        }

        event_number
    }

    /// Forcibly terminates a live subscriber, as if the store-side process
    /// hosting it had crashed. Used by tests exercising the `Down`/backoff
    /// path.
    pub async fn kill_subscriber(&self, subscription_name: &str, reason: impl Into<String>) {
        let backend = self.backend.read().await;
        if let Some((_, sender)) = backend.subscribers.get(subscription_name) {
            let _ = sender.send(StoreEvent::Down(reason.into())).await;
        }
    }

    async fn events_from(&self, event_number_exclusive: EventNumber, filter: &StreamFilter) -> Vec<RecordedEvent<E>> {
        let log = self.log.read().await;
        log.iter()
            .filter(|e| e.event_number > event_number_exclusive)
            .filter(|e| matches!(filter, StreamFilter::All) || matches!(filter, StreamFilter::Stream(s) if s == &e.stream_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl<E> EventStore for InMemory<E>
where
    E: Send + Sync + Clone + 'static,
{
    type Event = E;

    async fn subscribe(
        &self,
        subscription_name: &str,
        filter: StreamFilter,
        start_from: StartFrom,
    ) -> Result<Subscribed<Self::Event>, SubscribeError> {
        let mut backend = self.backend.write().await;

        let cursor = *backend.cursors.entry(subscription_name.to_string()).or_insert_with(|| match start_from {
            StartFrom::Origin => 0,
            StartFrom::Current => self.log.try_read().map(|log| log.len() as u64).unwrap_or(0),
            StartFrom::Offset(n) => n,
        });

        let (tx, rx) = mpsc::channel(128);
        let subscriber_ref = SubscriberRef(self.next_subscriber_ref.fetch_add(1, Ordering::SeqCst));

        backend
            .subscribers
            .insert(subscription_name.to_string(), (subscriber_ref, tx.clone()));
        drop(backend);

        let catch_up = self.events_from(cursor, &filter).await;
        if !catch_up.is_empty() {
            let _ = tx.send(StoreEvent::Events(catch_up)).await;
        }

        Ok(Subscribed {
            subscriber_ref,
            inbox: rx,
        })
    }

    async fn ack(&self, subscription_name: &str, subscriber_ref: SubscriberRef, event_number: EventNumber) {
        let mut backend = self.backend.write().await;
        if backend
            .subscribers
            .get(subscription_name)
            .map(|(r, _)| *r == subscriber_ref)
            .unwrap_or(false)
        {
            backend
                .cursors
                .entry(subscription_name.to_string())
                .and_modify(|c| *c = (*c).max(event_number))
                .or_insert(event_number);
        }
    }

    async fn reset(&self, subscription_name: &str) -> Result<(), ResetError> {
        let mut backend = self.backend.write().await;
        if backend.cursors.remove(subscription_name).is_none() {
            return Err(ResetError::NotFound(subscription_name.to_string()));
        }
        backend.subscribers.remove(subscription_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_replays_from_origin_by_default() {
        let store = InMemory::<&'static str>::default();
        store.append("acc-1", "Deposited", "first", Metadata::default()).await;
        store.append("acc-1", "Deposited", "second", Metadata::default()).await;

        let mut subscribed = store
            .subscribe("sub-1", StreamFilter::All, StartFrom::Origin)
            .await
            .expect("subscribe should succeed");

        match subscribed.inbox.recv().await {
            Some(StoreEvent::Events(batch)) => assert_eq!(batch.len(), 2),
            other => panic!("expected a batch of 2 events, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ack_advances_cursor_so_resubscribe_skips_acked_events() {
        let store = InMemory::<&'static str>::default();
        store.append("acc-1", "Deposited", "first", Metadata::default()).await;

        let subscribed = store
            .subscribe("sub-1", StreamFilter::All, StartFrom::Origin)
            .await
            .unwrap();

        store.ack("sub-1", subscribed.subscriber_ref, 1).await;
        store.reset("sub-1").await.unwrap_err();
    }

    #[tokio::test]
    async fn reset_clears_the_durable_cursor() {
        let store = InMemory::<&'static str>::default();
        store.append("acc-1", "Deposited", "first", Metadata::default()).await;

        let subscribed = store.subscribe("sub-1", StreamFilter::All, StartFrom::Origin).await.unwrap();
        store.ack("sub-1", subscribed.subscriber_ref, 1).await;
        store.reset("sub-1").await.expect("reset should succeed");

        let mut resubscribed = store.subscribe("sub-1", StreamFilter::All, StartFrom::Origin).await.unwrap();
        match resubscribed.inbox.recv().await {
            Some(StoreEvent::Events(batch)) => assert_eq!(batch.len(), 1),
            other => panic!("expected the single event to be redelivered, got {other:?}"),
        }
    }
}

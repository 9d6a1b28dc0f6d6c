//! Stateful wrapper over an event-store durable subscription (C1).
//!
//! Generalizes the shape of `eventually::subscription::{VolatileSubscription,
//! CatchUpSubscription}` — a small struct pairing a store handle with a
//! stream identifier — into the push/ack/reset/backoff lifecycle the
//! handler runtime drives.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{ResetError, SubscribeError};
use crate::event::{EventNumber, StartFrom, StreamFilter};
use crate::store::{EventStore, StoreEvent, SubscriberRef};

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const JITTER_FRACTION: f64 = 0.1;

/// Tracks the reconnect backoff schedule: bounded exponential with jitter,
/// reset to the base delay after a successful subscribe.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Computes the next delay and advances the schedule.
    fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(6); // 2^6 * 1s == 64s, already past the 60s cap
        let unjittered = BASE_BACKOFF
            .checked_mul(1 << exponent)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF);

        self.attempt += 1;

        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let millis = unjittered.as_millis() as f64 * (1.0 + jitter);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// Which end of the subscription's lifecycle it currently occupies.
enum Inner<E> {
    Detached,
    Subscribed {
        subscriber_ref: SubscriberRef,
        inbox: tokio::sync::mpsc::Receiver<StoreEvent<E>>,
    },
}

/// A handler's private handle onto its durable subscription. Owns no
/// durable state itself — the event store owns the cursor — but tracks
/// enough in-memory bookkeeping (the live subscriber identity, the current
/// backoff step) to drive reconnects.
pub struct SubscriptionHandle<S: EventStore> {
    store: Arc<S>,
    name: String,
    start_from: StartFrom,
    filter: StreamFilter,
    inner: Inner<S::Event>,
    backoff: Backoff,
}

impl<S: EventStore> SubscriptionHandle<S> {
    /// Constructs a detached handle. Performs no I/O.
    pub fn new(store: Arc<S>, name: impl Into<String>, start_from: StartFrom, filter: StreamFilter) -> Self {
        Self {
            store,
            name: name.into(),
            start_from,
            filter,
            inner: Inner::Detached,
            backoff: Backoff::new(),
        }
    }

    /// The durable subscription name this handle addresses.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers with the event store as the named durable subscriber.
    /// `start_from` is used by the store only the first time this
    /// subscription name is seen.
    ///
    /// On success, resets the reconnect backoff to its base delay.
    pub async fn subscribe(&mut self) -> Result<(), SubscribeError> {
        let subscribed = self
            .store
            .subscribe(&self.name, self.filter.clone(), self.start_from)
            .await?;

        self.inner = Inner::Subscribed {
            subscriber_ref: subscribed.subscriber_ref,
            inbox: subscribed.inbox,
        };
        self.backoff.reset();

        #[cfg(feature = "tracing")]
        tracing::info!(subscription = %self.name, "subscribed to event store");

        Ok(())
    }

    /// Awaits the next message pushed by the event store: either a batch
    /// of events, or a `Down` notification that this subscriber has died.
    /// Returns `None` if the store closed the channel without an explicit
    /// `Down` (treated identically to a `Down` by callers).
    pub async fn recv(&mut self) -> Option<StoreEvent<S::Event>> {
        match &mut self.inner {
            Inner::Subscribed { inbox, .. } => inbox.recv().await,
            Inner::Detached => None,
        }
    }

    /// Confirms receipt of `event_number` to the store, allowing its
    /// durable cursor to advance. A no-op if this handle is currently
    /// detached (e.g. mid-reconnect) — the event will be redelivered once
    /// resubscribed.
    pub async fn ack(&self, event_number: EventNumber) {
        if let Inner::Subscribed { subscriber_ref, .. } = &self.inner {
            self.store.ack(&self.name, *subscriber_ref, event_number).await;
        }
    }

    /// Instructs the store to delete the durable cursor for this
    /// subscription name, and detaches this handle. The next `subscribe`
    /// call resumes from `start_from`.
    pub async fn reset(&mut self) -> Result<(), ResetError> {
        self.store.reset(&self.name).await?;
        self.inner = Inner::Detached;

        #[cfg(feature = "tracing")]
        tracing::info!(subscription = %self.name, "durable cursor reset");

        Ok(())
    }

    /// Computes the next reconnect delay, following a bounded exponential
    /// schedule (1s, doubling, capped at 60s) with jitter. Each call
    /// advances the schedule; a successful `subscribe` resets it.
    pub fn backoff(&mut self) -> Duration {
        let delay = self.backoff.next_delay();

        #[cfg(feature = "tracing")]
        tracing::warn!(subscription = %self.name, delay_ms = delay.as_millis() as u64, "computed reconnect backoff");

        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay()).collect();

        // Jitter is +/-10%, so assert on bounds rather than exact values.
        let bounds = |base_ms: u64| {
            let base = base_ms as f64;
            (
                Duration::from_millis((base * 0.9) as u64),
                Duration::from_millis((base * 1.1) as u64),
            )
        };

        let (lo, hi) = bounds(1000);
        assert!(delays[0] >= lo && delays[0] <= hi, "{:?}", delays[0]);

        let (lo, hi) = bounds(2000);
        assert!(delays[1] >= lo && delays[1] <= hi, "{:?}", delays[1]);

        let (lo, hi) = bounds(4000);
        assert!(delays[2] >= lo && delays[2] <= hi, "{:?}", delays[2]);

        // After enough attempts, every subsequent delay sits at the 60s cap (+/- jitter).
        let (lo, hi) = bounds(60_000);
        assert!(delays[7] >= lo && delays[7] <= hi, "{:?}", delays[7]);
    }

    #[test]
    fn reset_returns_schedule_to_base_delay() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(900) && delay <= Duration::from_millis(1100));
    }
}

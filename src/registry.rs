//! Consistency Registry (C4): tracks how far behind each running handler is,
//! and lets callers block a command's response until the handlers it cares
//! about have caught up — either the strong set by default, or an explicit
//! list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, Notify};

use crate::error::WaitTimeout;
use crate::event::EventNumber;

/// How strictly a handler's progress should gate read-your-writes
/// consistency for callers that don't name it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Included in the default `wait_for` set.
    Strong,
    /// Never waited on unless named explicitly.
    Eventual,
}

struct Entry {
    consistency: Consistency,
    last_seen_event: EventNumber,
    /// Flipped to `false` by this registration's reaper task once its
    /// [`LivenessToken`] is dropped. The entry stays in the map after
    /// death — only this flag changes — so a `wait_for` call mid-poll
    /// always finds it and can tell "dead" apart from "never registered".
    alive: Arc<AtomicBool>,
}

/// A token a running handler holds for as long as it is alive. Dropping it
/// (including via an unexpected task exit) signals the registry that the
/// handler it represents is gone, so `wait_for` can stop waiting on it.
pub struct LivenessToken {
    _tx: oneshot::Sender<()>,
}

/// Registrations are keyed by `(application, handler_name)`: a handler
/// appears at most once per application, and two applications may each
/// host a handler with the same name without colliding.
type Key = (String, String);

struct Inner {
    entries: Mutex<HashMap<Key, Entry>>,
    notify: Notify,
}

/// Shared, cloneable handle onto the registry. Handlers register themselves
/// on startup and report progress as they ack events; callers (typically a
/// command dispatch path) use [`wait_for`][Self::wait_for] to block until
/// consistency catches up.
#[derive(Clone)]
pub struct ConsistencyRegistry {
    inner: Arc<Inner>,
}

impl Default for ConsistencyRegistry {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }
}

impl ConsistencyRegistry {
    /// Registers `name` under `app` with the given consistency class,
    /// returning the [`LivenessToken`] the caller must hold for as long as
    /// the handler runs. Replaces any prior registration under the same
    /// `(app, name)` pair; the same `name` registered under a different
    /// `app` is a distinct entry.
    ///
    /// Per the data model's ownership rule, the registry holds only a weak
    /// (liveness-watch) reference to the handler agent: dropping the
    /// returned token — including via an unexpected task exit — spawns no
    /// work on the caller's part, but a background reaper flips the entry's
    /// liveness flag once the drop is observed. A dead entry is excluded
    /// from [`list_strong`][Self::list_strong] and makes any `wait_for`
    /// call naming it fail fast, without the entry itself being removed out
    /// from under a `wait_for` call that is mid-check — removal would race
    /// the very call it's meant to unblock.
    pub async fn register(&self, app: impl Into<String>, name: impl Into<String>, consistency: Consistency) -> LivenessToken {
        let app = app.into();
        let name = name.into();
        let key = (app.clone(), name.clone());
        let (tx, rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));

        {
            let mut entries = self.inner.entries.lock().await;
            entries.insert(
                key.clone(),
                Entry {
                    consistency,
                    last_seen_event: 0,
                    alive: Arc::clone(&alive),
                },
            );
        }
        self.inner.notify.notify_waiters();

        #[cfg(feature = "tracing")]
        tracing::info!(application = %app, handler = %name, ?consistency, "handler registered with consistency registry");

        let reaper = self.clone();
        tokio::spawn(async move {
            let _ = rx.await;
            alive.store(false, Ordering::SeqCst);

            #[cfg(feature = "tracing")]
            tracing::info!(application = %key.0, handler = %key.1, "handler marked dead in consistency registry");

            reaper.inner.notify.notify_waiters();
        });

        LivenessToken { _tx: tx }
    }

    /// Deregisters `(app, name)` entirely, e.g. after it resets and should no
    /// longer gate anyone's wait.
    pub async fn deregister(&self, app: &str, name: &str) {
        let mut entries = self.inner.entries.lock().await;
        entries.remove(&(app.to_string(), name.to_string()));
        drop(entries);
        self.inner.notify.notify_waiters();
    }

    /// Records that `(app, name)` has processed up to `event_number`. Wakes
    /// any caller blocked in `wait_for` that this ack might satisfy.
    pub async fn ack(&self, app: &str, name: &str, event_number: EventNumber) {
        let mut entries = self.inner.entries.lock().await;
        if let Some(entry) = entries.get_mut(&(app.to_string(), name.to_string())) {
            entry.last_seen_event = entry.last_seen_event.max(event_number);
        }
        drop(entries);

        #[cfg(feature = "tracing")]
        tracing::trace!(application = %app, handler = %name, event_number, "consistency registry acked offset");

        self.inner.notify.notify_waiters();
    }

    /// The handler names belonging to `app` that are currently registered
    /// with [`Consistency::Strong`] and still alive.
    pub async fn list_strong(&self, app: &str) -> Vec<String> {
        let entries = self.inner.entries.lock().await;
        entries
            .iter()
            .filter(|((entry_app, _), entry)| entry_app == app && entry.consistency == Consistency::Strong && entry.alive.load(Ordering::SeqCst))
            .map(|((_, name), _)| name.clone())
            .collect()
    }

    /// Blocks until every handler in `names` has acked at least `target`, or
    /// `timeout` elapses, whichever comes first.
    ///
    /// A handler that dies (its [`LivenessToken`] is dropped) before
    /// reaching `target` is treated as permanently lagging: `wait_for`
    /// returns [`WaitTimeout`] immediately rather than waiting out the full
    /// timeout for a handler that can never catch up.
    ///
    /// A name with no registration at all is treated the same way — it can
    /// never ack, so it is reported as lagging once the timeout (or an
    /// immediate dead-handler check) determines it cannot catch up.
    pub async fn wait_for(&self, app: &str, names: &[String], target: EventNumber, timeout: Duration) -> Result<(), WaitTimeout> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Capture the notification future and `enable` it before
            // inspecting state. `Notify` only starts counting a waiter once
            // it has been polled (which `enable` does without actually
            // yielding) — registering it after the state check would leave a
            // window where a concurrent `ack`'s `notify_waiters()` lands
            // between our check and the await below and is silently lost.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (lagging, any_dead) = {
                let mut entries = self.inner.entries.lock().await;
                let mut lagging = Vec::new();
                let mut any_dead = false;

                for name in names {
                    match entries.get_mut(&(app.to_string(), name.clone())) {
                        Some(entry) => {
                            if entry.last_seen_event < target {
                                if !entry.alive.load(Ordering::SeqCst) {
                                    any_dead = true;
                                }
                                lagging.push(name.clone());
                            }
                        }
                        None => lagging.push(name.clone()),
                    }
                }

                (lagging, any_dead)
            };

            if lagging.is_empty() {
                return Ok(());
            }

            if any_dead {
                #[cfg(feature = "tracing")]
                tracing::warn!(application = %app, ?lagging, target, "wait_for failing fast: a lagging handler has died");
                return Err(WaitTimeout { lagging, target });
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                #[cfg(feature = "tracing")]
                tracing::warn!(application = %app, ?lagging, target, "wait_for timed out");
                return Err(WaitTimeout { lagging, target });
            }

            if tokio::time::timeout(remaining, notified).await.is_err() {
                let entries = self.inner.entries.lock().await;
                let lagging = names
                    .iter()
                    .filter(|name| {
                        entries
                            .get(&(app.to_string(), (*name).clone()))
                            .map(|e| e.last_seen_event < target)
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect::<Vec<_>>();
                drop(entries);

                #[cfg(feature = "tracing")]
                tracing::warn!(application = %app, ?lagging, target, "wait_for timed out");

                return Err(WaitTimeout { lagging, target });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_returns_once_every_named_handler_catches_up() {
        let registry = ConsistencyRegistry::default();
        let _token_a = registry.register("bank", "a", Consistency::Strong).await;
        let _token_b = registry.register("bank", "b", Consistency::Eventual).await;

        let registry2 = registry.clone();
        let waiter = tokio::spawn(async move {
            registry2
                .wait_for("bank", &["a".to_string(), "b".to_string()], 5, Duration::from_secs(1))
                .await
        });

        registry.ack("bank", "a", 5).await;
        registry.ack("bank", "b", 5).await;

        waiter.await.unwrap().expect("should catch up before the deadline");
    }

    #[tokio::test]
    async fn wait_for_times_out_when_a_handler_never_catches_up() {
        let registry = ConsistencyRegistry::default();
        let _token = registry.register("bank", "a", Consistency::Strong).await;

        let err = registry
            .wait_for("bank", &["a".to_string()], 5, Duration::from_millis(50))
            .await
            .unwrap_err();

        assert_eq!(err.lagging, vec!["a".to_string()]);
        assert_eq!(err.target, 5);
    }

    #[tokio::test]
    async fn wait_for_fails_fast_once_a_lagging_handler_dies() {
        let registry = ConsistencyRegistry::default();
        let token = registry.register("bank", "a", Consistency::Strong).await;

        let registry2 = registry.clone();
        let waiter = tokio::spawn(async move {
            registry2
                .wait_for("bank", &["a".to_string()], 5, Duration::from_secs(30))
                .await
        });

        // Give the waiter a moment to park on the first `notified` await.
        tokio::task::yield_now().await;
        drop(token);
        registry.ack("bank", "a", 0).await; // nudge the notify so the waiter re-checks

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should not hang")
            .unwrap();

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_strong_only_returns_strong_registrations() {
        let registry = ConsistencyRegistry::default();
        let _a = registry.register("bank", "a", Consistency::Strong).await;
        let _b = registry.register("bank", "b", Consistency::Eventual).await;

        let mut strong = registry.list_strong("bank").await;
        strong.sort();
        assert_eq!(strong, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn same_handler_name_in_different_applications_does_not_collide() {
        let registry = ConsistencyRegistry::default();
        let _bank = registry.register("bank", "projector", Consistency::Strong).await;
        let _shop = registry.register("shop", "projector", Consistency::Strong).await;

        registry.ack("bank", "projector", 10).await;

        // "shop"'s same-named handler hasn't acked anything yet, so a
        // bank-scoped wait must not be satisfied by shop's progress (or vice
        // versa), and each application's `list_strong` only reports its own.
        registry
            .wait_for("bank", &["projector".to_string()], 10, Duration::from_millis(50))
            .await
            .expect("bank's own registration satisfies the bank-scoped wait");

        let err = registry
            .wait_for("shop", &["projector".to_string()], 10, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.lagging, vec!["projector".to_string()]);

        assert_eq!(registry.list_strong("bank").await, vec!["projector".to_string()]);
        assert_eq!(registry.list_strong("shop").await, vec!["projector".to_string()]);
    }
}

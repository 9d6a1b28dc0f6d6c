//! Error types shared across the handler runtime.

use thiserror::Error;

use crate::event::EventNumber;

/// Errors returned while attempting to subscribe a [`crate::subscription::SubscriptionHandle`]
/// to the event store.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The event store rejected the subscription request.
    #[error("event store refused subscription '{name}': {reason}")]
    Rejected {
        /// Durable subscription name that failed to subscribe.
        name: String,
        /// Reason reported by the event store.
        reason: String,
    },

    /// The event store is currently unreachable.
    #[error("event store is unreachable: {0}")]
    Unreachable(String),
}

/// Errors returned by [`crate::subscription::SubscriptionHandle::reset`].
#[derive(Debug, Error)]
pub enum ResetError {
    /// The subscription does not exist on the event store, so there is
    /// nothing to reset.
    #[error("no durable subscription named '{0}' to reset")]
    NotFound(String),
}

/// Errors returned by [`crate::handler::options::resolve`] when a handler's
/// declared options are invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `application` was not set.
    #[error("handler options are missing a required `application` binding")]
    MissingApplication,

    /// `name` was not set, or normalized to an empty string.
    #[error("handler options are missing a required, non-empty `name`")]
    MissingName,

    /// The option bag contained keys this resolver does not recognize.
    #[error("unrecognized handler option(s): {0:?}")]
    UnrecognizedOptions(Vec<String>),
}

/// Returned by [`crate::registry::ConsistencyRegistry::wait_for`] when the
/// timeout elapses before every named handler has acked past the target
/// offset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timed out waiting for handler(s) {lagging:?} to reach event {target}")]
pub struct WaitTimeout {
    /// The handlers that were still lagging behind `target` when the
    /// timeout elapsed (includes handlers that never registered at all).
    pub lagging: Vec<String>,
    /// The event number the caller was waiting for.
    pub target: EventNumber,
}

//! Event handler runtime for event-sourced applications: subscribes to an
//! event store's durable, push-based subscriptions, upcasts raw payloads to
//! their current domain shape, and drives a per-handler delivery state
//! machine with retry/skip/stop policy.
//!
//! A companion [`registry::ConsistencyRegistry`] lets command dispatch block
//! until designated handlers have caught up past a given event offset,
//! giving callers a read-your-writes guarantee across process boundaries
//! without coupling event persistence to handler side effects.
//!
//! The storage engine itself is not part of this crate (see [`store`] for
//! the narrow contract it must satisfy); an [`store::InMemory`] double is
//! provided for tests and examples.

pub mod error;
pub mod event;
pub mod handler;
pub mod registry;
pub mod store;
pub mod subscription;
pub mod upcast;

pub use error::{ConfigError, ResetError, SubscribeError, WaitTimeout};
pub use event::{EventNumber, Metadata, RecordedEvent, StartFrom, StreamFilter, StreamVersion};
pub use handler::options::{resolve as resolve_options, HandlerOptions, RawHandlerOptions};
pub use handler::{start, Callbacks, EnrichedMetadata, ErrorDecision, FailureContext, HandleOutcome, HandlerHandle, LifecycleDecision, State, TerminationReason};
pub use registry::{Consistency, ConsistencyRegistry, LivenessToken};
pub use store::{EventStore, InMemory, StoreEvent, SubscriberRef, Subscribed};
pub use subscription::SubscriptionHandle;
pub use upcast::{upcast_batch, Identity, Upcaster};

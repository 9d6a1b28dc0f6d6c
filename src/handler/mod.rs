//! Handler Runtime (C2): the long-lived per-handler agent that owns a
//! [`SubscriptionHandle`], drives the delivery state machine, invokes user
//! callbacks, enforces retry/skip/stop policy, and keeps the
//! [`ConsistencyRegistry`] apprised of its progress.

pub mod options;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::event::{EventNumber, Metadata, RecordedEvent};
use crate::registry::ConsistencyRegistry;
use crate::store::{EventStore, StoreEvent};
use crate::subscription::SubscriptionHandle;
use crate::upcast::{upcast_batch, Upcaster};
use options::HandlerOptions;

/// What a user lifecycle hook (`init`, `before_reset`) decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleDecision {
    /// Proceed normally.
    Continue,
    /// Terminate the agent with the given reason.
    Stop(String),
}

impl Default for LifecycleDecision {
    fn default() -> Self {
        LifecycleDecision::Continue
    }
}

/// What `handle` produced for one event. The type system rules out the
/// "unrecognized return value" case the specification otherwise has to
/// name: every value this enum can hold is one the runtime knows how to
/// act on.
#[derive(Debug)]
pub enum HandleOutcome<E> {
    /// The event was processed successfully.
    Ok,
    /// The event was recognized as already processed and is acked without
    /// reprocessing side effects.
    AlreadySeen,
    /// Processing failed with a domain-specific error.
    Error(E),
}

/// What the user `error` callback decided to do about a failed event.
#[derive(Debug)]
pub enum ErrorDecision<E> {
    /// Re-invoke `handle` for the same event immediately, with an updated
    /// user context.
    Retry {
        /// Opaque context threaded verbatim into the next [`FailureContext`].
        context: Json,
    },
    /// Sleep, then re-invoke `handle` for the same event. The sleep is
    /// cancellable: a `reset` control message or agent shutdown preempts it.
    RetryAfter {
        /// How long to sleep before retrying.
        delay: Duration,
        /// Opaque context threaded verbatim into the next [`FailureContext`].
        context: Json,
    },
    /// Confirm receipt without invoking `handle` again.
    Skip,
    /// Terminate the agent. The current batch is abandoned; no further
    /// events in it are acked.
    Stop(String),
}

/// Attributes passed to the user `error` callback: everything it needs to
/// decide a retry/skip/stop without reaching back into runtime internals.
#[derive(Debug, Clone)]
pub struct FailureContext {
    /// Application this handler belongs to.
    pub application: String,
    /// This handler's durable name.
    pub handler_name: String,
    /// Enriched metadata for the event that failed.
    pub metadata: EnrichedMetadata,
    /// User-controlled context, preserved verbatim across retries of the
    /// same event. Empty on the first attempt.
    pub context: Json,
    /// Captured only when the failure originated from a caught panic.
    pub trace: Option<String>,
}

/// Metadata accompanying a `handle` invocation: everything the store
/// recorded on the event, plus the runtime's own enrichment fields.
#[derive(Debug, Clone)]
pub struct EnrichedMetadata {
    /// Raw metadata the event was recorded with, including whatever the
    /// upcaster merged in.
    pub raw: Metadata,
    /// Application this handler belongs to.
    pub application: String,
    /// This handler's durable name.
    pub handler_name: String,
    /// Store-assigned event identity.
    pub event_id: String,
    /// Store-assigned event number.
    pub event_number: EventNumber,
    /// Stream the event belongs to.
    pub stream_id: String,
    /// Version of the stream at recording time.
    pub stream_version: u64,
    /// Correlation id, read through from `raw` if the producer recorded
    /// one. Never fabricated by this runtime.
    pub correlation_id: Option<String>,
    /// Causation id, read through from `raw` if the producer recorded one.
    /// Never fabricated by this runtime.
    pub causation_id: Option<String>,
    /// When the store recorded the event.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl EnrichedMetadata {
    fn new<T>(event: &RecordedEvent<T>, application: &str, handler_name: &str) -> Self {
        let correlation_id = event.metadata.get("correlation_id").and_then(Json::as_str).map(str::to_string);
        let causation_id = event.metadata.get("causation_id").and_then(Json::as_str).map(str::to_string);

        Self {
            raw: event.metadata.clone(),
            application: application.to_string(),
            handler_name: handler_name.to_string(),
            event_id: event.event_id.clone(),
            event_number: event.event_number,
            stream_id: event.stream_id.clone(),
            stream_version: event.stream_version,
            correlation_id,
            causation_id,
            created_at: event.created_at,
        }
    }
}

/// User-supplied reactor logic for a handler, with sensible defaults for
/// every hook a handler doesn't need to override.
#[async_trait]
pub trait Callbacks<Event>: Send + Sync {
    /// Domain error type `handle` can fail with.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs once the subscription is confirmed, before the first event is
    /// delivered.
    async fn init(&self) -> LifecycleDecision {
        LifecycleDecision::Continue
    }

    /// Runs once, during option resolution, before [`options::resolve`]
    /// enforces the required fields. Gives a handler a chance to inspect or
    /// normalize its own merged option bag (e.g. deriving a dynamic handler
    /// name). Defaults to passing the bag through unchanged.
    async fn init_config(&self, options: options::RawHandlerOptions) -> options::RawHandlerOptions {
        options
    }

    /// Runs before a `reset` is carried out.
    async fn before_reset(&self) -> LifecycleDecision {
        LifecycleDecision::Continue
    }

    /// Processes one event.
    async fn handle(&self, payload: Event, metadata: &EnrichedMetadata) -> HandleOutcome<Self::Error> {
        let _ = (payload, metadata);
        HandleOutcome::Ok
    }

    /// Decides what to do about a failed `handle` invocation.
    async fn error(&self, err: Self::Error, context: &FailureContext) -> ErrorDecision<Self::Error> {
        let _ = context;
        ErrorDecision::Stop(err.to_string())
    }
}

/// Observable lifecycle state of a handler agent, exposed to callers via
/// [`HandlerHandle::state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Just spawned, about to attempt its first subscribe.
    Initializing,
    /// Awaiting a successful `subscribe` call against the event store.
    Subscribing,
    /// Subscribed; awaiting the store's delivery of the first batch (or
    /// running `init()`).
    AwaitingConfirm,
    /// Steady state: processing delivered batches.
    Running,
    /// Terminated; no further state transitions will occur.
    Terminated(TerminationReason),
}

/// Why a handler agent stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// `init()` or `before_reset()` returned `Stop`.
    Lifecycle(String),
    /// The user `error` callback returned `Stop`, or an unhandled error
    /// reached the default policy.
    Handler(String),
    /// The event store reported this subscriber as down.
    SubscriptionDown(String),
    /// A panic was caught at the agent's task boundary.
    Exception(String),
    /// The handle was dropped and the agent was asked to shut down.
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Lifecycle(reason) => write!(f, "lifecycle hook requested stop: {reason}"),
            TerminationReason::Handler(reason) => write!(f, "handler stopped: {reason}"),
            TerminationReason::SubscriptionDown(reason) => write!(f, "subscription down: {reason}"),
            TerminationReason::Exception(reason) => write!(f, "handler panicked: {reason}"),
            TerminationReason::Shutdown => write!(f, "shut down"),
        }
    }
}

enum Control {
    Reset,
    Shutdown,
}

/// Caller-facing identity of a spawned handler agent.
pub struct HandlerHandle {
    name: String,
    state: watch::Receiver<State>,
    control: mpsc::Sender<Control>,
    join: JoinHandle<TerminationReason>,
}

impl HandlerHandle {
    /// The durable name of the handler this handle addresses.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The handler's current lifecycle state.
    pub fn state(&self) -> State {
        self.state.borrow().clone()
    }

    /// Sends an operator-triggered reset signal to the agent.
    pub async fn reset(&self) {
        let _ = self.control.send(Control::Reset).await;
    }

    /// Requests the agent shut down, then awaits its termination reason.
    pub async fn shutdown(self) -> TerminationReason {
        let _ = self.control.send(Control::Shutdown).await;
        self.join.await.unwrap_or(TerminationReason::Shutdown)
    }

    /// Awaits the agent's termination reason without requesting shutdown
    /// (e.g. because it is expected to stop on its own).
    pub async fn join(self) -> TerminationReason {
        self.join.await.unwrap_or(TerminationReason::Shutdown)
    }
}

/// Spawns a handler agent for `options` against `store`, upcasting raw
/// events with `upcaster` before delegating to `callbacks`, and reporting
/// progress to `registry`.
pub fn start<S, U, C, Event>(store: Arc<S>, options: HandlerOptions, upcaster: U, callbacks: C, registry: ConsistencyRegistry) -> HandlerHandle
where
    S: EventStore,
    U: Upcaster<S::Event, Event> + Send + Sync + 'static,
    C: Callbacks<Event> + 'static,
    Event: Clone + Send + Sync + 'static,
{
    let name = options.name.clone();
    let (state_tx, state_rx) = watch::channel(State::Initializing);
    let (control_tx, control_rx) = mpsc::channel(8);
    let callbacks = Arc::new(callbacks);

    let join = tokio::spawn(async move {
        let reason = run(store, options, upcaster, callbacks, registry, state_tx.clone(), control_rx).await;
        let _ = state_tx.send(State::Terminated(reason.clone()));
        reason
    });

    HandlerHandle {
        name,
        state: state_rx,
        control: control_tx,
        join,
    }
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(handler = %options.name)))]
async fn run<S, U, C, Event>(
    store: Arc<S>,
    options: HandlerOptions,
    upcaster: U,
    callbacks: Arc<C>,
    registry: ConsistencyRegistry,
    state_tx: watch::Sender<State>,
    mut control_rx: mpsc::Receiver<Control>,
) -> TerminationReason
where
    S: EventStore,
    U: Upcaster<S::Event, Event> + Send + Sync,
    C: Callbacks<Event> + 'static,
    Event: Clone + Send + Sync + 'static,
{
    let mut subscription = SubscriptionHandle::new(Arc::clone(&store), options.name.clone(), options.start_from, options.subscribe_to.clone());
    let mut last_seen_event: Option<EventNumber> = None;
    let _liveness = registry.register(options.application.clone(), options.name.clone(), options.consistency).await;

    let _ = state_tx.send(State::Subscribing);

    loop {
        match subscription.subscribe().await {
            Ok(()) => break,
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::info!(handler = %options.name, error = %err, "subscribe failed, backing off");

                let delay = subscription.backoff();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    msg = control_rx.recv() => {
                        if matches!(msg, Some(Control::Shutdown) | None) {
                            return TerminationReason::Shutdown;
                        }
                    }
                }
            }
        }
    }

    let _ = state_tx.send(State::AwaitingConfirm);

    match callbacks.init().await {
        LifecycleDecision::Continue => {}
        LifecycleDecision::Stop(reason) => return TerminationReason::Lifecycle(reason),
    }

    let _ = state_tx.send(State::Running);

    loop {
        tokio::select! {
            maybe_event = subscription.recv() => {
                match maybe_event {
                    Some(StoreEvent::Events(batch)) => {
                        let application = options.application.clone();
                        let mut additional = Metadata::new();
                        additional.insert("application".to_string(), Json::String(application));

                        for upcast_result in upcast_batch(&upcaster, batch, additional) {
                            let event = match upcast_result {
                                Ok(event) => event,
                                Err(err) => {
                                    #[cfg(feature = "tracing")]
                                    tracing::error!(handler = %options.name, error = %err, "upcast failed");
                                    return TerminationReason::Handler(err.to_string());
                                }
                            };

                            match process_event(&event, &options, &callbacks, &mut subscription, &registry, &mut last_seen_event, &mut control_rx).await {
                                ProcessOutcome::Continue => {}
                                ProcessOutcome::Stop(reason) => return reason,
                            }
                        }
                    }
                    Some(StoreEvent::Down(reason)) => return TerminationReason::SubscriptionDown(reason),
                    None => return TerminationReason::SubscriptionDown("subscription channel closed".to_string()),
                }
            }
            control = control_rx.recv() => {
                match control {
                    Some(Control::Reset) => {
                        match callbacks.before_reset().await {
                            LifecycleDecision::Continue => {}
                            LifecycleDecision::Stop(reason) => return TerminationReason::Lifecycle(reason),
                        }

                        if let Err(err) = subscription.reset().await {
                            #[cfg(feature = "tracing")]
                            tracing::error!(handler = %options.name, error = %err, "reset failed");
                            return TerminationReason::Handler(err.to_string());
                        }

                        last_seen_event = None;
                        let _ = state_tx.send(State::Subscribing);

                        loop {
                            match subscription.subscribe().await {
                                Ok(()) => break,
                                Err(_) => {
                                    let delay = subscription.backoff();
                                    tokio::select! {
                                        _ = tokio::time::sleep(delay) => {}
                                        msg = control_rx.recv() => {
                                            if matches!(msg, Some(Control::Shutdown) | None) {
                                                return TerminationReason::Shutdown;
                                            }
                                        }
                                    }
                                }
                            }
                        }

                        let _ = state_tx.send(State::Running);
                    }
                    Some(Control::Shutdown) | None => return TerminationReason::Shutdown,
                }
            }
        }
    }
}

enum ProcessOutcome {
    Continue,
    Stop(TerminationReason),
}

#[allow(clippy::too_many_arguments)]
async fn process_event<S, C, Event>(
    event: &RecordedEvent<Event>,
    options: &HandlerOptions,
    callbacks: &Arc<C>,
    subscription: &mut SubscriptionHandle<S>,
    registry: &ConsistencyRegistry,
    last_seen_event: &mut Option<EventNumber>,
    control_rx: &mut mpsc::Receiver<Control>,
) -> ProcessOutcome
where
    S: EventStore,
    C: Callbacks<Event> + 'static,
    Event: Clone + Send + Sync + 'static,
{
    if let Some(seen) = *last_seen_event {
        if event.event_number <= seen {
            confirm_receipt(event.event_number, options, subscription, registry, last_seen_event).await;
            return ProcessOutcome::Continue;
        }
    }

    let metadata = EnrichedMetadata::new(event, &options.application, &options.name);
    let mut context = Json::Null;

    loop {
        let outcome = match invoke_handle(callbacks, event.payload.clone(), metadata.clone()).await {
            Ok(outcome) => outcome,
            Err(trace) => {
                #[cfg(feature = "tracing")]
                tracing::error!(handler = %options.name, event_number = event.event_number, %trace, "handle panicked");
                return ProcessOutcome::Stop(TerminationReason::Exception(trace));
            }
        };

        match outcome {
            HandleOutcome::Ok | HandleOutcome::AlreadySeen => {
                confirm_receipt(event.event_number, options, subscription, registry, last_seen_event).await;
                return ProcessOutcome::Continue;
            }
            HandleOutcome::Error(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(handler = %options.name, event_number = event.event_number, error = %err, "handle failed");

                let failure = FailureContext {
                    application: options.application.clone(),
                    handler_name: options.name.clone(),
                    metadata: metadata.clone(),
                    context: context.clone(),
                    trace: None,
                };

                match callbacks.error(err, &failure).await {
                    ErrorDecision::Retry { context: next } => {
                        context = next;
                        continue;
                    }
                    ErrorDecision::RetryAfter { delay, context: next } => {
                        context = next;
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            msg = control_rx.recv() => {
                                if matches!(msg, Some(Control::Shutdown) | None) {
                                    return ProcessOutcome::Stop(TerminationReason::Shutdown);
                                }
                                // A Reset received mid-retry is handled by the outer loop
                                // once this event finishes; the sleep was merely cut short.
                            }
                        }
                        continue;
                    }
                    ErrorDecision::Skip => {
                        confirm_receipt(event.event_number, options, subscription, registry, last_seen_event).await;
                        return ProcessOutcome::Continue;
                    }
                    ErrorDecision::Stop(reason) => {
                        return ProcessOutcome::Stop(TerminationReason::Handler(reason));
                    }
                }
            }
        }
    }
}

/// Runs `handle` on its own task so a panic is caught at the task boundary
/// rather than unwinding the handler agent itself. `Ok` carries whatever
/// `handle` returned; `Err` carries a rendering of the panic payload, since
/// a caught panic cannot generally be converted into the handler's own
/// domain `Error` type.
async fn invoke_handle<C, Event>(callbacks: &Arc<C>, payload: Event, metadata: EnrichedMetadata) -> Result<HandleOutcome<C::Error>, String>
where
    C: Callbacks<Event> + 'static,
    Event: Send + Sync + 'static,
{
    let callbacks = Arc::clone(callbacks);
    tokio::spawn(async move { callbacks.handle(payload, &metadata).await })
        .await
        .map_err(|join_err| {
            if !join_err.is_panic() {
                return join_err.to_string();
            }

            let panic = join_err.into_panic();
            if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "handler panicked with a non-string payload".to_string()
            }
        })
}

async fn confirm_receipt<S>(
    event_number: EventNumber,
    options: &HandlerOptions,
    subscription: &SubscriptionHandle<S>,
    registry: &ConsistencyRegistry,
    last_seen_event: &mut Option<EventNumber>,
) where
    S: EventStore,
{
    subscription.ack(event_number).await;
    registry.ack(&options.application, &options.name, event_number).await;
    *last_seen_event = Some(event_number);
}

//! # Message Bus
//!
//! The bus routes commands to exactly one handler and fans events out to every
//! matching handler, scoped by session.
//!
//! ## Features
//!
//! - **Request/response commands**: [`MessageBus::execute`] never fails because
//!   a handler failed; the failure is reported inside the [`CommandResult`].
//! - **Event fan-out**: session handlers, then `ROOT`, then `GLOBAL`, each in
//!   registration order, one handler at a time.
//! - **Scheduled delivery**: scheduled events wait in a
//!   [`ScheduledDeliveryQueue`] until due and are then queued behind the
//!   immediate events already waiting.
//! - **Error isolation**: a failing event handler does not prevent the others
//!   from running. Failures are recorded and can be read back with
//!   [`MessageBus::event_handler_errors`].
//! - **Drain barrier**: [`MessageBus::ensure_events_processed`] waits until
//!   every event queued so far has been handled.
//!
//! ## Design
//!
//! ```text
//! publish ──► immediate mpsc ─────────────┐
//!    │                                    ▼
//!    └─ scheduled ─► min-heap ──tick──► dispatch loop ──► handlers
//! ```
//!
//! A single spawned task owns the receiving end of the immediate queue and
//! interleaves it with a periodic tick that releases due scheduled events.
//! Handlers of one event run sequentially on that task.

use std::any::TypeId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::config::BusConfig;
use crate::storage::StorageError;

use super::handler::{
    CommandHandler, EventHandler, HandlerContext, Observer, within_dispatch,
    erase_command_handler, erase_event_handler, erase_observer, invoke_guarded,
};
use super::handler_registry::{EventKey, EventRegistration, HandlerRegistry};
use super::message::{
    Command, CommandResult, Event, HandlerFailure, SessionId, event_type_id, short_type_name,
};
use super::observability::{CommandCompleted, CommandStarted};
use super::scheduled_queue::ScheduledDeliveryQueue;
use super::session::BusSession;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Command handler for {command} already registered in scope {scope}")]
    DuplicateHandler {
        command: &'static str,
        scope: SessionId,
    },
    #[error("No {kind} handlers to unregister for {name} in scope {scope}")]
    NotFound {
        kind: &'static str,
        name: &'static str,
        scope: SessionId,
    },
    #[error("No handler registered for command {command} in scope {scope}")]
    NoHandler {
        command: &'static str,
        scope: SessionId,
    },
    #[error("Session {session_id} is no longer active")]
    InactiveSession { session_id: SessionId },
    #[error("Handler for {event} in scope {scope} failed: {failure}")]
    HandlerFailure {
        event: &'static str,
        scope: SessionId,
        failure: HandlerFailure,
    },
    #[error("MessageBus is not running")]
    NotRunning,
    #[error("Event {event} is not a scheduled event")]
    NotScheduled { event: &'static str },
    #[error("Unknown scheduled event type: {0}")]
    UnknownEventType(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type BusResult<T> = Result<T, BusError>;

/// A recorded event handler failure.
#[derive(Debug, Clone, PartialEq)]
pub struct EventHandlerError {
    pub event_id: String,
    pub event_name: &'static str,
    pub session_id: SessionId,
    /// Scope the failing handler was registered in.
    pub scope: SessionId,
    pub failure: HandlerFailure,
    pub occurred_at: DateTime<Utc>,
}

impl std::fmt::Display for EventHandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) handler in {} failed: {}",
            self.event_name, self.event_id, self.scope, self.failure
        )
    }
}

struct Worker {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct MessageBus {
    config: BusConfig,
    registry: HandlerRegistry,
    scheduled: ScheduledDeliveryQueue,
    sender: RwLock<Option<mpsc::UnboundedSender<Arc<dyn Event>>>>,
    worker: tokio::sync::Mutex<Option<Worker>>,
    in_flight: AtomicUsize,
    drained: Notify,
    // Scheduled events moved off the heap but not yet handled.
    released: Mutex<Vec<Arc<dyn Event>>>,
    suppress_errors: AtomicBool,
    handler_errors: Mutex<VecDeque<EventHandlerError>>,
}

impl MessageBus {
    /// Creates a stopped bus. Every call returns an independent instance.
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            scheduled: ScheduledDeliveryQueue::new(),
            sender: RwLock::new(None),
            worker: tokio::sync::Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            released: Mutex::new(Vec::new()),
            suppress_errors: AtomicBool::new(true),
            handler_errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn scheduled(&self) -> &ScheduledDeliveryQueue {
        &self.scheduled
    }

    pub fn is_running(&self) -> bool {
        self.sender_slot().is_some()
    }

    /// Events queued for immediate delivery but not yet fully handled.
    pub fn pending_events(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Every scheduled event not yet handled, earliest first: those still
    /// waiting in the scheduled queue and those already due but still
    /// queued for dispatch.
    pub fn pending_scheduled_events(&self) -> Vec<Arc<dyn Event>> {
        let mut pending = self.released().clone();
        pending.extend(self.scheduled.peek_pending());
        pending.sort_by_key(|event| {
            event
                .as_scheduled()
                .map(|scheduled| scheduled.delivery_time())
        });
        pending
    }

    fn sender_slot(&self) -> std::sync::RwLockReadGuard<'_, Option<mpsc::UnboundedSender<Arc<dyn Event>>>> {
        self.sender.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn released(&self) -> MutexGuard<'_, Vec<Arc<dyn Event>>> {
        self.released.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn errors(&self) -> MutexGuard<'_, VecDeque<EventHandlerError>> {
        self.handler_errors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the dispatch loop. Calling it on a running bus does nothing.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            warn!("MessageBus already running");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(Self::run(
            Arc::downgrade(self),
            rx,
            shutdown_rx,
            self.config.tick_interval,
        ));
        *worker = Some(Worker { shutdown_tx, task });
        info!("MessageBus started");
    }

    /// Stops the dispatch loop, waiting up to `shutdown_timeout` for the
    /// handler in progress before aborting it. Immediate events still queued
    /// are dropped; released scheduled events go back to the scheduled queue.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn stop(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            debug!("MessageBus already stopped");
            return;
        };

        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // The loop may already be gone; nothing to signal then.
        let _ = worker.shutdown_tx.send(());

        let abort = worker.task.abort_handle();
        match timeout(self.config.shutdown_timeout, worker.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("MessageBus loop ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "MessageBus loop did not stop within {:?}, aborting",
                    self.config.shutdown_timeout
                );
                abort.abort();
            }
        }

        let requeued = self.requeue_released();
        let discarded = self.in_flight.swap(0, Ordering::SeqCst).saturating_sub(requeued);
        if requeued > 0 {
            info!("Returned {} undelivered scheduled events to the scheduled queue", requeued);
        }
        if discarded > 0 {
            warn!("MessageBus stopped with {} undelivered events", discarded);
        }
        self.drained.notify_waiters();
        info!("MessageBus stopped");
    }

    /// Stops the bus and clears handlers, scheduled events, and recorded errors.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn reset(&self) {
        self.stop().await;
        self.registry.clear();
        self.scheduled.clear();
        self.released().clear();
        self.errors().clear();
        self.suppress_errors.store(true, Ordering::SeqCst);
        info!("MessageBus reset");
    }

    async fn run(
        bus: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<Arc<dyn Event>>,
        mut shutdown_rx: oneshot::Receiver<()>,
        tick_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    debug!("MessageBus loop received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(bus) = bus.upgrade() else { break };
                    bus.release_due_events();
                }
                received = rx.recv() => {
                    let Some(event) = received else { break };
                    let Some(bus) = bus.upgrade() else { break };
                    if let Err(e) = bus.fan_out(Arc::clone(&event), true).await {
                        error!("Unexpected dispatch error: {}", e);
                    }
                    if event.as_scheduled().is_some() {
                        bus.settle_released(&event);
                    }
                    bus.finish_one();
                }
            }
        }
        debug!("MessageBus loop exited");
    }

    fn release_due_events(&self) {
        for event in self.scheduled.drain_due(Utc::now()) {
            debug!("Releasing scheduled event {} ({})", event.name(), event.meta().id);
            // Tracked before sending so the loop can never settle it first.
            self.released().push(Arc::clone(&event));
            if let Err(e) = self.enqueue(Arc::clone(&event)) {
                warn!("Failed to release scheduled event, keeping it scheduled: {}", e);
                self.settle_released(&event);
                if let Err(e) = self.scheduled.offer(event) {
                    error!("Cannot return event to the scheduled queue: {}", e);
                }
            }
        }
    }

    fn settle_released(&self, event: &Arc<dyn Event>) {
        let mut released = self.released();
        if let Some(index) = released
            .iter()
            .position(|pending| pending.meta().id == event.meta().id)
        {
            released.remove(index);
        }
    }

    fn requeue_released(&self) -> usize {
        let released: Vec<Arc<dyn Event>> = self.released().drain(..).collect();
        let count = released.len();
        for event in released {
            if let Err(e) = self.scheduled.offer(event) {
                error!("Cannot return event to the scheduled queue: {}", e);
            }
        }
        count
    }

    fn enqueue(&self, event: Arc<dyn Event>) -> BusResult<()> {
        let slot = self.sender_slot();
        let sender = slot.as_ref().ok_or(BusError::NotRunning)?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if sender.send(event).is_err() {
            self.finish_one();
            return Err(BusError::NotRunning);
        }
        Ok(())
    }

    fn finish_one(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.drained.notify_waiters();
        }
    }

    pub fn register_command_handler<C, H>(&self, handler: H) -> BusResult<()>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.register_command_handler_in_scope::<C, H>(SessionId::root(), handler)
    }

    #[tracing::instrument(skip(self, handler), level = "debug")]
    pub fn register_command_handler_in_scope<C, H>(&self, scope: SessionId, handler: H) -> BusResult<()>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let kind = handler.kind();
        self.registry.register_command(
            &scope,
            TypeId::of::<C>(),
            command_name::<C>(),
            kind,
            erase_command_handler::<C, H>(handler),
        )
    }

    pub fn unregister_command_handler<C: Command>(&self) -> BusResult<()> {
        self.unregister_command_handler_in_scope::<C>(SessionId::root())
    }

    pub fn unregister_command_handler_in_scope<C: Command>(&self, scope: SessionId) -> BusResult<()> {
        self.registry
            .unregister_command(&scope, TypeId::of::<C>(), command_name::<C>())
    }

    pub fn register_event_handler<E, H>(&self, handler: H)
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.register_event_handler_in_scope::<E, H>(SessionId::root(), handler)
    }

    #[tracing::instrument(skip(self, handler), level = "debug")]
    pub fn register_event_handler_in_scope<E, H>(&self, scope: SessionId, handler: H)
    where
        E: Event,
        H: EventHandler<E>,
    {
        let kind = handler.kind();
        self.registry.register_event(
            &scope,
            EventKey::Type(TypeId::of::<E>()),
            event_name::<E>(),
            kind,
            erase_event_handler::<E, H>(handler),
        );
    }

    pub fn unregister_event_handlers<E: Event>(&self) -> BusResult<usize> {
        self.unregister_event_handlers_in_scope::<E>(SessionId::root())
    }

    pub fn unregister_event_handlers_in_scope<E: Event>(&self, scope: SessionId) -> BusResult<usize> {
        self.registry.unregister_all_for_type(
            &scope,
            EventKey::Type(TypeId::of::<E>()),
            event_name::<E>(),
        )
    }

    /// Removes every handler registered in `scope`.
    pub fn unregister_session_handlers(&self, scope: &SessionId) {
        self.registry.unregister_session(scope);
    }

    /// Registers an observer that receives every event, in the `GLOBAL` scope.
    pub fn register_observability_handler<O: Observer>(&self, observer: O) {
        let kind = observer.kind();
        self.registry.register_event(
            &SessionId::global(),
            EventKey::All,
            "*",
            kind,
            erase_observer(observer),
        );
    }

    /// Opens a session bound to this bus and publishes its start event.
    pub async fn create_session(self: &Arc<Self>, id: Option<SessionId>) -> BusResult<BusSession> {
        BusSession::open(Arc::clone(self), id.unwrap_or_else(SessionId::generate)).await
    }

    /// Runs `f` inside a fresh session and closes it afterwards, forwarding
    /// the error text of a failed run to the session end event.
    pub async fn with_session<F, Fut, T, E>(self: &Arc<Self>, f: F) -> Result<T, E>
    where
        F: FnOnce(BusSession) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display + From<BusError>,
    {
        let session = self.create_session(None).await?;
        let outcome = f(session.clone()).await;
        let error = outcome.as_ref().err().map(|e| e.to_string());
        session.close(error);
        outcome
    }

    /// Runs the command's handler in the command's own scope.
    ///
    /// Fails only when no handler is registered. A handler error or panic
    /// yields a result with `success == false` and
    /// `error == "<kind>: <message>"`.
    #[tracing::instrument(skip(self, command), fields(command = command.name()), level = "debug")]
    pub async fn execute<C: Command>(&self, command: C) -> BusResult<CommandResult> {
        let name = command.name();
        let meta = command.meta().clone();
        let handler = self
            .registry
            .resolve_command_handler(&meta.session_id, TypeId::of::<C>(), name)
            .inspect_err(|e| error!("{}", e))?;

        if self.config.lifecycle_events {
            self.publish_lifecycle(Arc::new(CommandStarted::new(&meta, name)));
        }

        let started = Instant::now();
        let outcome = invoke_guarded(HandlerContext::Command, handler(Box::new(command))).await;
        let execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut result = match outcome {
            Ok(result) => result,
            Err(failure) => {
                warn!("Command {} ({}) failed: {}", name, meta.id, failure);
                CommandResult::failure(failure.to_string())
            }
        }
        .correlate(&meta);
        result
            .metadata
            .insert("execution_time_ms".to_string(), serde_json::json!(execution_time_ms));

        if self.config.lifecycle_events {
            self.publish_lifecycle(Arc::new(CommandCompleted::new(
                &meta,
                name,
                &result,
                execution_time_ms,
            )));
        }
        Ok(result)
    }

    fn publish_lifecycle(&self, event: Arc<dyn Event>) {
        if let Err(e) = self.sync_publish(event) {
            trace!("Lifecycle event not published: {}", e);
        }
    }

    /// Queues an event for delivery.
    ///
    /// Scheduled events go to the scheduled queue and are accepted even when
    /// the bus is stopped. Other events require a running bus.
    pub async fn publish<E: Event>(&self, event: E) -> BusResult<()> {
        self.sync_publish(Arc::new(event))
    }

    pub fn sync_publish(&self, event: Arc<dyn Event>) -> BusResult<()> {
        if let Some(scheduled) = event.as_scheduled() {
            let due = scheduled.delivery_time();
            self.scheduled.offer(Arc::clone(&event))?;
            debug!("Scheduled {} ({}) for {}", event.name(), event.meta().id, due);
            return Ok(());
        }
        trace!("Publishing {} ({})", event.name(), event.meta().id);
        self.enqueue(event)
    }

    /// Delivers an event right away on the calling task.
    ///
    /// In suppressed mode (the default) handler failures are recorded and the
    /// fan-out continues. After [`Self::unsuppress_event_errors`] the first
    /// failure stops the fan-out and is returned.
    pub async fn dispatch_event(&self, event: Arc<dyn Event>) -> BusResult<()> {
        let propagate = !self.suppress_errors.load(Ordering::SeqCst);
        self.fan_out(event, !propagate).await
    }

    #[tracing::instrument(skip_all, fields(event = event.name(), id = %event.meta().id), level = "debug")]
    async fn fan_out(&self, event: Arc<dyn Event>, isolate: bool) -> BusResult<()> {
        let session_id = event.meta().session_id.clone();
        let handlers = self
            .registry
            .resolve_event_handlers(&session_id, event_type_id(event.as_ref()));
        if handlers.is_empty() {
            trace!("No handlers for {}", event.name());
            return Ok(());
        }

        for registration in handlers {
            let outcome = invoke_guarded(
                HandlerContext::Dispatch,
                (registration.handler)(Arc::clone(&event)),
            )
            .await;
            let Err(failure) = outcome else { continue };

            if isolate {
                self.record_failure(&event, &registration, failure);
            } else {
                return Err(BusError::HandlerFailure {
                    event: event.name(),
                    scope: registration.scope,
                    failure,
                });
            }
        }
        Ok(())
    }

    fn record_failure(&self, event: &Arc<dyn Event>, registration: &EventRegistration, failure: HandlerFailure) {
        let record = EventHandlerError {
            event_id: event.meta().id.clone(),
            event_name: event.name(),
            session_id: event.meta().session_id.clone(),
            scope: registration.scope.clone(),
            failure,
            occurred_at: Utc::now(),
        };
        error!("{}", record);

        let mut errors = self.errors();
        if errors.len() >= self.config.max_recorded_errors.max(1) {
            errors.pop_front();
        }
        errors.push_back(record);
    }

    pub fn event_handler_errors(&self) -> Vec<EventHandlerError> {
        self.errors().iter().cloned().collect()
    }

    pub fn clear_event_handler_errors(&self) {
        self.errors().clear();
    }

    /// Makes [`Self::dispatch_event`] return handler failures to the caller.
    pub fn unsuppress_event_errors(&self) {
        self.suppress_errors.store(false, Ordering::SeqCst);
    }

    pub fn suppress_event_errors(&self) {
        self.suppress_errors.store(true, Ordering::SeqCst);
    }

    /// Waits until every event queued so far has been handled.
    ///
    /// Scheduled events that are not yet due are not waited for. Called while
    /// an event handler is running, including from a command or approval
    /// handler that an event handler is waiting on, it returns immediately:
    /// the event being handled cannot finish before the caller does.
    pub async fn ensure_events_processed(&self) {
        if within_dispatch() {
            warn!("ensure_events_processed called under an event handler; not waiting");
            return;
        }

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn command_name<C: Command>() -> &'static str {
    short_type_name(std::any::type_name::<C>())
}

fn event_name<E: Event>() -> &'static str {
    short_type_name(std::any::type_name::<E>())
}

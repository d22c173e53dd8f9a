//! Handler traits and the adapters that turn plain functions into handlers.
//!
//! A handler either implements [`CommandHandler`] / [`EventHandler`] /
//! [`Observer`] directly, or wraps a function in [`SyncHandler`] or
//! [`AsyncHandler`]. The wrapper decides the [`HandlerKind`] once, when the
//! handler is registered.

use std::any::{Any, type_name};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use super::message::{Command, CommandResult, Event, HandlerFailure, HandlerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Sync,
    Async,
}

#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    async fn handle(&self, command: C) -> HandlerResult<CommandResult>;

    fn kind(&self) -> HandlerKind {
        HandlerKind::Async
    }
}

#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: Arc<E>) -> HandlerResult<()>;

    fn kind(&self) -> HandlerKind {
        HandlerKind::Async
    }
}

/// Receives every event published on the bus, whatever its type.
#[async_trait]
pub trait Observer: Send + Sync + 'static {
    async fn observe(&self, event: Arc<dyn Event>) -> HandlerResult<()>;

    fn kind(&self) -> HandlerKind {
        HandlerKind::Async
    }
}

#[async_trait]
impl<O: Observer> Observer for Arc<O> {
    async fn observe(&self, event: Arc<dyn Event>) -> HandlerResult<()> {
        self.as_ref().observe(event).await
    }

    fn kind(&self) -> HandlerKind {
        self.as_ref().kind()
    }
}

/// Adapts a synchronous function into a handler.
pub struct SyncHandler<F>(pub F);

/// Adapts a function returning a future into a handler.
pub struct AsyncHandler<F>(pub F);

#[async_trait]
impl<C, F> CommandHandler<C> for SyncHandler<F>
where
    C: Command,
    F: Fn(C) -> HandlerResult<CommandResult> + Send + Sync + 'static,
{
    async fn handle(&self, command: C) -> HandlerResult<CommandResult> {
        (self.0)(command)
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Sync
    }
}

#[async_trait]
impl<C, F, Fut> CommandHandler<C> for AsyncHandler<F>
where
    C: Command,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<CommandResult>> + Send + 'static,
{
    async fn handle(&self, command: C) -> HandlerResult<CommandResult> {
        (self.0)(command).await
    }
}

#[async_trait]
impl<E, F> EventHandler<E> for SyncHandler<F>
where
    E: Event,
    F: Fn(&E) -> HandlerResult<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: Arc<E>) -> HandlerResult<()> {
        (self.0)(&event)
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Sync
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for AsyncHandler<F>
where
    E: Event,
    F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<E>) -> HandlerResult<()> {
        (self.0)(event).await
    }
}

#[async_trait]
impl<F> Observer for SyncHandler<F>
where
    F: Fn(&dyn Event) -> HandlerResult<()> + Send + Sync + 'static,
{
    async fn observe(&self, event: Arc<dyn Event>) -> HandlerResult<()> {
        (self.0)(event.as_ref())
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Sync
    }
}

#[async_trait]
impl<F, Fut> Observer for AsyncHandler<F>
where
    F: Fn(Arc<dyn Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
{
    async fn observe(&self, event: Arc<dyn Event>) -> HandlerResult<()> {
        (self.0)(event).await
    }
}

pub type HandlerFuture<T> = BoxFuture<'static, HandlerResult<T>>;

pub(crate) type ErasedCommandHandler =
    Arc<dyn Fn(Box<dyn Any + Send>) -> HandlerFuture<CommandResult> + Send + Sync>;

pub(crate) type ErasedEventHandler =
    Arc<dyn Fn(Arc<dyn Event>) -> HandlerFuture<()> + Send + Sync>;

pub(crate) fn erase_command_handler<C, H>(handler: H) -> ErasedCommandHandler
where
    C: Command,
    H: CommandHandler<C>,
{
    let handler = Arc::new(handler);
    Arc::new(move |command: Box<dyn Any + Send>| {
        let handler = Arc::clone(&handler);
        async move {
            let command = command.downcast::<C>().map_err(|_| {
                HandlerFailure::new("TypeMismatch", format!("expected {}", type_name::<C>()))
            })?;
            handler.handle(*command).await
        }
        .boxed()
    })
}

pub(crate) fn erase_event_handler<E, H>(handler: H) -> ErasedEventHandler
where
    E: Event,
    H: EventHandler<E>,
{
    let handler = Arc::new(handler);
    Arc::new(move |event: Arc<dyn Event>| {
        let handler = Arc::clone(&handler);
        async move {
            let event = event.into_any_arc().downcast::<E>().map_err(|_| {
                HandlerFailure::new("TypeMismatch", format!("expected {}", type_name::<E>()))
            })?;
            handler.handle(event).await
        }
        .boxed()
    })
}

pub(crate) fn erase_observer<O: Observer>(observer: O) -> ErasedEventHandler {
    let observer = Arc::new(observer);
    Arc::new(move |event: Arc<dyn Event>| {
        let observer = Arc::clone(&observer);
        async move { observer.observe(event).await }.boxed()
    })
}

/// Where the currently running handler was invoked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerContext {
    Command,
    Dispatch,
    Approval,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct HandlerFrame {
    context: HandlerContext,
    // Set when an event handler is running further up this chain of calls,
    // even if a command or approval handler was entered since.
    within_dispatch: bool,
}

tokio::task_local! {
    static HANDLER_FRAME: HandlerFrame;
}

pub(crate) fn current_handler_context() -> Option<HandlerContext> {
    HANDLER_FRAME.try_with(|frame| frame.context).ok()
}

/// True while a bus handler is running on the current task.
pub fn in_handler_scope() -> bool {
    current_handler_context().is_some()
}

/// True when an event handler is running on the current task or on the task
/// that spawned the current approval handler.
pub(crate) fn within_dispatch() -> bool {
    HANDLER_FRAME
        .try_with(|frame| frame.within_dispatch)
        .unwrap_or(false)
}

/// Wraps `future` in a handler context. The frame is built when this is
/// called, so a future later moved to another task keeps the caller's
/// dispatch marker.
pub(crate) fn scoped<F: Future>(
    context: HandlerContext,
    future: F,
) -> tokio::task::futures::TaskLocalFuture<HandlerFrame, F> {
    let frame = HandlerFrame {
        context,
        within_dispatch: context == HandlerContext::Dispatch || within_dispatch(),
    };
    HANDLER_FRAME.scope(frame, future)
}

/// Runs a handler future, converting a panic into a `"Panic"` failure.
pub(crate) async fn invoke_guarded<T>(
    context: HandlerContext,
    future: HandlerFuture<T>,
) -> HandlerResult<T> {
    match scoped(context, AssertUnwindSafe(future).catch_unwind()).await {
        Ok(outcome) => outcome,
        Err(payload) => Err(HandlerFailure::from_panic(payload)),
    }
}

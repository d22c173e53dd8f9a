//! Session-scoped command and event bus.
//!
//! - [`message`]: commands, events, metadata and results
//! - [`handler`]: handler traits and the sync/async adapters
//! - [`handler_registry`]: per-scope handler tables and resolution order
//! - [`scheduled`] / [`scheduled_queue`]: delayed delivery and its persisted form
//! - [`message_bus`]: the dispatcher
//! - [`session`]: session handles with handler cleanup
//! - [`approval`]: human-in-the-loop approval with expiry
//! - [`recovery`]: persisting pending scheduled events across restarts
//! - [`observability`]: lifecycle events and bundled observers

pub mod approval;
pub mod handler;
pub mod handler_registry;
pub mod message;
pub mod message_bus;
pub mod observability;
pub mod recovery;
pub mod scheduled;
pub mod scheduled_queue;
pub mod session;

pub use approval::{
    ApprovalCommand, ApprovalDenied, ApprovalExpired, ApprovalGranted, ApprovalHandler,
    ApprovalResult, ApprovalStatus, ApprovalWorkflow,
};
pub use handler::{
    AsyncHandler, CommandHandler, EventHandler, HandlerFuture, HandlerKind, Observer, SyncHandler,
    in_handler_scope,
};
pub use handler_registry::{EventKey, HandlerRegistry};
pub use message::{
    AsAny, Command, CommandResult, Event, GLOBAL_SCOPE, HandlerFailure, HandlerResult,
    MessageMeta, Metadata, ROOT_SCOPE, SessionId, downcast_event, event_ref, event_type_id,
};
pub use message_bus::{BusError, BusResult, EventHandlerError, MessageBus};
pub use observability::{
    CommandCompleted, CommandStarted, FileEventObserver, MetricsObserver, MetricsSummary,
    TracingObserver,
};
pub use recovery::CrashRecovery;
pub use scheduled::{
    PersistentEvent, Scheduled, ScheduledEvent, ScheduledEventRecord, ScheduledEventRegistry,
};
pub use scheduled_queue::ScheduledDeliveryQueue;
pub use session::{BusSession, SessionEnded, SessionStarted};

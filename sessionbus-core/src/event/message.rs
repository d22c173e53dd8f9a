//! # Message Model
//!
//! Commands and events share a common envelope ([`MessageMeta`]): a unique id,
//! a creation timestamp, free-form metadata, and the id of the session the
//! message belongs to.
//!
//! ## Key Types
//!
//! - [`SessionId`]: scope key for handlers. `ROOT` is the default scope,
//!   `GLOBAL` is reserved for handlers that see every session.
//! - [`Command`]: a request answered by exactly one handler.
//! - [`Event`]: a notification fanned out to every matching handler.
//! - [`CommandResult`]: the outcome returned for an executed command.
//! - [`HandlerFailure`]: the error value a handler returns (or a caught panic).
//!
//! Handler lookup is keyed by the concrete Rust type of the message
//! (`TypeId`), while [`Command::name`] / [`Event::name`] give the short type
//! name used in errors and logs.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::scheduled::Scheduled;

pub const ROOT_SCOPE: &str = "ROOT";
pub const GLOBAL_SCOPE: &str = "GLOBAL";

/// Free-form metadata attached to messages and results.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Identifier of a session, used as the scope key for handler registrations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The default scope. Handlers registered here see events of every session.
    pub fn root() -> Self {
        Self(ROOT_SCOPE.to_string())
    }

    /// Reserved scope whose handlers run after session and `ROOT` handlers.
    pub fn global() -> Self {
        Self(GLOBAL_SCOPE.to_string())
    }

    /// A fresh random session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_SCOPE
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_SCOPE
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Envelope shared by every command and event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub session_id: SessionId,
}

impl MessageMeta {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            session_id: SessionId::root(),
        }
    }

    pub fn in_session(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::new()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl Default for MessageMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Upcasting helper so trait objects can be inspected and downcast.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A request with exactly one handler per scope.
pub trait Command: AsAny + fmt::Debug {
    fn meta(&self) -> &MessageMeta;
    fn meta_mut(&mut self) -> &mut MessageMeta;

    fn name(&self) -> &'static str {
        short_type_name(type_name::<Self>())
    }
}

/// A notification delivered to every matching handler.
pub trait Event: AsAny + fmt::Debug {
    fn meta(&self) -> &MessageMeta;

    fn name(&self) -> &'static str {
        short_type_name(type_name::<Self>())
    }

    /// Scheduled events return `Some`; the bus then defers delivery until
    /// the scheduled time instead of queueing the event immediately.
    fn as_scheduled(&self) -> Option<&dyn Scheduled> {
        None
    }
}

/// Downcasts a shared event to its concrete type.
pub fn downcast_event<E: Event>(event: &Arc<dyn Event>) -> Option<Arc<E>> {
    Arc::clone(event).into_any_arc().downcast::<E>().ok()
}

/// Borrowing counterpart of [`downcast_event`].
pub fn event_ref<E: Event>(event: &dyn Event) -> Option<&E> {
    event.as_any().downcast_ref::<E>()
}

/// Concrete type of a type-erased event.
pub fn event_type_id(event: &dyn Event) -> TypeId {
    event.as_any().type_id()
}

pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Outcome of an executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CommandResult {
    pub fn success(result: impl Into<serde_json::Value>) -> Self {
        Self {
            result: Some(result.into()),
            ..Self::empty(true)
        }
    }

    /// A successful result without a value.
    pub fn ok() -> Self {
        Self::empty(true)
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::empty(false)
        }
    }

    fn empty(success: bool) -> Self {
        Self {
            success,
            result: None,
            error: None,
            command_id: None,
            session_id: SessionId::root(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Stamps the originating command's id and session on the result.
    pub fn correlate(mut self, meta: &MessageMeta) -> Self {
        self.command_id = Some(meta.id.clone());
        self.session_id = meta.session_id.clone();
        self
    }
}

/// Error value produced by a failing handler.
///
/// `kind` is the short type name of the underlying error (or `"Panic"` for a
/// caught panic) and the display form is `"<kind>: <message>"`. Any
/// `std::error::Error` converts into it, so handlers can use `?` freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub kind: String,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Failure with the generic `"Error"` kind.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "handler panicked".to_string()
        };
        Self::new("Panic", message)
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl<E: std::error::Error> From<E> for HandlerFailure {
    fn from(error: E) -> Self {
        Self::new(short_type_name(type_name::<E>()), error.to_string())
    }
}

pub type HandlerResult<T> = Result<T, HandlerFailure>;

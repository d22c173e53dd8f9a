//! # Scheduled Events
//!
//! Events carrying an immutable `scheduled_time` are held back by the bus until
//! that time has passed. Because they may still be pending when the process
//! exits, they can be turned into a [`ScheduledEventRecord`] and rebuilt later
//! through a [`ScheduledEventRegistry`].
//!
//! ## Defining a scheduled event
//!
//! Implement [`PersistentEvent`] and route [`Event::as_scheduled`] to `self`:
//!
//! ```rust,no_run
//! use chrono::{DateTime, Utc};
//! use sessionbus_core::event::{Event, MessageMeta, PersistentEvent, Scheduled};
//!
//! #[derive(Debug)]
//! struct Reminder {
//!     meta: MessageMeta,
//!     at: DateTime<Utc>,
//! }
//!
//! impl Event for Reminder {
//!     fn meta(&self) -> &MessageMeta {
//!         &self.meta
//!     }
//!     fn as_scheduled(&self) -> Option<&dyn Scheduled> {
//!         Some(self)
//!     }
//! }
//!
//! impl PersistentEvent for Reminder {
//!     const TYPE_NAME: &'static str = "Reminder";
//!     fn scheduled_time(&self) -> DateTime<Utc> {
//!         self.at
//!     }
//!     fn from_parts(
//!         meta: MessageMeta,
//!         at: DateTime<Utc>,
//!         _payload: serde_json::Value,
//!     ) -> Result<Self, serde_json::Error> {
//!         Ok(Self { meta, at })
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Event, MessageMeta, Metadata, SessionId};
use super::message_bus::{BusError, BusResult};

/// Object-safe view of a scheduled event used by the queue and recovery.
pub trait Scheduled: Send + Sync {
    fn delivery_time(&self) -> DateTime<Utc>;
    fn to_record(&self) -> Result<ScheduledEventRecord, serde_json::Error>;
}

/// A scheduled event type that can be persisted and reconstructed by name.
pub trait PersistentEvent: Event + Sized {
    /// Stable name written into persisted records.
    const TYPE_NAME: &'static str;

    fn scheduled_time(&self) -> DateTime<Utc>;

    /// Type-specific fields beyond the common envelope.
    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        Ok(serde_json::Value::Null)
    }

    fn from_parts(
        meta: MessageMeta,
        scheduled_time: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error>;
}

impl<T: PersistentEvent> Scheduled for T {
    fn delivery_time(&self) -> DateTime<Utc> {
        PersistentEvent::scheduled_time(self)
    }

    fn to_record(&self) -> Result<ScheduledEventRecord, serde_json::Error> {
        ScheduledEventRecord::from_event(self)
    }
}

/// Serialized form of a pending scheduled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEventRecord {
    pub type_name: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub session_id: SessionId,
    pub scheduled_time: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ScheduledEventRecord {
    pub fn from_event<T: PersistentEvent>(event: &T) -> Result<Self, serde_json::Error> {
        let meta = event.meta();
        Ok(Self {
            type_name: T::TYPE_NAME.to_string(),
            event_id: meta.id.clone(),
            timestamp: meta.timestamp,
            metadata: meta.metadata.clone(),
            session_id: meta.session_id.clone(),
            scheduled_time: event.scheduled_time(),
            payload: event.payload()?,
        })
    }

    /// Rebuilds the message envelope, keeping the original id and timestamp.
    pub fn meta(&self) -> MessageMeta {
        MessageMeta {
            id: self.event_id.clone(),
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// The built-in scheduled event with no payload of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEvent {
    pub meta: MessageMeta,
    scheduled_time: DateTime<Utc>,
}

impl ScheduledEvent {
    pub fn new(scheduled_time: DateTime<Utc>) -> Self {
        Self {
            meta: MessageMeta::new(),
            scheduled_time,
        }
    }

    /// Scheduled `delay` from now.
    pub fn after(delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let scheduled_time = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::new(scheduled_time)
    }

    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.meta.session_id = session_id.into();
        self
    }

    pub fn scheduled_time(&self) -> DateTime<Utc> {
        self.scheduled_time
    }
}

impl Event for ScheduledEvent {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }

    fn as_scheduled(&self) -> Option<&dyn Scheduled> {
        Some(self)
    }
}

impl PersistentEvent for ScheduledEvent {
    const TYPE_NAME: &'static str = "ScheduledEvent";

    fn scheduled_time(&self) -> DateTime<Utc> {
        self.scheduled_time
    }

    fn from_parts(
        meta: MessageMeta,
        scheduled_time: DateTime<Utc>,
        _payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            meta,
            scheduled_time,
        })
    }
}

type Constructor = fn(ScheduledEventRecord) -> Result<Arc<dyn Event>, serde_json::Error>;

fn construct<T: PersistentEvent>(
    record: ScheduledEventRecord,
) -> Result<Arc<dyn Event>, serde_json::Error> {
    let meta = record.meta();
    let event = T::from_parts(meta, record.scheduled_time, record.payload)?;
    Ok(Arc::new(event))
}

/// Explicit table of scheduled event constructors, keyed by `TYPE_NAME`.
#[derive(Clone)]
pub struct ScheduledEventRegistry {
    constructors: HashMap<&'static str, Constructor>,
}

impl ScheduledEventRegistry {
    /// A registry with no types, not even [`ScheduledEvent`].
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register<T: PersistentEvent>(&mut self) -> &mut Self {
        self.constructors.insert(T::TYPE_NAME, construct::<T>);
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.constructors.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn reconstruct(&self, record: ScheduledEventRecord) -> BusResult<Arc<dyn Event>> {
        let constructor = self
            .constructors
            .get(record.type_name.as_str())
            .ok_or_else(|| BusError::UnknownEventType(record.type_name.clone()))?;
        Ok(constructor(record)?)
    }
}

impl Default for ScheduledEventRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register::<ScheduledEvent>();
        registry
    }
}

impl std::fmt::Debug for ScheduledEventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledEventRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

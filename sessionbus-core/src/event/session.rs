//! Session-scoped handler registration.
//!
//! A [`BusSession`] registers handlers under its own id, stamps that id on the
//! commands it executes, and removes all of its handlers when closed (or
//! dropped). Start and end of a session are announced with
//! [`SessionStarted`] and [`SessionEnded`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::handler::{CommandHandler, EventHandler};
use super::message::{Command, CommandResult, Event, MessageMeta, SessionId};
use super::message_bus::{BusError, BusResult, MessageBus};

#[derive(Debug, Clone)]
pub struct SessionStarted {
    pub meta: MessageMeta,
}

impl Event for SessionStarted {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }
}

#[derive(Debug, Clone)]
pub struct SessionEnded {
    pub meta: MessageMeta,
    pub error: Option<String>,
}

impl Event for SessionEnded {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }
}

struct SessionInner {
    id: SessionId,
    created_at: DateTime<Utc>,
    active: AtomicBool,
    bus: Arc<MessageBus>,
}

impl SessionInner {
    fn teardown(&self, error: Option<String>) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.bus.unregister_session_handlers(&self.id);

        let ended = SessionEnded {
            meta: MessageMeta::in_session(self.id.clone()),
            error,
        };
        if let Err(e) = self.bus.sync_publish(Arc::new(ended)) {
            debug!("SessionEnded for {} not published: {}", self.id, e);
        }
        info!("Session {} closed", self.id);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.teardown(None);
    }
}

/// Handle to an open session. Clones share the same session.
#[derive(Clone)]
pub struct BusSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for BusSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSession")
            .field("id", &self.inner.id)
            .field("created_at", &self.inner.created_at)
            .field("active", &self.is_active())
            .finish()
    }
}

impl BusSession {
    pub(crate) async fn open(bus: Arc<MessageBus>, id: SessionId) -> BusResult<Self> {
        bus.publish(SessionStarted {
            meta: MessageMeta::in_session(id.clone()),
        })
        .await?;
        info!("Session {} started", id);

        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                created_at: Utc::now(),
                active: AtomicBool::new(true),
                bus,
            }),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.inner.bus
    }

    fn ensure_active(&self) -> BusResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(BusError::InactiveSession {
                session_id: self.inner.id.clone(),
            })
        }
    }

    pub fn register_command_handler<C, H>(&self, handler: H) -> BusResult<&Self>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.ensure_active()?;
        self.inner
            .bus
            .register_command_handler_in_scope::<C, H>(self.inner.id.clone(), handler)?;
        Ok(self)
    }

    pub fn register_event_handler<E, H>(&self, handler: H) -> BusResult<&Self>
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.ensure_active()?;
        self.inner
            .bus
            .register_event_handler_in_scope::<E, H>(self.inner.id.clone(), handler);
        Ok(self)
    }

    /// Executes `command` in this session's scope.
    pub async fn execute_with_session<C: Command>(&self, mut command: C) -> BusResult<CommandResult> {
        self.ensure_active()?;
        command.meta_mut().session_id = self.inner.id.clone();
        self.inner.bus.execute(command).await
    }

    /// Removes this session's handlers and announces the end of the session.
    /// Later calls do nothing.
    pub fn close(&self, error: Option<String>) {
        self.inner.teardown(error);
    }
}

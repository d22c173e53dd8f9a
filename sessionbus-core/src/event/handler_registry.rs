//! # Handler Registry
//!
//! Stores command and event handlers per scope (a session id, `ROOT`, or
//! `GLOBAL`) and resolves them for dispatch.
//!
//! ## Resolution order
//!
//! Command lookup only considers the command's own scope. Event lookup fans out
//! over three buckets, each in registration order:
//!
//! ```text
//! (a) the event's session scope (skipped for ROOT / GLOBAL)
//! (b) ROOT
//! (c) GLOBAL
//! ```
//!
//! Observers (all-event handlers) share the buckets of type-specific handlers
//! and are merged with them by registration order.
//!
//! Resolution clones `Arc` handlers out of the maps, so no shard lock is held
//! while a handler runs.

use std::any::TypeId;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use super::handler::{ErasedCommandHandler, ErasedEventHandler, HandlerKind};
use super::message::SessionId;
use super::message_bus::{BusError, BusResult};

/// Key of an event handler bucket: one concrete event type, or every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    Type(TypeId),
    All,
}

#[derive(Clone)]
pub struct CommandRegistration {
    pub scope: SessionId,
    pub command_name: &'static str,
    pub kind: HandlerKind,
    pub order: u64,
    pub(crate) handler: ErasedCommandHandler,
}

#[derive(Clone)]
pub struct EventRegistration {
    pub scope: SessionId,
    pub event_name: &'static str,
    pub kind: HandlerKind,
    pub order: u64,
    pub(crate) handler: ErasedEventHandler,
}

impl std::fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistration")
            .field("scope", &self.scope)
            .field("event_name", &self.event_name)
            .field("kind", &self.kind)
            .field("order", &self.order)
            .finish()
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    commands: DashMap<SessionId, HashMap<TypeId, CommandRegistration>>,
    events: DashMap<SessionId, HashMap<EventKey, Vec<EventRegistration>>>,
    next_order: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_order(&self) -> u64 {
        self.next_order.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register_command(
        &self,
        scope: &SessionId,
        type_id: TypeId,
        command_name: &'static str,
        kind: HandlerKind,
        handler: ErasedCommandHandler,
    ) -> BusResult<()> {
        let order = self.next_order();
        let mut bucket = self.commands.entry(scope.clone()).or_default();
        match bucket.entry(type_id) {
            Entry::Occupied(_) => Err(BusError::DuplicateHandler {
                command: command_name,
                scope: scope.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(CommandRegistration {
                    scope: scope.clone(),
                    command_name,
                    kind,
                    order,
                    handler,
                });
                debug!("Registered {:?} command handler for {} in {}", kind, command_name, scope);
                Ok(())
            }
        }
    }

    pub(crate) fn unregister_command(
        &self,
        scope: &SessionId,
        type_id: TypeId,
        command_name: &'static str,
    ) -> BusResult<()> {
        let removed = self
            .commands
            .get_mut(scope)
            .and_then(|mut bucket| bucket.remove(&type_id));
        match removed {
            Some(_) => {
                debug!("Unregistered command handler for {} in {}", command_name, scope);
                Ok(())
            }
            None => Err(BusError::NotFound {
                kind: "command",
                name: command_name,
                scope: scope.clone(),
            }),
        }
    }

    pub(crate) fn register_event(
        &self,
        scope: &SessionId,
        key: EventKey,
        event_name: &'static str,
        kind: HandlerKind,
        handler: ErasedEventHandler,
    ) {
        let order = self.next_order();
        self.events
            .entry(scope.clone())
            .or_default()
            .entry(key)
            .or_default()
            .push(EventRegistration {
                scope: scope.clone(),
                event_name,
                kind,
                order,
                handler,
            });
        debug!("Registered {:?} event handler for {} in {}", kind, event_name, scope);
    }

    /// Removes every handler of `key` in `scope`.
    pub(crate) fn unregister_all_for_type(
        &self,
        scope: &SessionId,
        key: EventKey,
        event_name: &'static str,
    ) -> BusResult<usize> {
        let removed = self
            .events
            .get_mut(scope)
            .and_then(|mut bucket| bucket.remove(&key))
            .map(|handlers| handlers.len())
            .unwrap_or(0);
        if removed == 0 {
            return Err(BusError::NotFound {
                kind: "event",
                name: event_name,
                scope: scope.clone(),
            });
        }
        debug!("Unregistered {} event handlers for {} in {}", removed, event_name, scope);
        Ok(removed)
    }

    /// Drops every command and event handler of `scope`. Never fails.
    pub(crate) fn unregister_session(&self, scope: &SessionId) -> (usize, usize) {
        let commands = self
            .commands
            .remove(scope)
            .map(|(_, bucket)| bucket.len())
            .unwrap_or(0);
        let events = self
            .events
            .remove(scope)
            .map(|(_, bucket)| bucket.values().map(Vec::len).sum())
            .unwrap_or(0);
        debug!(
            "Unregistered session {}: {} command handlers, {} event handlers",
            scope, commands, events
        );
        (commands, events)
    }

    pub(crate) fn resolve_command_handler(
        &self,
        scope: &SessionId,
        type_id: TypeId,
        command_name: &'static str,
    ) -> BusResult<ErasedCommandHandler> {
        self.commands
            .get(scope)
            .and_then(|bucket| bucket.get(&type_id).map(|r| r.handler.clone()))
            .ok_or_else(|| BusError::NoHandler {
                command: command_name,
                scope: scope.clone(),
            })
    }

    /// Handlers for an event of `type_id` published in `scope`.
    pub fn resolve_event_handlers(&self, scope: &SessionId, type_id: TypeId) -> Vec<EventRegistration> {
        let mut resolved = Vec::new();
        if !scope.is_root() && !scope.is_global() {
            self.collect_bucket(scope, type_id, &mut resolved);
        }
        self.collect_bucket(&SessionId::root(), type_id, &mut resolved);
        self.collect_bucket(&SessionId::global(), type_id, &mut resolved);
        resolved
    }

    fn collect_bucket(&self, scope: &SessionId, type_id: TypeId, out: &mut Vec<EventRegistration>) {
        let Some(bucket) = self.events.get(scope) else {
            return;
        };
        let start = out.len();
        for key in [EventKey::Type(type_id), EventKey::All] {
            if let Some(handlers) = bucket.get(&key) {
                out.extend(handlers.iter().cloned());
            }
        }
        out[start..].sort_by_key(|registration| registration.order);
    }

    pub fn command_handler_count(&self, scope: &SessionId) -> usize {
        self.commands.get(scope).map(|bucket| bucket.len()).unwrap_or(0)
    }

    pub fn event_handler_count(&self, scope: &SessionId) -> usize {
        self.events
            .get(scope)
            .map(|bucket| bucket.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Scopes that currently hold at least one handler.
    pub fn scopes(&self) -> Vec<SessionId> {
        let mut scopes: Vec<SessionId> = self
            .commands
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .chain(
                self.events
                    .iter()
                    .filter(|entry| entry.value().values().any(|handlers| !handlers.is_empty()))
                    .map(|entry| entry.key().clone()),
            )
            .collect();
        scopes.sort();
        scopes.dedup();
        scopes
    }

    pub fn clear(&self) {
        self.commands.clear();
        self.events.clear();
    }
}

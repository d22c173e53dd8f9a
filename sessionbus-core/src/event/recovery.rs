//! Crash recovery for scheduled events.
//!
//! Scheduled events that are still pending when the process goes down are
//! written to an [`EventStore`] and restored into the scheduled queue on the
//! next start.
//!
//! ```text
//! startup:   store.load_unfinished_events() ─► registry.reconstruct ─► queue.offer
//! shutdown:  bus.pending_scheduled_events() ─► to_record ─► store.save_unfinished_events
//! ```
//!
//! [`CrashRecovery::flush`] may be called from any of the shutdown paths
//! (explicit call, Ctrl-C, panic hook) and any number of times. Each event is
//! written once.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;

use tracing::{debug, error, info, warn};

use crate::storage::EventStore;

use super::handler::in_handler_scope;
use super::message_bus::{BusResult, MessageBus};
use super::scheduled::{ScheduledEventRecord, ScheduledEventRegistry};

pub struct CrashRecovery {
    bus: Arc<MessageBus>,
    store: Arc<dyn EventStore>,
    registry: ScheduledEventRegistry,
    // Ids of events already written to the store. Held for the whole flush.
    saved: Arc<Mutex<HashSet<String>>>,
}

impl CrashRecovery {
    pub fn new(bus: Arc<MessageBus>, store: Arc<dyn EventStore>, registry: ScheduledEventRegistry) -> Self {
        Self {
            bus,
            store,
            registry,
            saved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Loads persisted events into the scheduled queue. Records of unknown
    /// types or with malformed payloads are skipped.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn restore(&self) -> BusResult<usize> {
        let records = self.store.load_unfinished_events().await?;
        let total = records.len();
        let mut restored = 0;

        for record in records {
            let type_name = record.type_name.clone();
            let event_id = record.event_id.clone();
            let event = match self.registry.reconstruct(record) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping persisted event {} ({}): {}", event_id, type_name, e);
                    continue;
                }
            };
            match self.bus.scheduled().offer(event) {
                Ok(due) => {
                    debug!("Restored {} ({}) due at {}", type_name, event_id, due);
                    restored += 1;
                }
                Err(e) => warn!("Skipping persisted event {} ({}): {}", event_id, type_name, e),
            }
        }

        info!("Restored {} of {} persisted scheduled events", restored, total);
        Ok(restored)
    }

    /// Saves every pending scheduled event not saved by an earlier call and
    /// returns how many were written.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn flush(&self) -> BusResult<usize> {
        let mut saved = self.saved.lock().await;
        self.persist_unsaved(&mut saved).await
    }

    async fn persist_unsaved(&self, saved: &mut HashSet<String>) -> BusResult<usize> {
        let records: Vec<ScheduledEventRecord> = self
            .bus
            .pending_scheduled_events()
            .iter()
            .filter(|event| !saved.contains(&event.meta().id))
            .filter_map(|event| {
                let scheduled = event.as_scheduled()?;
                scheduled
                    .to_record()
                    .inspect_err(|e| error!("Cannot persist {} ({}): {}", event.name(), event.meta().id, e))
                    .ok()
            })
            .collect();

        if records.is_empty() {
            debug!("No unsaved scheduled events to flush");
            return Ok(0);
        }

        self.store.save_unfinished_events(&records).await?;
        saved.extend(records.iter().map(|record| record.event_id.clone()));
        info!("Flushed {} pending scheduled events", records.len());
        Ok(records.len())
    }

    /// Number of events written to the store by this instance.
    pub async fn saved_count(&self) -> usize {
        self.saved.lock().await.len()
    }

    /// Installs a process-wide panic hook that flushes before the previous
    /// hook runs. Panics caught inside bus handlers do not trigger a flush.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let recovery: Weak<Self> = Arc::downgrade(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !in_handler_scope() {
                if let Some(recovery) = recovery.upgrade() {
                    recovery.flush_blocking();
                }
            }
            previous(info);
        }));
    }

    // The panicking thread may be inside a runtime, so the flush runs on a
    // separate thread with its own current-thread runtime. A flush already in
    // progress is not waited for.
    fn flush_blocking(self: &Arc<Self>) {
        let Ok(mut saved) = Arc::clone(&self.saved).try_lock_owned() else {
            warn!("Flush already in progress, skipping flush on panic");
            return;
        };
        let recovery = Arc::clone(self);
        let worker = std::thread::spawn(move || {
            match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => {
                    if let Err(e) = runtime.block_on(recovery.persist_unsaved(&mut saved)) {
                        error!("Flush on panic failed: {}", e);
                    }
                }
                Err(e) => error!("Cannot build runtime for flush on panic: {}", e),
            }
        });
        if worker.join().is_err() {
            error!("Flush on panic panicked");
        }
    }

    /// Waits for Ctrl-C, then flushes.
    pub async fn wait_for_shutdown_signal(&self) -> BusResult<usize> {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
        self.flush().await
    }
}

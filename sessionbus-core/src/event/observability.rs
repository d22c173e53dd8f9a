//! Observability events and observers.
//!
//! With `lifecycle_events` enabled the bus publishes [`CommandStarted`] and
//! [`CommandCompleted`] around every executed command. Observers registered
//! through [`MessageBus::register_observability_handler`] see these together
//! with every other event.
//!
//! [`MessageBus::register_observability_handler`]: super::message_bus::MessageBus::register_observability_handler

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{Level, debug};

use crate::config::EventLogConfig;

use super::handler::{HandlerKind, Observer};
use super::message::{CommandResult, Event, HandlerResult, MessageMeta, event_ref};

#[derive(Debug, Clone)]
pub struct CommandStarted {
    pub meta: MessageMeta,
    pub command_id: String,
    pub command_name: &'static str,
}

impl CommandStarted {
    pub fn new(command: &MessageMeta, command_name: &'static str) -> Self {
        Self {
            meta: MessageMeta::in_session(command.session_id.clone()),
            command_id: command.id.clone(),
            command_name,
        }
    }
}

impl Event for CommandStarted {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }
}

#[derive(Debug, Clone)]
pub struct CommandCompleted {
    pub meta: MessageMeta,
    pub command_id: String,
    pub command_name: &'static str,
    pub success: bool,
    pub error: Option<String>,
    pub execution_time_ms: f64,
}

impl CommandCompleted {
    pub fn new(
        command: &MessageMeta,
        command_name: &'static str,
        result: &CommandResult,
        execution_time_ms: f64,
    ) -> Self {
        Self {
            meta: MessageMeta::in_session(command.session_id.clone()),
            command_id: command.id.clone(),
            command_name,
            success: result.success,
            error: result.error.clone(),
            execution_time_ms,
        }
    }
}

impl Event for CommandCompleted {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }
}

/// Writes every event to the `tracing` subscriber.
pub struct TracingObserver {
    level: Level,
}

impl TracingObserver {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

macro_rules! log_event {
    ($level:expr, $event:expr) => {
        match $level {
            Level::ERROR => tracing::error!(event = $event.name(), id = %$event.meta().id, session_id = %$event.meta().session_id, "{:?}", $event),
            Level::WARN => tracing::warn!(event = $event.name(), id = %$event.meta().id, session_id = %$event.meta().session_id, "{:?}", $event),
            Level::INFO => tracing::info!(event = $event.name(), id = %$event.meta().id, session_id = %$event.meta().session_id, "{:?}", $event),
            Level::DEBUG => tracing::debug!(event = $event.name(), id = %$event.meta().id, session_id = %$event.meta().session_id, "{:?}", $event),
            _ => tracing::trace!(event = $event.name(), id = %$event.meta().id, session_id = %$event.meta().session_id, "{:?}", $event),
        }
    };
}

#[async_trait]
impl Observer for TracingObserver {
    async fn observe(&self, event: Arc<dyn Event>) -> HandlerResult<()> {
        log_event!(self.level, event);
        Ok(())
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Sync
    }
}

#[derive(Debug, Clone, Default)]
struct CommandMetrics {
    completed: usize,
    failed: usize,
    total_time_ms: f64,
}

#[derive(Debug, Default)]
struct MetricsStore {
    events_by_type: HashMap<String, usize>,
    commands: HashMap<String, CommandMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub total_events: usize,
    pub events_by_type: HashMap<String, usize>,
    pub commands_completed: usize,
    pub commands_failed: usize,
    pub average_execution_time: Duration,
}

/// Counts events per type and aggregates command execution times.
#[derive(Default)]
pub struct MetricsObserver {
    store: Mutex<MetricsStore>,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, MetricsStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: &dyn Event) {
        let mut store = self.store();
        *store
            .events_by_type
            .entry(event.name().to_string())
            .or_default() += 1;

        if let Some(completed) = event_ref::<CommandCompleted>(event) {
            let metrics = store
                .commands
                .entry(completed.command_name.to_string())
                .or_default();
            metrics.completed += 1;
            if !completed.success {
                metrics.failed += 1;
            }
            metrics.total_time_ms += completed.execution_time_ms;
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let store = self.store();
        let commands_completed: usize = store.commands.values().map(|m| m.completed).sum();
        let total_time_ms: f64 = store.commands.values().map(|m| m.total_time_ms).sum();
        let average_execution_time = if commands_completed == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(total_time_ms / commands_completed as f64 / 1000.0)
        };

        MetricsSummary {
            total_events: store.events_by_type.values().sum(),
            events_by_type: store.events_by_type.clone(),
            commands_completed,
            commands_failed: store.commands.values().map(|m| m.failed).sum(),
            average_execution_time,
        }
    }

    pub fn reset(&self) {
        let mut store = self.store();
        store.events_by_type.clear();
        store.commands.clear();
    }
}

#[async_trait]
impl Observer for MetricsObserver {
    async fn observe(&self, event: Arc<dyn Event>) -> HandlerResult<()> {
        self.record(event.as_ref());
        Ok(())
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Sync
    }
}

#[derive(Serialize)]
struct EventLogEntry<'a> {
    event_type: &'static str,
    #[serde(flatten)]
    meta: &'a MessageMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled_time: Option<DateTime<Utc>>,
    data: String,
    logged_at: DateTime<Utc>,
}

/// Appends every event to a JSON Lines file, one object per line.
///
/// The file and its directory are created on the first event. Writes are
/// serialized, so lines never interleave.
pub struct FileEventObserver {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<File>>,
}

impl FileEventObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    /// Logs to `events_<timestamp>.jsonl` under the configured directory.
    pub fn from_config(config: &EventLogConfig) -> Self {
        let file_name = format!("events_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
        Self::new(config.directory.join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> std::io::Result<File> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        debug!("Writing event log to {}", self.path.display());
        OpenOptions::new().create(true).append(true).open(&self.path).await
    }
}

#[async_trait]
impl Observer for FileEventObserver {
    async fn observe(&self, event: Arc<dyn Event>) -> HandlerResult<()> {
        let entry = EventLogEntry {
            event_type: event.name(),
            meta: event.meta(),
            scheduled_time: event.as_scheduled().map(|scheduled| scheduled.delivery_time()),
            data: format!("{:?}", event),
            logged_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if file.is_none() {
            *file = Some(self.open().await?);
        }
        if let Some(file) = file.as_mut() {
            file.write_all(&line).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

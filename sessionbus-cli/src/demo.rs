//! A scripted session that exercises the bus end to end.
//!
//! ```text
//! restore ─► start ─► session { greet command ─► Greeted event
//!                               schedule Reminder
//!                               approval request }
//!         ─► wait for reminders (Ctrl-C flushes) ─► flush leftovers ─► stop
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sessionbus_core::config::BusConfig;
use sessionbus_core::storage::local_fs::LocalFileEventStore;
use sessionbus_core::{
    ApprovalCommand, ApprovalResult, AsyncHandler, BusError, Command, CommandResult, CrashRecovery,
    Event, FileEventObserver, HandlerFailure, HandlerResult, MessageBus, MessageMeta, MetricsObserver, MetricsSummary,
    PersistentEvent, ScheduledEventRegistry, SyncHandler, TracingObserver,
};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Greet {
    pub meta: MessageMeta,
    pub name: String,
}

impl Command for Greet {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut MessageMeta {
        &mut self.meta
    }
}

#[derive(Debug, Clone)]
pub struct Greeted {
    pub meta: MessageMeta,
    pub message: String,
}

impl Event for Greeted {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }
}

/// Scheduled reminder that survives restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct Reminder {
    pub meta: MessageMeta,
    pub due: DateTime<Utc>,
    pub note: String,
}

#[derive(Serialize, Deserialize)]
struct ReminderPayload {
    note: String,
}

impl Event for Reminder {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }

    fn as_scheduled(&self) -> Option<&dyn sessionbus_core::Scheduled> {
        Some(self)
    }
}

impl PersistentEvent for Reminder {
    const TYPE_NAME: &'static str = "Reminder";

    fn scheduled_time(&self) -> DateTime<Utc> {
        self.due
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(ReminderPayload {
            note: self.note.clone(),
        })
    }

    fn from_parts(
        meta: MessageMeta,
        scheduled_time: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        let payload: ReminderPayload = serde_json::from_value(payload)?;
        Ok(Self {
            meta,
            due: scheduled_time,
            note: payload.note,
        })
    }
}

/// Event types the CLI knows how to rebuild from the store.
pub fn event_registry() -> ScheduledEventRegistry {
    let mut registry = ScheduledEventRegistry::default();
    registry.register::<Reminder>();
    registry
}

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub name: String,
    pub schedule: Duration,
    pub approval_timeout: Duration,
    /// How long to wait for scheduled reminders before flushing them.
    pub wait: Duration,
}

/// Output produced by event handlers, in delivery order.
#[derive(Debug, Clone, Default)]
struct Transcript(Arc<Mutex<Vec<String>>>);

impl Transcript {
    fn push(&self, line: String) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(line);
    }

    fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Debug)]
pub struct DemoReport {
    pub restored: usize,
    pub greeting: CommandResult,
    pub approval: ApprovalResult,
    /// Event-triggered output, in delivery order.
    pub delivered: Vec<String>,
    pub flushed: usize,
    pub metrics: MetricsSummary,
    /// JSON Lines file every event was written to, when enabled.
    pub event_log: Option<PathBuf>,
}

pub async fn run_demo(config: BusConfig, options: DemoOptions) -> Result<DemoReport, sessionbus_core::Error> {
    let bus = Arc::new(MessageBus::new(config.clone()));
    let store = Arc::new(LocalFileEventStore::from_config(&config.store));
    let recovery = Arc::new(CrashRecovery::new(Arc::clone(&bus), store, event_registry()));

    let restored = recovery.restore().await?;
    recovery.install_panic_hook();
    bus.start().await;

    let metrics = Arc::new(MetricsObserver::new());
    bus.register_observability_handler(Arc::clone(&metrics));
    bus.register_observability_handler(TracingObserver::default());
    let event_log = if config.event_log.enabled {
        let observer = FileEventObserver::from_config(&config.event_log);
        let path = observer.path().to_path_buf();
        bus.register_observability_handler(observer);
        info!("Logging events to {}", path.display());
        Some(path)
    } else {
        None
    };

    let delivered = Transcript::default();
    let reminders = delivered.clone();
    bus.register_event_handler::<Reminder, _>(SyncHandler(move |e: &Reminder| -> HandlerResult<()> {
        reminders.push(format!("Reminder: {}", e.note));
        Ok(())
    }));

    let (greeting, approval) = bus
        .with_session(|session| {
            let delivered = delivered.clone();
            let options = options.clone();
            async move {
                let greeted = delivered.clone();
                let publisher = Arc::clone(session.bus());
                session
                    .register_event_handler::<Greeted, _>(SyncHandler(move |e: &Greeted| -> HandlerResult<()> {
                        greeted.push(e.message.clone());
                        Ok(())
                    }))?
                    .register_command_handler::<Greet, _>(AsyncHandler(move |command: Greet| {
                        let bus = Arc::clone(&publisher);
                        async move {
                            let message = format!("Hello, {}!", command.name);
                            bus.publish(Greeted {
                                meta: MessageMeta::in_session(command.meta.session_id.clone()),
                                message: message.clone(),
                            })
                            .await?;
                            // The greeting must be visible before the command reports back.
                            bus.ensure_events_processed().await;
                            Ok::<_, HandlerFailure>(CommandResult::success(message))
                        }
                    }))?;

                let greeting = session
                    .execute_with_session(Greet {
                        meta: MessageMeta::new(),
                        name: options.name.clone(),
                    })
                    .await?;

                let due = chrono::Duration::from_std(options.schedule)
                    .ok()
                    .and_then(|delay| Utc::now().checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                session
                    .bus()
                    .publish(Reminder {
                        meta: MessageMeta::in_session(session.id().clone()),
                        due,
                        note: format!("follow up with {}", options.name),
                    })
                    .await?;
                info!("Reminder scheduled for {}", due);

                let approval = session
                    .bus()
                    .execute_approval(
                        ApprovalCommand::new()
                            .approver("cli")
                            .session(session.id().clone())
                            .expires_in(options.approval_timeout)
                            .request(serde_json::json!({ "action": "send_summary" })),
                        AsyncHandler(|command: ApprovalCommand| async move {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok::<_, HandlerFailure>(ApprovalResult::approved().with_result(command.request))
                        }),
                    )
                    .await;

                Ok::<_, BusError>((greeting, approval))
            }
        })
        .await?;

    let mut flushed = 0;
    tokio::select! {
        _ = wait_for_reminders(&bus, options.wait) => {}
        result = recovery.wait_for_shutdown_signal() => {
            flushed += result?;
        }
    }

    // Anything not yet due goes to the store for the next run.
    flushed += recovery.flush().await?;
    bus.ensure_events_processed().await;
    bus.stop().await;

    Ok(DemoReport {
        restored,
        greeting,
        approval,
        delivered: delivered.lines(),
        flushed,
        metrics: metrics.summary(),
        event_log,
    })
}

async fn wait_for_reminders(bus: &MessageBus, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    let tick = bus.config().tick_interval;
    while !bus.scheduled().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(tick).await;
    }
    bus.ensure_events_processed().await;
    if !bus.scheduled().is_empty() {
        warn!("{} scheduled events still pending", bus.scheduled().len());
    }
}

use std::sync::Arc;

use pretty_assertions::assert_eq;
use sessionbus_core::testing::{Recorder, fast_config};
use sessionbus_core::{
    CommandCompleted, CommandResult, CommandStarted, Event, HandlerFailure, HandlerResult,
    MessageBus, MetricsObserver, SyncHandler, TracingObserver,
};

use crate::common::{TestCommand, TestEvent};

async fn lifecycle_bus() -> Arc<MessageBus> {
    let mut config = fast_config();
    config.lifecycle_events = true;
    let bus = Arc::new(MessageBus::new(config));
    bus.start().await;
    bus
}

#[tokio::test]
async fn test_lifecycle_events_wrap_command() {
    let bus = lifecycle_bus().await;
    let recorder = Recorder::new();
    let observed = recorder.clone();
    bus.register_observability_handler(SyncHandler(move |event: &dyn Event| -> HandlerResult<()> {
        observed.record(event.name());
        Ok(())
    }));
    bus.register_command_handler::<TestCommand, _>(SyncHandler(
        |command: TestCommand| -> HandlerResult<CommandResult> {
            Ok(CommandResult::success(command.payload))
        },
    ))
    .unwrap();

    let result = bus.execute(TestCommand::new("a")).await.unwrap();
    assert!(result.success);
    assert!(result.metadata.contains_key("execution_time_ms"));
    bus.ensure_events_processed().await;

    assert_eq!(recorder.entries(), vec!["CommandStarted", "CommandCompleted"]);
    bus.stop().await;
}

#[tokio::test]
async fn test_metrics_observer_counts_events_and_commands() {
    let bus = lifecycle_bus().await;
    let metrics = Arc::new(MetricsObserver::new());
    bus.register_observability_handler(Arc::clone(&metrics));
    bus.register_observability_handler(TracingObserver::default());

    let failures = Recorder::new();
    let completed = failures.clone();
    bus.register_event_handler::<CommandCompleted, _>(SyncHandler(move |e: &CommandCompleted| -> HandlerResult<()> {
        if !e.success {
            completed.record(e.error.clone().unwrap_or_default());
        }
        Ok(())
    }));
    bus.register_event_handler::<CommandStarted, _>(SyncHandler(|_: &CommandStarted| -> HandlerResult<()> { Ok(()) }));
    bus.register_command_handler::<TestCommand, _>(SyncHandler(
        |command: TestCommand| -> HandlerResult<CommandResult> {
            if command.payload == "bad" {
                return Err(HandlerFailure::msg("rejected"));
            }
            Ok(CommandResult::ok())
        },
    ))
    .unwrap();

    bus.execute(TestCommand::new("good")).await.unwrap();
    bus.execute(TestCommand::new("bad")).await.unwrap();
    bus.publish(TestEvent::new("plain")).await.unwrap();
    bus.ensure_events_processed().await;

    let summary = metrics.summary();
    assert_eq!(summary.total_events, 5);
    assert_eq!(summary.events_by_type.get("CommandStarted"), Some(&2));
    assert_eq!(summary.events_by_type.get("CommandCompleted"), Some(&2));
    assert_eq!(summary.events_by_type.get("TestEvent"), Some(&1));
    assert_eq!(summary.commands_completed, 2);
    assert_eq!(summary.commands_failed, 1);
    assert_eq!(failures.entries(), vec!["Error: rejected"]);
    bus.stop().await;
}

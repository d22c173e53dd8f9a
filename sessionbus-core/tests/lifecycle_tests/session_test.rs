use pretty_assertions::assert_eq;
use sessionbus_core::testing::{Recorder, started_bus};
use sessionbus_core::{
    BusError, CommandResult, HandlerResult, SessionEnded, SessionId, SessionStarted, SyncHandler,
};

use crate::common::{TestCommand, TestEvent};

#[tokio::test]
async fn test_session_teardown_removes_every_registration() {
    let bus = started_bus().await;
    let recorder = Recorder::new();
    let root = recorder.clone();
    bus.register_event_handler::<TestEvent, _>(SyncHandler(move |e: &TestEvent| -> HandlerResult<()> {
        root.record(format!("root:{}", e.label));
        Ok(())
    }));

    let session = bus.create_session(Some(SessionId::from("SESSION_1"))).await.unwrap();
    let scoped = recorder.clone();
    session
        .register_command_handler::<TestCommand, _>(SyncHandler(
            |_: TestCommand| -> HandlerResult<CommandResult> { Ok(CommandResult::ok()) },
        ))
        .unwrap()
        .register_event_handler::<TestEvent, _>(SyncHandler(move |e: &TestEvent| -> HandlerResult<()> {
            scoped.record(format!("session:{}", e.label));
            Ok(())
        }))
        .unwrap();

    bus.publish(TestEvent::in_session("before", "SESSION_1")).await.unwrap();
    let result = session.execute_with_session(TestCommand::new("x")).await.unwrap();
    assert!(result.success);
    bus.ensure_events_processed().await;

    session.close(None);
    assert_eq!(bus.registry().command_handler_count(session.id()), 0);
    assert_eq!(bus.registry().event_handler_count(session.id()), 0);

    bus.publish(TestEvent::in_session("after", "SESSION_1")).await.unwrap();
    bus.ensure_events_processed().await;
    let err = bus
        .execute(TestCommand::new("y").in_session("SESSION_1"))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NoHandler { .. }));

    assert_eq!(
        recorder.entries(),
        vec!["session:before", "root:before", "root:after"]
    );

    let err = session
        .register_event_handler::<TestEvent, _>(SyncHandler(|_: &TestEvent| -> HandlerResult<()> { Ok(()) }))
        .unwrap_err();
    assert!(matches!(err, BusError::InactiveSession { .. }));
    bus.stop().await;
}

#[tokio::test]
async fn test_with_session_forwards_error_to_end_event() {
    let bus = started_bus().await;
    let recorder = Recorder::new();
    let started = recorder.clone();
    let ended = recorder.clone();
    bus.register_event_handler::<SessionStarted, _>(SyncHandler(move |_: &SessionStarted| -> HandlerResult<()> {
        started.record("started");
        Ok(())
    }));
    bus.register_event_handler::<SessionEnded, _>(SyncHandler(move |e: &SessionEnded| -> HandlerResult<()> {
        ended.record(format!("ended:{}", e.error.clone().unwrap_or_default()));
        Ok(())
    }));

    let ok: Result<u32, BusError> = bus.with_session(|_session| async move { Ok(7) }).await;
    assert_eq!(ok.unwrap(), 7);

    let failed: Result<(), BusError> = bus
        .with_session(|session| async move {
            session.execute_with_session(TestCommand::new("nobody listens")).await?;
            Ok(())
        })
        .await;
    assert!(matches!(failed, Err(BusError::NoHandler { .. })));
    bus.ensure_events_processed().await;

    let entries = recorder.entries();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0], "started");
    assert_eq!(entries[1], "ended:");
    assert_eq!(entries[2], "started");
    assert!(entries[3].starts_with("ended:No handler registered for command TestCommand"));
    bus.stop().await;
}

#[tokio::test]
async fn test_create_session_requires_running_bus() {
    let bus = started_bus().await;
    bus.stop().await;
    let err = bus.create_session(None).await.unwrap_err();
    assert!(matches!(err, BusError::NotRunning));
}

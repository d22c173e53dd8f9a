use pretty_assertions::assert_eq;
use sessionbus_core::testing::started_bus;
use sessionbus_core::{
    AsyncHandler, BusError, CommandResult, HandlerFailure, HandlerResult, SessionId, SyncHandler,
};

use crate::common::{AnotherTestCommand, TestCommand};

#[tokio::test]
async fn test_duplicate_and_missing_registrations() {
    let bus = started_bus().await;
    let handler = || SyncHandler(|_: TestCommand| -> HandlerResult<CommandResult> { Ok(CommandResult::ok()) });

    bus.register_command_handler::<TestCommand, _>(handler()).unwrap();
    let err = bus.register_command_handler::<TestCommand, _>(handler()).unwrap_err();
    assert!(matches!(err, BusError::DuplicateHandler { command: "TestCommand", .. }));

    // The same type may be bound once per scope.
    bus.register_command_handler_in_scope::<TestCommand, _>(SessionId::from("SESSION_1"), handler())
        .unwrap();

    bus.unregister_command_handler::<TestCommand>().unwrap();
    let err = bus.unregister_command_handler::<TestCommand>().unwrap_err();
    assert!(matches!(err, BusError::NotFound { .. }));

    // Rebinding after unregistering is allowed.
    bus.register_command_handler::<TestCommand, _>(handler()).unwrap();
    bus.stop().await;
}

#[tokio::test]
async fn test_execute_without_handler_names_type_and_scope() {
    let bus = started_bus().await;
    bus.register_command_handler::<TestCommand, _>(SyncHandler(
        |_: TestCommand| -> HandlerResult<CommandResult> { Ok(CommandResult::ok()) },
    ))
    .unwrap();

    let err = bus.execute(AnotherTestCommand::new()).await.unwrap_err();
    match &err {
        BusError::NoHandler { command, scope } => {
            assert_eq!(*command, "AnotherTestCommand");
            assert_eq!(scope, &SessionId::root());
        }
        other => panic!("unexpected error: {other}"),
    }
    let message = err.to_string();
    assert!(message.contains("AnotherTestCommand"));
    assert!(message.contains("ROOT"));
    bus.stop().await;
}

#[tokio::test]
async fn test_handler_error_becomes_failed_result() {
    let bus = started_bus().await;
    bus.register_command_handler::<TestCommand, _>(SyncHandler(
        |_: TestCommand| -> HandlerResult<CommandResult> {
            Err(HandlerFailure::new("Exception", "Test failure"))
        },
    ))
    .unwrap();

    let command = TestCommand::new("x");
    let id = command.meta.id.clone();
    let result = bus.execute(command).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Exception: Test failure"));
    assert_eq!(result.command_id.as_deref(), Some(id.as_str()));
    bus.stop().await;
}

#[tokio::test]
async fn test_handler_panic_becomes_failed_result() {
    let bus = started_bus().await;
    bus.register_command_handler::<TestCommand, _>(AsyncHandler(|command: TestCommand| async move {
        if command.payload == "explode" {
            panic!("handler exploded");
        }
        Ok::<_, HandlerFailure>(CommandResult::ok())
    }))
    .unwrap();

    let result = bus.execute(TestCommand::new("explode")).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Panic: handler exploded"));

    // The bus keeps serving after a panic.
    let result = bus.execute(TestCommand::new("fine")).await.unwrap();
    assert!(result.success);
    bus.stop().await;
}

#[tokio::test]
async fn test_execute_resolves_in_command_session() {
    let bus = started_bus().await;
    bus.register_command_handler::<TestCommand, _>(SyncHandler(
        |_: TestCommand| -> HandlerResult<CommandResult> { Ok(CommandResult::success("root")) },
    ))
    .unwrap();
    bus.register_command_handler_in_scope::<TestCommand, _>(
        SessionId::from("SESSION_1"),
        SyncHandler(|command: TestCommand| -> HandlerResult<CommandResult> {
            Ok(CommandResult::success(format!("session:{}", command.payload)))
        }),
    )
    .unwrap();

    let result = bus
        .execute(TestCommand::new("a").in_session("SESSION_1"))
        .await
        .unwrap();
    assert_eq!(result.result, Some(serde_json::json!("session:a")));
    assert_eq!(result.session_id, SessionId::from("SESSION_1"));

    let result = bus.execute(TestCommand::new("b")).await.unwrap();
    assert_eq!(result.result, Some(serde_json::json!("root")));

    let err = bus
        .execute(TestCommand::new("c").in_session("SESSION_2"))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NoHandler { .. }));
    bus.stop().await;
}

use std::time::{Duration, Instant};

use chrono::Utc;
use pretty_assertions::assert_eq;
use sessionbus_core::testing::{Recorder, started_bus};
use sessionbus_core::{
    ApprovalCommand, ApprovalExpired, ApprovalGranted, ApprovalResult, ApprovalStatus, AsyncHandler,
    HandlerFailure, HandlerResult, SyncHandler,
};

#[tokio::test]
async fn test_past_expiry_returns_without_waiting_for_handler() {
    let bus = started_bus().await;
    let recorder = Recorder::new();
    let expired = recorder.clone();
    bus.register_event_handler::<ApprovalExpired, _>(SyncHandler(move |e: &ApprovalExpired| -> HandlerResult<()> {
        expired.record(e.approval_id.clone());
        Ok(())
    }));

    let command = ApprovalCommand::new()
        .approver("ops")
        .expires_at(Utc::now() - chrono::Duration::seconds(1));
    let id = command.meta.id.clone();
    let command = command.clone().on_expiry(ApprovalExpired::for_request(&command));

    let started = Instant::now();
    let result = bus
        .execute_approval(
            command,
            AsyncHandler(|_: ApprovalCommand| async {
                std::future::pending::<()>().await;
                Ok::<_, HandlerFailure>(ApprovalResult::approved())
            }),
        )
        .await;
    assert!(started.elapsed() < bus.config().approval.poll_interval * 2);

    assert_eq!(result.status, ApprovalStatus::Expired);
    assert!(!result.success);
    assert_eq!(result.command_id.as_deref(), Some(id.as_str()));

    bus.ensure_events_processed().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.ensure_events_processed().await;
    assert_eq!(recorder.entries(), vec![id]);
    bus.stop().await;
}

#[tokio::test]
async fn test_slow_approval_expires_mid_flight() {
    let bus = started_bus().await;
    let command = ApprovalCommand::new().expires_in(Duration::from_millis(100));

    let result = bus
        .execute_approval(
            command,
            AsyncHandler(|_: ApprovalCommand| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, HandlerFailure>(ApprovalResult::approved())
            }),
        )
        .await;

    assert_eq!(result.status, ApprovalStatus::Expired);
    assert_eq!(result.error.as_deref(), Some("Approval request expired"));
    bus.stop().await;
}

#[tokio::test]
async fn test_approval_publishes_granted_callback() {
    let bus = started_bus().await;
    let recorder = Recorder::new();
    let granted = recorder.clone();
    bus.register_event_handler::<ApprovalGranted, _>(SyncHandler(move |e: &ApprovalGranted| -> HandlerResult<()> {
        granted.record(format!("granted:{}", e.approval_id));
        Ok(())
    }));

    let command = ApprovalCommand::new()
        .expires_in(Duration::from_secs(60))
        .request(serde_json::json!({"action": "deploy"}));
    let id = command.meta.id.clone();
    let command = command.clone().on_approval(ApprovalGranted::for_request(&command));

    let result = bus
        .execute_approval(
            command,
            SyncHandler(|command: ApprovalCommand| -> HandlerResult<ApprovalResult> {
                Ok(ApprovalResult::approved().with_result(command.request))
            }),
        )
        .await;
    bus.ensure_events_processed().await;

    assert_eq!(result.status, ApprovalStatus::Approved);
    assert!(result.success);
    assert_eq!(result.result, Some(serde_json::json!({"action": "deploy"})));
    assert_eq!(recorder.entries(), vec![format!("granted:{}", id)]);
    bus.stop().await;
}

#[tokio::test]
async fn test_handler_error_is_denied() {
    let bus = started_bus().await;
    let result = bus
        .execute_approval(
            ApprovalCommand::new(),
            SyncHandler(|_: ApprovalCommand| -> HandlerResult<ApprovalResult> {
                Err(HandlerFailure::new("Timeout", "approver unreachable"))
            }),
        )
        .await;

    assert_eq!(result.status, ApprovalStatus::Denied);
    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("Approval request failed: Timeout: approver unreachable")
    );
    bus.stop().await;
}

use std::sync::Arc;

use pretty_assertions::assert_eq;
use sessionbus_core::testing::{Recorder, started_bus};
use sessionbus_core::{BusError, HandlerFailure, HandlerResult, SessionId, SyncHandler};

use crate::common::TestEvent;

#[tokio::test]
async fn test_failing_handler_does_not_stop_siblings() {
    let bus = started_bus().await;
    let recorder = Recorder::new();
    let after = recorder.clone();

    bus.register_event_handler::<TestEvent, _>(SyncHandler(|_: &TestEvent| -> HandlerResult<()> {
        Err(HandlerFailure::new("ValueError", "bad payload"))
    }));
    bus.register_event_handler::<TestEvent, _>(SyncHandler(|_: &TestEvent| -> HandlerResult<()> {
        panic!("handler panicked")
    }));
    bus.register_event_handler::<TestEvent, _>(SyncHandler(move |e: &TestEvent| -> HandlerResult<()> {
        after.record(e.label.clone());
        Ok(())
    }));

    bus.publish(TestEvent::new("first")).await.unwrap();
    bus.publish(TestEvent::new("second")).await.unwrap();
    bus.ensure_events_processed().await;

    assert_eq!(recorder.entries(), vec!["first", "second"]);
    let errors = bus.event_handler_errors();
    assert_eq!(errors.len(), 4);
    assert_eq!(errors[0].failure.to_string(), "ValueError: bad payload");
    assert_eq!(errors[1].failure.kind, "Panic");
    assert_eq!(errors[0].event_name, "TestEvent");
    assert_eq!(errors[0].scope, SessionId::root());
    bus.stop().await;
}

#[tokio::test]
async fn test_unsuppressed_direct_dispatch_propagates() {
    let bus = started_bus().await;
    bus.register_event_handler::<TestEvent, _>(SyncHandler(|_: &TestEvent| -> HandlerResult<()> {
        Err(HandlerFailure::new("Exception", "Test failure"))
    }));

    // Suppressed by default: recorded, not returned.
    bus.dispatch_event(Arc::new(TestEvent::new("quiet"))).await.unwrap();
    assert_eq!(bus.event_handler_errors().len(), 1);

    bus.unsuppress_event_errors();
    let err = bus
        .dispatch_event(Arc::new(TestEvent::new("loud")))
        .await
        .unwrap_err();
    match err {
        BusError::HandlerFailure { event, failure, .. } => {
            assert_eq!(event, "TestEvent");
            assert_eq!(failure.to_string(), "Exception: Test failure");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(bus.event_handler_errors().len(), 1);

    // The queued path keeps isolating failures regardless of the flag.
    bus.publish(TestEvent::new("queued")).await.unwrap();
    bus.ensure_events_processed().await;
    assert_eq!(bus.event_handler_errors().len(), 2);

    bus.suppress_event_errors();
    bus.clear_event_handler_errors();
    assert!(bus.event_handler_errors().is_empty());
    bus.stop().await;
}

use std::sync::Arc;

use pretty_assertions::assert_eq;
use sessionbus_core::testing::{Recorder, started_bus};
use sessionbus_core::{AsyncHandler, Event, HandlerFailure, HandlerResult, SessionId, SyncHandler, event_ref};

use crate::common::TestEvent;

fn recording(
    recorder: Recorder,
    name: &'static str,
) -> SyncHandler<impl Fn(&TestEvent) -> HandlerResult<()> + Send + Sync + 'static> {
    SyncHandler(move |_: &TestEvent| -> HandlerResult<()> {
        recorder.record(name);
        Ok(())
    })
}

#[tokio::test]
async fn test_session_handlers_run_before_global() {
    let bus = started_bus().await;
    let recorder = Recorder::new();

    bus.register_event_handler_in_scope::<TestEvent, _>(SessionId::global(), recording(recorder.clone(), "h1"));
    bus.register_event_handler_in_scope::<TestEvent, _>(SessionId::from("SESSION_1"), recording(recorder.clone(), "h2"));
    bus.register_event_handler_in_scope::<TestEvent, _>(SessionId::from("SESSION_1"), recording(recorder.clone(), "h3"));

    bus.publish(TestEvent::in_session("e", "SESSION_1")).await.unwrap();
    bus.ensure_events_processed().await;

    assert_eq!(recorder.entries(), vec!["h2", "h3", "h1"]);
    bus.stop().await;
}

#[tokio::test]
async fn test_root_handlers_run_before_global() {
    let bus = started_bus().await;
    let recorder = Recorder::new();

    bus.register_event_handler_in_scope::<TestEvent, _>(SessionId::global(), recording(recorder.clone(), "h2"));
    bus.register_event_handler::<TestEvent, _>(recording(recorder.clone(), "h1"));

    bus.publish(TestEvent::in_session("e", "SESSION_1")).await.unwrap();
    bus.ensure_events_processed().await;

    assert_eq!(recorder.entries(), vec!["h1", "h2"]);
    bus.stop().await;
}

#[tokio::test]
async fn test_immediate_events_keep_publish_order() {
    let bus = started_bus().await;
    let recorder = Recorder::new();
    let seen = recorder.clone();
    bus.register_event_handler::<TestEvent, _>(AsyncHandler(move |event: Arc<TestEvent>| {
        let seen = seen.clone();
        async move {
            tokio::task::yield_now().await;
            seen.record(event.label.clone());
            Ok::<_, HandlerFailure>(())
        }
    }));

    for i in 0..20 {
        bus.publish(TestEvent::new(format!("e{i}"))).await.unwrap();
    }
    bus.ensure_events_processed().await;

    let expected: Vec<String> = (0..20).map(|i| format!("e{i}")).collect();
    assert_eq!(recorder.entries(), expected);
    bus.stop().await;
}

#[tokio::test]
async fn test_observer_sees_every_event() {
    let bus = started_bus().await;
    let recorder = Recorder::new();
    let observed = recorder.clone();
    bus.register_observability_handler(SyncHandler(move |event: &dyn Event| -> HandlerResult<()> {
        let label = event_ref::<TestEvent>(event)
            .map(|e| e.label.clone())
            .unwrap_or_else(|| event.name().to_string());
        observed.record(label);
        Ok(())
    }));

    bus.publish(TestEvent::new("root")).await.unwrap();
    bus.publish(TestEvent::in_session("scoped", "SESSION_9")).await.unwrap();
    bus.ensure_events_processed().await;

    assert_eq!(recorder.entries(), vec!["root", "scoped"]);
    bus.stop().await;
}

#[tokio::test]
async fn test_torn_down_scope_behaves_as_empty() {
    let bus = started_bus().await;
    let recorder = Recorder::new();
    bus.register_event_handler_in_scope::<TestEvent, _>(SessionId::from("SESSION_1"), recording(recorder.clone(), "session"));
    bus.register_event_handler::<TestEvent, _>(recording(recorder.clone(), "root"));

    bus.unregister_session_handlers(&SessionId::from("SESSION_1"));
    bus.publish(TestEvent::in_session("e", "SESSION_1")).await.unwrap();
    bus.ensure_events_processed().await;

    assert_eq!(recorder.entries(), vec!["root"]);
    assert_eq!(bus.registry().event_handler_count(&SessionId::from("SESSION_1")), 0);
    bus.stop().await;
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use pretty_assertions::assert_eq;
use sessionbus_core::testing::{Recorder, started_bus};
use sessionbus_core::{
    HandlerResult, PersistentEvent, ScheduledEvent, ScheduledEventRecord, ScheduledEventRegistry,
    SyncHandler, downcast_event,
};

use crate::common::TestEvent;

#[tokio::test]
async fn test_scheduled_event_waits_while_immediate_events_flow() {
    let bus = started_bus().await;
    let recorder = Recorder::new();
    let started = Instant::now();

    let scheduled = recorder.clone();
    bus.register_event_handler::<ScheduledEvent, _>(SyncHandler(move |_: &ScheduledEvent| -> HandlerResult<()> {
        scheduled.record(format!("scheduled@{}", started.elapsed().as_secs()));
        Ok(())
    }));
    let immediate = recorder.clone();
    bus.register_event_handler::<TestEvent, _>(SyncHandler(move |e: &TestEvent| -> HandlerResult<()> {
        immediate.record(e.label.clone());
        Ok(())
    }));

    bus.publish(ScheduledEvent::after(Duration::from_secs(5))).await.unwrap();
    bus.publish(TestEvent::new("now")).await.unwrap();
    bus.ensure_events_processed().await;
    assert_eq!(recorder.entries(), vec!["now"]);
    assert_eq!(bus.scheduled().len(), 1);

    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert_eq!(recorder.len(), 1);

    let deadline = Instant::now() + Duration::from_secs(3);
    while recorder.len() < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(recorder.entries(), vec!["now", "scheduled@5"]);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(bus.scheduled().is_empty());
    bus.stop().await;
}

#[tokio::test]
async fn test_scheduled_events_fire_in_due_order() {
    let bus = started_bus().await;
    let recorder = Recorder::new();
    let seen = recorder.clone();
    bus.register_event_handler::<ScheduledEvent, _>(SyncHandler(move |e: &ScheduledEvent| -> HandlerResult<()> {
        seen.record(e.meta.id.clone());
        Ok(())
    }));

    let later = ScheduledEvent::after(Duration::from_millis(200));
    let sooner = ScheduledEvent::after(Duration::from_millis(50));
    let expected = vec![sooner.meta.id.clone(), later.meta.id.clone()];
    bus.publish(later).await.unwrap();
    bus.publish(sooner).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    bus.ensure_events_processed().await;
    assert_eq!(recorder.entries(), expected);
    bus.stop().await;
}

#[test]
fn test_record_round_trip_preserves_every_field() {
    let event = ScheduledEvent::new(Utc::now() + chrono::Duration::seconds(90)).with_session("SESSION_1");
    let record = ScheduledEventRecord::from_event(&event).unwrap();
    assert_eq!(record.type_name, ScheduledEvent::TYPE_NAME);

    let json = serde_json::to_string(&record).unwrap();
    let parsed: ScheduledEventRecord = serde_json::from_str(&json).unwrap();
    let rebuilt = ScheduledEventRegistry::default().reconstruct(parsed).unwrap();
    let rebuilt: Arc<ScheduledEvent> = downcast_event(&rebuilt).unwrap();

    assert_eq!(*rebuilt, event);
    assert_eq!(rebuilt.scheduled_time(), event.scheduled_time());
}

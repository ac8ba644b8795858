//! Integration tests for the push notification listener
//!
//! Covers cold start, background taps and foreground deliveries.

mod common;

use common::*;
use serde_json::json;
use std::sync::atomic::Ordering;

use callsync_call_coordinator::{CallSource, ColdStartOutcome, CoordinatorEvent, DisplayOutcome, SessionId};

#[tokio::test]
async fn test_cold_start_navigates_directly() {
    let harness = Harness::new();
    *harness.push.launch.lock() = Some(call_payload("room-c1"));

    let outcome = harness.listener.start().await;

    assert_eq!(outcome, Some(ColdStartOutcome::Navigated));
    assert_eq!(harness.navigator.opened(), 1);
    assert_eq!(harness.navigator.routes.lock()[0].source, CallSource::ColdStart);
    assert_eq!(harness.telephony.display_count(), 0);
    assert!(harness
        .bridge
        .uuid_for_session_id(&SessionId::from("room-c1"))
        .is_some());
}

#[tokio::test]
async fn test_cold_start_falls_back_to_native_ui_exactly_once() {
    let harness = Harness::new();
    harness.navigator.fail.store(true, Ordering::SeqCst);
    *harness.push.launch.lock() = Some(call_payload("room-c2"));

    let outcome = harness.listener.start().await;
    assert_eq!(outcome, Some(ColdStartOutcome::FellBack(DisplayOutcome::Displayed)));

    // The realtime channel catching up later must not present again
    let room = SessionId::from("room-c2");
    let uuid = harness.bridge.uuid_for_session_id(&room).unwrap();
    harness.coordinator.initialize("bob").await.unwrap();
    harness.signals.deliver(ringing_signal("sig-c2", "room-c2")).await;
    assert!(wait_until(|| harness.trace.count("bridge", "duplicate_display_suppressed") == 1).await);

    assert_eq!(harness.telephony.display_count(), 1);
    assert_eq!(harness.telephony.displayed.lock()[0].uuid, uuid);
    assert_eq!(harness.trace.count("push", "cold_start_fallback"), 1);
    assert_eq!(harness.navigator.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_start_is_guarded_once() {
    let harness = Harness::new();
    *harness.push.launch.lock() = Some(call_payload("room-c3"));

    assert!(harness.listener.start().await.is_some());
    assert!(harness.listener.start().await.is_none());
    assert_eq!(harness.navigator.opened(), 1);

    harness.listener.stop();
    assert!(!harness.listener.is_started());
}

#[tokio::test]
async fn test_no_launch_notification() {
    let harness = Harness::new();
    assert_eq!(harness.listener.start().await, Some(ColdStartOutcome::NoCall));

    *harness.push.launch.lock() = Some(json!({ "type": "chat", "room_id": "r" }));
    assert_eq!(harness.listener.handle_cold_start().await, ColdStartOutcome::NoCall);
    assert_eq!(harness.navigator.opened(), 0);
}

#[tokio::test]
async fn test_background_tap_persists_mapping_and_navigates_once() {
    let harness = Harness::new();
    harness.listener.start().await;
    let room = SessionId::from("room-t1");

    harness.push.tap(call_payload("room-t1"));
    harness.push.tap(call_payload("room-t1"));

    assert!(wait_until(|| harness.trace.count("dispatch", "duplicate_navigation_suppressed") == 1).await);
    assert_eq!(harness.navigator.opened(), 1);
    assert_eq!(harness.navigator.routes.lock()[0].source, CallSource::PushTap);
    let uuid = harness.bridge.uuid_for_session_id(&room).unwrap();
    assert_eq!(harness.bridge.session_id_for_uuid(&uuid), Some(room));
}

#[tokio::test]
async fn test_foreground_deliveries_are_deduplicated_by_room() {
    let harness = Harness::new();
    harness.listener.start().await;

    harness.push.receive(call_payload("room-f1"));
    harness.push.receive(call_payload("room-f1"));
    harness.push.receive(json!({ "type": "message", "body": "hi" }));

    assert!(wait_until(|| harness.trace.count("push", "duplicate_push_suppressed") == 1).await);
    assert_eq!(harness.telephony.display_count(), 1);
}

#[tokio::test]
async fn test_malformed_call_payload_is_traced() {
    let harness = Harness::new();

    let outcome = harness
        .listener
        .handle_foreground(&json!({ "type": "call", "call_type": "audio", "caller_id": "x" }))
        .await;

    assert_eq!(outcome, None);
    assert_eq!(harness.trace.count("push", "malformed_notification"), 1);
    assert_eq!(harness.telephony.display_count(), 0);
}

#[tokio::test]
async fn test_duplicate_push_reports_only_mapped_uuids() {
    let harness = Harness::new();
    let room = SessionId::from("room-f2");

    harness.listener.handle_foreground(&call_payload("room-f2")).await;
    let uuid = harness.bridge.uuid_for_session_id(&room).unwrap();
    let mut events = harness.coordinator.subscribe_events();

    let outcome = harness.listener.handle_foreground(&call_payload("room-f2")).await;
    assert_eq!(outcome, Some(DisplayOutcome::Duplicate));
    assert_eq!(
        events.try_recv().unwrap(),
        CoordinatorEvent::DuplicateSuppressed {
            session_id: room.clone(),
            uuid: uuid.clone(),
            source: CallSource::PushForeground,
        }
    );

    // Once the call is gone nothing is mapped, so no uuid is reported
    assert!(harness.bridge.clear_call_mapping(&uuid));
    let outcome = harness.listener.handle_foreground(&call_payload("room-f2")).await;
    assert_eq!(outcome, Some(DisplayOutcome::Duplicate));
    assert!(events.try_recv().is_err());
    assert_eq!(harness.trace.count("push", "duplicate_push_suppressed"), 2);
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::StreamingEngine;
use crate::domain::models::Message;
use crate::domain::models::Role;
use crate::domain::models::StreamEvent;
use crate::domain::models::ToolStatus;
use crate::domain::services::CoreSignals;
use crate::domain::services::SessionStore;
use crate::domain::services::TimerScheduler;
use crate::infrastructure::stores::MemoryStore;

struct Harness {
    signals: Arc<CoreSignals>,
    store: Arc<SessionStore>,
    engine: Arc<StreamingEngine>,
    session_id: String,
}

fn setup() -> Harness {
    let signals = Arc::new(CoreSignals::new());
    let store = SessionStore::new(Arc::new(MemoryStore::new()), Arc::clone(&signals));
    let engine = Arc::new(StreamingEngine::new(
        Arc::clone(&store),
        Arc::clone(&signals),
        Arc::new(TimerScheduler::default()),
    ));

    let session_id = store.create_active_session("chat");
    store.append_message(&session_id, Message::new(Role::User, "hello"));

    return Harness {
        signals,
        store,
        engine,
        session_id,
    };
}

#[tokio::test]
async fn it_streams_deltas_into_one_assistant_message() {
    let h = setup();
    let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
    tx.send(StreamEvent::StreamStart).unwrap();
    tx.send(StreamEvent::Delta {
        text: "hi".to_string(),
    })
    .unwrap();
    tx.send(StreamEvent::StreamEnd).unwrap();

    h.engine.run_turn(&h.session_id, rx).await;

    let session = h.store.active_session().unwrap();
    assert_eq!(session.messages.len(), 2);
    let reply = &session.messages[1];
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.content, "hi");
    assert!(!reply.is_streaming);
    assert!(reply.status_text.is_none());
    assert!(!h.signals.is_streaming());
}

#[tokio::test]
async fn it_removes_the_placeholder_when_cancelled_before_any_delta() {
    let h = setup();
    let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();

    let engine = Arc::clone(&h.engine);
    let session_id = h.session_id.clone();
    let handle = tokio::spawn(async move {
        engine.run_turn(&session_id, rx).await;
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.signals.is_streaming());

    h.engine.abort();
    assert!(!h.signals.is_streaming());

    drop(tx);
    handle.await.unwrap();

    let session = h.store.active_session().unwrap();
    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.messages[0].role, Role::User);
}

#[tokio::test]
async fn it_preserves_tool_activity_through_the_lifecycle() {
    let h = setup();
    let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
    tx.send(StreamEvent::ToolStart {
        id: "t1".to_string(),
        name: "bash".to_string(),
    })
    .unwrap();
    tx.send(StreamEvent::ToolEnd {
        id: "t1".to_string(),
        result: "ok".to_string(),
    })
    .unwrap();
    tx.send(StreamEvent::StreamEnd).unwrap();

    h.engine.run_turn(&h.session_id, rx).await;

    let session = h.store.active_session().unwrap();
    let reply = &session.messages[1];
    let tools = reply.tool_activities.as_ref().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].status, ToolStatus::Completed);
    assert_eq!(tools[0].result.as_deref(), Some("ok"));
    assert!(!reply.is_streaming);
}

#[tokio::test]
async fn it_surfaces_truncated_errors_as_the_message_content() {
    let h = setup();
    let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
    tx.send(StreamEvent::Error {
        message: "X".repeat(600),
    })
    .unwrap();

    h.engine.run_turn(&h.session_id, rx).await;

    let session = h.store.active_session().unwrap();
    let reply = &session.messages[1];
    let expected = format!("Error: {}… [truncated]", "X".repeat(500));
    assert_eq!(reply.content, expected);
    assert!(!reply.is_streaming);
}

#[tokio::test]
async fn it_keeps_the_new_turn_alive_through_a_stale_cancel() {
    let h = setup();

    // Turn A starts and is aborted before producing anything.
    let (tx_a, rx_a) = mpsc::unbounded_channel::<StreamEvent>();
    let engine = Arc::clone(&h.engine);
    let session_id = h.session_id.clone();
    let turn_a = tokio::spawn(async move {
        engine.run_turn(&session_id, rx_a).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.engine.abort();

    // Turn B becomes the active turn while A's cancel flag still lingers.
    let (tx_b, rx_b) = mpsc::unbounded_channel::<StreamEvent>();
    let engine = Arc::clone(&h.engine);
    let session_id = h.session_id.clone();
    let turn_b = tokio::spawn(async move {
        engine.run_turn(&session_id, rx_b).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A lingering event for stale turn A must be ignored, not applied.
    tx_a.send(StreamEvent::Delta {
        text: "stale".to_string(),
    })
    .unwrap();

    // Events for turn B keep flowing despite the set cancel flag.
    tx_b.send(StreamEvent::Delta {
        text: "fresh".to_string(),
    })
    .unwrap();
    tx_b.send(StreamEvent::StreamEnd).unwrap();

    drop(tx_a);
    turn_a.await.unwrap();
    turn_b.await.unwrap();

    let session = h.store.active_session().unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[1].content, "fresh");
    assert!(!session.messages.iter().any(|e| return e.content.contains("stale")));
}

#[tokio::test]
async fn it_never_shows_more_than_one_streaming_message() {
    let h = setup();
    let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();

    let engine = Arc::clone(&h.engine);
    let session_id = h.session_id.clone();
    let handle = tokio::spawn(async move {
        engine.run_turn(&session_id, rx).await;
    });

    for n in 0..5 {
        tx.send(StreamEvent::Delta {
            text: format!("chunk {n} "),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let streaming = h
            .store
            .active_session()
            .unwrap()
            .messages
            .iter()
            .filter(|e| return e.is_streaming)
            .count();
        assert_eq!(streaming, 1);
    }

    tx.send(StreamEvent::StreamEnd).unwrap();
    handle.await.unwrap();

    let streaming = h
        .store
        .active_session()
        .unwrap()
        .messages
        .iter()
        .filter(|e| return e.is_streaming)
        .count();
    assert_eq!(streaming, 0);
}

#[tokio::test]
async fn it_forwards_usage_to_the_counters() {
    let h = setup();
    let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
    tx.send(StreamEvent::Usage {
        input_tokens: 10,
        output_tokens: 5,
    })
    .unwrap();
    tx.send(StreamEvent::Delta {
        text: "hi".to_string(),
    })
    .unwrap();
    tx.send(StreamEvent::StreamEnd).unwrap();

    h.engine.run_turn(&h.session_id, rx).await;

    assert_eq!(h.store.usage(), 15);
    assert_eq!(h.store.weekly_usage(), 15);
}

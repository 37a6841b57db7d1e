use std::sync::Arc;

use anyhow::Result;
use mockito::Matcher;
use serde_json::json;
use test_utils::health_body;
use test_utils::remote_message_json;
use test_utils::remote_session_json;

use super::RemoteBridge;
use crate::domain::models::Message;
use crate::domain::models::Role;
use crate::domain::models::Session;
use crate::domain::services::CoreSignals;
use crate::domain::services::SessionStore;
use crate::infrastructure::remote::RemoteClient;
use crate::infrastructure::stores::DocumentStore;
use crate::infrastructure::stores::MemoryStore;

struct Harness {
    docs: Arc<MemoryStore>,
    signals: Arc<CoreSignals>,
    store: Arc<SessionStore>,
    bridge: RemoteBridge,
}

fn setup(server: &mockito::Server) -> Harness {
    let docs = Arc::new(MemoryStore::new());
    let signals = Arc::new(CoreSignals::new());
    let store = SessionStore::new(docs.clone(), Arc::clone(&signals));
    let bridge = RemoteBridge::new(
        RemoteClient::new(&server.url(), "/tmp/workspace"),
        Arc::clone(&store),
        Arc::clone(&signals),
    );

    return Harness {
        docs,
        signals,
        store,
        bridge,
    };
}

#[tokio::test]
async fn it_updates_the_connected_flag_from_the_probe() {
    let mut server = mockito::Server::new();
    let h = setup(&server);

    let mock = server
        .mock("GET", "/global/health")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(health_body(true))
        .create();

    assert!(h.bridge.probe().await);
    assert!(h.signals.is_connected());
    mock.assert();

    server
        .mock("GET", "/global/health")
        .match_query(Matcher::Any)
        .with_status(500)
        .create();

    assert!(!h.bridge.probe().await);
    assert!(!h.signals.is_connected());
}

#[tokio::test]
async fn it_loads_remote_sessions_on_startup() {
    let mut server = mockito::Server::new();
    let h = setup(&server);

    // Continuity from the last run: one archived id and a remembered active.
    h.docs.set("archived-ids", json!(["ses_old"]));
    h.docs.set("active-session-id", json!("ses_2"));
    h.docs.set("draft", json!(false));

    server
        .mock("GET", "/global/health")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(health_body(true))
        .create();
    server
        .mock("GET", "/session")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!([
                remote_session_json("ses_1", None, None),
                remote_session_json("ses_sub", Some("child"), Some("ses_1")),
                remote_session_json("ses_2", Some("Second"), None),
                remote_session_json("ses_old", Some("Old"), None),
            ])
            .to_string(),
        )
        .create();

    h.bridge.startup().await;

    let sessions = h.store.sessions();
    // Sub-sessions are filtered; the archived one sorts last.
    let ids: Vec<String> = sessions.iter().map(|e| return e.id.clone()).collect();
    assert_eq!(
        ids,
        vec!["ses_1".to_string(), "ses_2".to_string(), "ses_old".to_string()]
    );
    assert!(sessions[2].archived);
    // A remote record without a title gets the placeholder name.
    assert_eq!(sessions[0].name, "Untitled chat");
    assert_eq!(sessions[1].name, "Second");
    assert!(sessions.iter().all(|e| return e.is_remote_backed()));
    // The previously active session is restored.
    assert_eq!(h.store.active_session_id().as_deref(), Some("ses_2"));
    assert!(h.signals.is_connected());
}

#[tokio::test]
async fn it_falls_back_to_local_state_when_unreachable() {
    let mut server = mockito::Server::new();
    let h = setup(&server);

    let mut session = Session::new("local-1", "offline chat");
    session.messages.push(Message::new(Role::User, "hi"));
    h.docs
        .set("sessions", serde_json::to_value(vec![session]).unwrap());
    h.docs.set("active-session-id", json!("local-1"));
    h.docs.set("draft", json!(false));

    server
        .mock("GET", "/global/health")
        .match_query(Matcher::Any)
        .with_status(500)
        .create();

    h.bridge.startup().await;

    assert!(!h.signals.is_connected());
    assert_eq!(h.store.sessions().len(), 1);
    assert_eq!(h.store.active_session_id().as_deref(), Some("local-1"));
    assert_eq!(h.store.active_session().unwrap().messages.len(), 1);
}

#[tokio::test]
async fn it_merges_polled_messages_by_id() -> Result<()> {
    let mut server = mockito::Server::new();
    let h = setup(&server);

    let session_id = h.store.create_active_session("chat");
    h.store.update_session(&session_id, |session| {
        session.remote_id = Some("ses_1".to_string());
        let mut known = Message::new(Role::User, "hi");
        known.id = "m1".to_string();
        session.messages.push(known);
    });

    server
        .mock("GET", "/session/ses_1/message")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!([
                remote_message_json("m1", "user", "hi"),
                remote_message_json("m2", "assistant", "hello there"),
                // Non user/assistant roles drop silently.
                remote_message_json("m3", "system", "internal"),
            ])
            .to_string(),
        )
        .expect(2)
        .create();

    h.bridge.sync_active_messages().await;
    h.bridge.sync_active_messages().await;

    let messages = h.store.active_session().unwrap().messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].id, "m2");
    assert_eq!(messages[1].content, "hello there");

    return Ok(());
}

#[tokio::test]
async fn it_prepends_unknown_sessions_from_the_list_poll() {
    let mut server = mockito::Server::new();
    let h = setup(&server);

    let local = h.store.create_active_session("mine");
    h.store.update_session(&local, |session| {
        session.remote_id = Some("ses_1".to_string());
    });

    server
        .mock("GET", "/session")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!([
                remote_session_json("ses_1", Some("mine"), None),
                remote_session_json("ses_9", Some("from another client"), None),
            ])
            .to_string(),
        )
        .create();

    h.bridge.refresh_session_list().await;

    let ids: Vec<String> = h.store.sessions().iter().map(|e| return e.id.clone()).collect();
    assert_eq!(ids, vec!["ses_9".to_string(), local.clone()]);
    assert_eq!(h.store.active_session_id().as_deref(), Some(local.as_str()));
}

#[tokio::test]
async fn it_reloads_sessions_authoritatively() -> Result<()> {
    let mut server = mockito::Server::new();
    let h = setup(&server);

    h.store.create_active_session("stale local");

    server
        .mock("GET", "/global/health")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(health_body(true))
        .create();
    server
        .mock("GET", "/session")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!([remote_session_json("ses_a", Some("A"), None)]).to_string())
        .create();

    h.bridge.reload_sessions().await?;

    let ids: Vec<String> = h.store.sessions().iter().map(|e| return e.id.clone()).collect();
    assert_eq!(ids, vec!["ses_a".to_string()]);
    assert_eq!(h.store.active_session_id().as_deref(), Some("ses_a"));

    return Ok(());
}

#[tokio::test]
async fn it_enters_draft_mode_when_the_remote_list_is_empty() -> Result<()> {
    let mut server = mockito::Server::new();
    let h = setup(&server);

    h.store.create_active_session("stale local");

    server
        .mock("GET", "/global/health")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(health_body(true))
        .create();
    server
        .mock("GET", "/session")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("[]")
        .create();

    h.bridge.reload_sessions().await?;

    assert!(h.store.sessions().is_empty());
    assert!(h.store.is_draft());

    return Ok(());
}

#[tokio::test]
async fn it_fails_reload_when_unreachable() {
    let mut server = mockito::Server::new();
    let h = setup(&server);
    h.store.create_active_session("kept");

    server
        .mock("GET", "/global/health")
        .match_query(Matcher::Any)
        .with_status(500)
        .create();

    let res = h.bridge.reload_sessions().await;

    assert!(res.is_err());
    // Existing state stays untouched.
    assert_eq!(h.store.sessions().len(), 1);
}

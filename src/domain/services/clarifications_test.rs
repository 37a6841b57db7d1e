use std::sync::Arc;

use anyhow::Result;
use mockito::Matcher;
use serde_json::json;

use super::ClarificationChannel;
use crate::domain::services::CoreSignals;
use crate::domain::services::SessionStore;
use crate::infrastructure::remote::RemoteClient;
use crate::infrastructure::stores::MemoryStore;

struct Harness {
    store: Arc<SessionStore>,
    channel: ClarificationChannel,
}

fn setup(server: &mockito::Server) -> Harness {
    let signals = Arc::new(CoreSignals::new());
    let store = SessionStore::new(Arc::new(MemoryStore::new()), Arc::clone(&signals));
    let channel = ClarificationChannel::new(
        RemoteClient::new(&server.url(), "/tmp/workspace"),
        Arc::clone(&store),
        signals,
    );

    return Harness { store, channel };
}

fn activate_remote_session(store: &Arc<SessionStore>, remote_id: &str) {
    let id = store.create_active_session("chat");
    let remote_id = remote_id.to_string();
    store.update_session(&id, |session| {
        session.remote_id = Some(remote_id);
    });
}

fn pending_body() -> String {
    return json!([
        {"id": "q_other", "sessionID": "ses_other", "questions": []},
        {"id": "q1", "sessionID": "ses_1", "questions": [
            {"text": "Which file?", "options": [{"label": "a.rs"}, {"label": "b.rs"}], "multiple": false}
        ]}
    ])
    .to_string();
}

#[tokio::test]
async fn it_surfaces_the_request_for_the_active_session() {
    let mut server = mockito::Server::new();
    let h = setup(&server);
    activate_remote_session(&h.store, "ses_1");

    server
        .mock("GET", "/question")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(pending_body())
        .create();

    h.channel.poll_once().await;

    let pending = h.channel.pending().unwrap();
    assert_eq!(pending.id, "q1");
    assert_eq!(pending.questions.len(), 1);
}

#[tokio::test]
async fn it_stays_silent_without_a_remote_backed_session() {
    let mut server = mockito::Server::new();
    let h = setup(&server);
    // Local-only session: the channel is disabled entirely.
    h.store.create_active_session("local chat");

    let mock = server
        .mock("GET", "/question")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(pending_body())
        .expect(0)
        .create();

    h.channel.poll_once().await;

    assert!(h.channel.pending().is_none());
    mock.assert();
}

#[tokio::test]
async fn it_keeps_the_surfaced_request_when_a_poll_fails() {
    let mut server = mockito::Server::new();
    let h = setup(&server);
    activate_remote_session(&h.store, "ses_1");

    server
        .mock("GET", "/question")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(pending_body())
        .create();
    h.channel.poll_once().await;
    assert!(h.channel.pending().is_some());

    server
        .mock("GET", "/question")
        .match_query(Matcher::Any)
        .with_status(500)
        .create();
    h.channel.poll_once().await;

    assert!(h.channel.pending().is_some());
}

#[tokio::test]
async fn it_clears_the_request_after_a_successful_reply() -> Result<()> {
    let mut server = mockito::Server::new();
    let h = setup(&server);
    activate_remote_session(&h.store, "ses_1");

    server
        .mock("GET", "/question")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(pending_body())
        .create();
    h.channel.poll_once().await;

    let reply = server
        .mock("POST", "/question/q1/reply")
        .match_query(Matcher::Any)
        .match_body(Matcher::PartialJson(json!({"answers": [["a.rs"]]})))
        .with_status(200)
        .create();

    h.channel.reply("q1", vec![vec!["a.rs".to_string()]]).await?;

    assert!(h.channel.pending().is_none());
    reply.assert();

    return Ok(());
}

#[tokio::test]
async fn it_keeps_the_request_pending_when_the_reply_fails() {
    let mut server = mockito::Server::new();
    let h = setup(&server);
    activate_remote_session(&h.store, "ses_1");

    server
        .mock("GET", "/question")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(pending_body())
        .create();
    h.channel.poll_once().await;

    server
        .mock("POST", "/question/q1/reply")
        .match_query(Matcher::Any)
        .with_status(500)
        .create();

    let res = h.channel.reply("q1", vec![vec!["a.rs".to_string()]]).await;

    // The user may retry: the request stays surfaced.
    assert!(res.is_err());
    assert!(h.channel.pending().is_some());
}

#[tokio::test]
async fn it_rejects_without_answering() -> Result<()> {
    let mut server = mockito::Server::new();
    let h = setup(&server);
    activate_remote_session(&h.store, "ses_1");

    server
        .mock("GET", "/question")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(pending_body())
        .create();
    h.channel.poll_once().await;

    let reject = server
        .mock("POST", "/question/q1/reject")
        .match_query(Matcher::Any)
        .with_status(200)
        .create();

    h.channel.reject("q1").await?;

    assert!(h.channel.pending().is_none());
    reject.assert();

    return Ok(());
}

use super::StreamEvent;
use super::ToolStatus;
use super::Turn;

#[test]
fn it_starts_thinking() {
    let turn = Turn::new();
    assert_eq!(turn.status.as_deref(), Some("Thinking..."));
    assert!(!turn.done);
    assert!(turn.error.is_none());
}

#[test]
fn it_mints_a_fresh_token_per_turn() {
    assert_ne!(Turn::new().token, Turn::new().token);
}

#[test]
fn it_appends_deltas_and_clears_status() {
    let mut turn = Turn::new();
    turn.apply(&StreamEvent::Delta {
        text: "Hello ".to_string(),
    });
    turn.apply(&StreamEvent::Delta {
        text: "world".to_string(),
    });

    assert_eq!(turn.content, "Hello world");
    assert!(turn.status.is_none());
}

#[test]
fn it_tracks_tool_lifecycle() {
    let mut turn = Turn::new();
    turn.apply(&StreamEvent::ToolStart {
        id: "t1".to_string(),
        name: "bash".to_string(),
    });

    assert_eq!(turn.tools.len(), 1);
    assert_eq!(turn.tools[0].status, ToolStatus::Running);
    assert_eq!(turn.status.as_deref(), Some("Running a command..."));

    turn.apply(&StreamEvent::ToolEnd {
        id: "t1".to_string(),
        result: "ok".to_string(),
    });

    assert_eq!(turn.tools[0].status, ToolStatus::Completed);
    assert_eq!(turn.tools[0].result.as_deref(), Some("ok"));
}

#[test]
fn it_marks_failed_tools() {
    let mut turn = Turn::new();
    turn.apply(&StreamEvent::ToolStart {
        id: "t1".to_string(),
        name: "bash".to_string(),
    });
    turn.apply(&StreamEvent::ToolEnd {
        id: "t1".to_string(),
        result: "[error] exit status 1".to_string(),
    });

    assert_eq!(turn.tools[0].status, ToolStatus::Error);
}

#[test]
fn it_ignores_tool_end_without_a_match() {
    let mut turn = Turn::new();
    turn.apply(&StreamEvent::ToolEnd {
        id: "nope".to_string(),
        result: "ok".to_string(),
    });

    assert!(turn.tools.is_empty());
    assert!(!turn.done);
}

#[test]
fn it_uses_fallback_verbs_for_unknown_tools() {
    let mut turn = Turn::new();
    turn.apply(&StreamEvent::ToolStart {
        id: "t1".to_string(),
        name: "frobnicate".to_string(),
    });
    assert_eq!(turn.status.as_deref(), Some("Running a tool..."));

    turn.apply(&StreamEvent::ToolStart {
        id: "t2".to_string(),
        name: "mcp_browser_open".to_string(),
    });
    assert_eq!(turn.status.as_deref(), Some("Calling a remote tool..."));
}

#[test]
fn it_overwrites_status_verbatim() {
    let mut turn = Turn::new();
    turn.apply(&StreamEvent::Status {
        text: "Delegating to Oracle...".to_string(),
    });

    assert_eq!(turn.status.as_deref(), Some("Delegating to Oracle..."));
}

#[test]
fn it_keeps_reasoning_separate_from_content() {
    let mut turn = Turn::new();
    turn.apply(&StreamEvent::Reasoning {
        text: "thinking hard".to_string(),
    });
    turn.apply(&StreamEvent::Delta {
        text: "answer".to_string(),
    });

    assert_eq!(turn.reasoning, "thinking hard");
    assert_eq!(turn.content, "answer");
}

#[test]
fn it_renders_compression_notices_inline() {
    let mut turn = Turn::new();
    turn.apply(&StreamEvent::OllamaStatus {
        status: "compressing".to_string(),
    });
    assert_eq!(turn.status.as_deref(), Some("Compressing history..."));

    turn.apply(&StreamEvent::OllamaStatus {
        status: "compression_failed".to_string(),
    });
    assert!(turn.content.contains("history compression failed"));

    turn.apply(&StreamEvent::OllamaStatus {
        status: "done".to_string(),
    });
    assert!(turn.status.is_none());
}

#[test]
fn it_finishes_on_stream_end() {
    let mut turn = Turn::new();
    turn.apply(&StreamEvent::StreamEnd);
    assert!(turn.done);
    assert!(turn.error.is_none());
}

#[test]
fn it_truncates_oversized_errors() {
    let mut turn = Turn::new();
    turn.apply(&StreamEvent::Error {
        message: "X".repeat(600),
    });

    assert!(turn.done);
    let error = turn.error.unwrap();
    assert!(error.starts_with(&"X".repeat(500)));
    assert!(error.ends_with("… [truncated]"));
    assert_eq!(error.chars().count(), 500 + "… [truncated]".chars().count());
}

#[test]
fn it_keeps_short_errors_verbatim() {
    let mut turn = Turn::new();
    turn.apply(&StreamEvent::Error {
        message: "boom".to_string(),
    });

    assert_eq!(turn.error.as_deref(), Some("boom"));
}

use serde_json::json;
use serde_json::Value;

/// One `data:` line of a server-sent-event body.
pub fn sse_line(payload: Value) -> String {
    return format!("data: {payload}\n");
}

pub fn health_body(healthy: bool) -> String {
    return json!({ "healthy": healthy }).to_string();
}

pub fn remote_session_json(id: &str, title: Option<&str>, parent_id: Option<&str>) -> Value {
    let mut session = json!({
        "id": id,
        "time": {"created": 1700000000000u64, "updated": 1700000000000u64}
    });
    if let Some(title) = title {
        session["title"] = json!(title);
    }
    if let Some(parent_id) = parent_id {
        session["parentID"] = json!(parent_id);
    }

    return session;
}

pub fn remote_message_json(id: &str, role: &str, text: &str) -> Value {
    return json!({
        "info": {"id": id, "role": role, "time": {"created": 1700000000000u64}},
        "parts": [{"type": "text", "text": text}]
    });
}

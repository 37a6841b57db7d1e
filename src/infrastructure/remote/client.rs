#[cfg(test)]
#[path = "client_test.rs"]
mod tests;

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use futures::stream::TryStreamExt;
use serde_derive::Deserialize;
use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::ClarificationRequest;
use crate::domain::models::StreamEvent;

/// Head start for the event subscription before the prompt is posted, so no
/// early part events are missed.
const SUBSCRIBE_HEAD_START: Duration = Duration::from_millis(100);

fn convert_err(err: reqwest::Error) -> std::io::Error {
    let err_msg = err.to_string();
    return std::io::Error::new(std::io::ErrorKind::Interrupted, err_msg);
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSessionTime {
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSession {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "parentID", default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub time: Option<RemoteSessionTime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMessageTime {
    pub created: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMessageInfo {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub time: Option<RemoteMessageTime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMessage {
    pub info: RemoteMessageInfo,
    #[serde(default)]
    pub parts: Vec<RemotePart>,
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    properties: Value,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    payload: EventPayload,
}

#[derive(Debug, Deserialize)]
struct EventPart {
    id: String,
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID", default)]
    message_id: Option<String>,
    #[serde(rename = "type")]
    part_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(rename = "callID", default)]
    call_id: Option<String>,
    #[serde(default)]
    state: Option<Value>,
}

/// Per-subscription translation state: full-text snapshots are diffed into
/// deltas, tool starts are emitted once per call id, and the session's own
/// user messages are suppressed.
struct SubscriptionState {
    known_message_ids: HashSet<String>,
    user_message_ids: HashSet<String>,
    text_lengths: HashMap<String, usize>,
    started_tools: HashSet<String>,
}

/// HTTP client for the remote session service. Every request carries the
/// `?directory=<workspace>` scope parameter.
#[derive(Clone)]
pub struct RemoteClient {
    base_url: String,
    directory: String,
    timeout: String,
}

impl Default for RemoteClient {
    fn default() -> RemoteClient {
        return RemoteClient {
            base_url: Config::get(ConfigKey::RemoteURL),
            directory: Config::get(ConfigKey::RemoteDirectory),
            timeout: Config::get(ConfigKey::BackendHealthCheckTimeout),
        };
    }
}

impl RemoteClient {
    pub fn new(base_url: &str, directory: &str) -> RemoteClient {
        return RemoteClient {
            base_url: base_url.to_string(),
            directory: directory.to_string(),
            timeout: Config::get(ConfigKey::BackendHealthCheckTimeout),
        };
    }

    fn url(&self, path: &str) -> String {
        let sep = if path.contains('?') { '&' } else { '?' };
        return format!(
            "{base}{path}{sep}directory={directory}",
            base = self.base_url,
            directory = self.directory
        );
    }

    /// Short-timeout reachability probe: a dead service degrades the
    /// connected flag promptly instead of hanging the probe loop.
    pub async fn health_check(&self) -> Result<()> {
        let res = reqwest::Client::new()
            .get(self.url("/global/health"))
            .timeout(Duration::from_millis(self.timeout.parse::<u64>()?))
            .send()
            .await;

        if res.is_err() {
            bail!("remote session service is not reachable");
        }

        let res = res.unwrap();
        if !res.status().is_success() {
            tracing::debug!(status = res.status().as_u16(), "remote health check failed");
            bail!("remote health check failed");
        }

        let body = res.json::<Value>().await?;
        let healthy = body
            .get("healthy")
            .and_then(|e| return e.as_bool())
            .unwrap_or(false);
        if !healthy {
            bail!("remote session service reports unhealthy");
        }

        return Ok(());
    }

    pub async fn list_sessions(&self) -> Result<Vec<RemoteSession>> {
        let res = reqwest::Client::new()
            .get(self.url("/session"))
            .send()
            .await?;

        if !res.status().is_success() {
            tracing::error!(status = res.status().as_u16(), "failed to list remote sessions");
            bail!("failed to list remote sessions");
        }

        return Ok(res.json::<Vec<RemoteSession>>().await?);
    }

    pub async fn create_session(&self) -> Result<RemoteSession> {
        let res = reqwest::Client::new()
            .post(self.url("/session"))
            .header("content-type", "application/json")
            .body("{}")
            .send()
            .await?;

        if !res.status().is_success() {
            tracing::error!(status = res.status().as_u16(), "failed to create remote session");
            bail!("failed to create remote session");
        }

        return Ok(res.json::<RemoteSession>().await?);
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let res = reqwest::Client::new()
            .delete(self.url(&format!("/session/{session_id}")))
            .send()
            .await?;

        if !res.status().is_success() {
            tracing::error!(status = res.status().as_u16(), "failed to delete remote session");
            bail!("failed to delete remote session");
        }

        return Ok(());
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> Result<()> {
        let res = reqwest::Client::new()
            .patch(self.url(&format!("/session/{session_id}")))
            .header("content-type", "application/json")
            .json(&json!({ "title": title }))
            .send()
            .await?;

        if !res.status().is_success() {
            tracing::error!(status = res.status().as_u16(), "failed to rename remote session");
            bail!("failed to rename remote session");
        }

        return Ok(());
    }

    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<RemoteMessage>> {
        let res = reqwest::Client::new()
            .get(self.url(&format!("/session/{session_id}/message")))
            .send()
            .await?;

        if !res.status().is_success() {
            tracing::error!(status = res.status().as_u16(), "failed to fetch remote messages");
            bail!("failed to fetch remote messages");
        }

        return Ok(res.json::<Vec<RemoteMessage>>().await?);
    }

    /// Best-effort generation abort for the session's running prompt.
    pub async fn abort(&self, session_id: &str) -> Result<()> {
        let res = reqwest::Client::new()
            .post(self.url(&format!("/session/{session_id}/abort")))
            .send()
            .await?;

        if !res.status().is_success() {
            bail!("failed to abort the remote session");
        }

        return Ok(());
    }

    pub async fn pending_clarifications(&self) -> Result<Vec<ClarificationRequest>> {
        let res = reqwest::Client::new()
            .get(self.url("/question"))
            .send()
            .await?;

        if !res.status().is_success() {
            bail!("failed to fetch pending clarification requests");
        }

        return Ok(res.json::<Vec<ClarificationRequest>>().await?);
    }

    pub async fn reply_clarification(
        &self,
        request_id: &str,
        answers: Vec<Vec<String>>,
    ) -> Result<()> {
        let res = reqwest::Client::new()
            .post(self.url(&format!("/question/{request_id}/reply")))
            .header("content-type", "application/json")
            .json(&json!({ "answers": answers }))
            .send()
            .await?;

        if !res.status().is_success() {
            tracing::error!(status = res.status().as_u16(), "failed to reply to clarification");
            bail!("failed to reply to the clarification request");
        }

        return Ok(());
    }

    pub async fn reject_clarification(&self, request_id: &str) -> Result<()> {
        let res = reqwest::Client::new()
            .post(self.url(&format!("/question/{request_id}/reject")))
            .send()
            .await?;

        if !res.status().is_success() {
            bail!("failed to reject the clarification request");
        }

        return Ok(());
    }

    /// Sends one user message to the session and streams the reply through
    /// the channel as `StreamEvent`s. The event subscription opens first with
    /// a short head start, and existing message ids form a replay-suppression
    /// baseline.
    pub async fn send_message(
        &self,
        session_id: &str,
        text: &str,
        tx: &mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<()> {
        let _ = tx.send(StreamEvent::StreamStart);

        let known_message_ids = self.known_message_ids(session_id).await;
        let subscriber = self.clone();
        let subscriber_session = session_id.to_string();
        let subscriber_tx = tx.clone();
        let subscription = tokio::spawn(async move {
            return subscriber
                .subscribe_events(&subscriber_session, &subscriber_tx, known_message_ids)
                .await;
        });

        tokio::time::sleep(SUBSCRIBE_HEAD_START).await;

        if let Err(err) = self.post_prompt(session_id, text).await {
            subscription.abort();
            return Err(err);
        }

        return match subscription.await {
            Ok(res) => res,
            Err(err) => bail!("event subscription task failed: {err}"),
        };
    }

    async fn post_prompt(&self, session_id: &str, text: &str) -> Result<()> {
        let body = json!({
            "parts": [{"type": "text", "text": text}]
        });

        let res = reqwest::Client::new()
            .post(self.url(&format!("/session/{session_id}/prompt_async")))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !res.status().is_success() {
            tracing::error!(status = res.status().as_u16(), "failed to post the prompt");
            bail!("failed to post the prompt to the remote session");
        }

        return Ok(());
    }

    /// Message ids already in the session before this send; part updates for
    /// them are replays, not new content.
    async fn known_message_ids(&self, session_id: &str) -> HashSet<String> {
        let mut ids = HashSet::new();
        if let Ok(messages) = self.get_messages(session_id).await {
            for message in messages {
                ids.insert(message.info.id);
            }
        }

        return ids;
    }

    async fn subscribe_events(
        &self,
        session_id: &str,
        tx: &mpsc::UnboundedSender<StreamEvent>,
        known_message_ids: HashSet<String>,
    ) -> Result<()> {
        let res = reqwest::Client::new()
            .get(self.url("/global/event"))
            .header("accept", "text/event-stream")
            .send()
            .await?;

        if !res.status().is_success() {
            tracing::error!(status = res.status().as_u16(), "failed to open the event stream");
            bail!("failed to open the remote event stream");
        }

        let stream = res.bytes_stream().map_err(convert_err);
        let mut lines_reader = StreamReader::new(stream).lines();

        let mut state = SubscriptionState {
            known_message_ids,
            user_message_ids: HashSet::new(),
            text_lengths: HashMap::new(),
            started_tools: HashSet::new(),
        };

        while let Ok(line) = lines_reader.next_line().await {
            if line.is_none() {
                break;
            }

            let line = line.unwrap();
            let cleaned = line.trim();
            if !cleaned.starts_with("data:") {
                continue;
            }
            let data = cleaned[5..].trim();
            if data.is_empty() {
                continue;
            }

            let envelope: EventEnvelope = match serde_json::from_str(data) {
                Ok(envelope) => envelope,
                Err(_) => continue,
            };

            if handle_envelope(envelope, session_id, tx, &mut state) {
                return Ok(());
            }
        }

        // The service hung up without settling the turn; the engine treats
        // this as a terminal error through the normal path.
        bail!("remote event stream ended before the turn settled");
    }
}

/// Returns true when the turn settled (terminal event emitted).
fn handle_envelope(
    envelope: EventEnvelope,
    session_id: &str,
    tx: &mpsc::UnboundedSender<StreamEvent>,
    state: &mut SubscriptionState,
) -> bool {
    match envelope.payload.event_type.as_str() {
        "message.part.updated" => {
            let part: EventPart = match serde_json::from_value(
                envelope
                    .payload
                    .properties
                    .get("part")
                    .cloned()
                    .unwrap_or(Value::Null),
            ) {
                Ok(part) => part,
                Err(_) => return false,
            };

            if part.session_id != session_id {
                return false;
            }
            if let Some(message_id) = &part.message_id {
                if state.known_message_ids.contains(message_id)
                    || state.user_message_ids.contains(message_id)
                {
                    return false;
                }
            }

            handle_part(part, tx, state);
            return false;
        }
        "message.updated" => {
            return handle_message_update(&envelope.payload.properties, session_id, tx, state);
        }
        "session.idle" => {
            let idle_session = envelope
                .payload
                .properties
                .get("sessionID")
                .and_then(|e| return e.as_str())
                .unwrap_or("");
            if idle_session == session_id {
                let _ = tx.send(StreamEvent::StreamEnd);
                return true;
            }
            return false;
        }
        _ => return false,
    }
}

fn handle_part(part: EventPart, tx: &mpsc::UnboundedSender<StreamEvent>, state: &mut SubscriptionState) {
    match part.part_type.as_str() {
        // Text and reasoning parts arrive as growing full-text snapshots;
        // only the unseen suffix is forwarded.
        "text" | "reasoning" => {
            let full_text = match &part.text {
                Some(text) => text,
                None => return,
            };
            let prev_len = state.text_lengths.get(&part.id).copied().unwrap_or(0);
            if full_text.len() <= prev_len {
                return;
            }

            let delta = full_text[prev_len..].to_string();
            state.text_lengths.insert(part.id.clone(), full_text.len());
            let event = if part.part_type == "text" {
                StreamEvent::Delta { text: delta }
            } else {
                StreamEvent::Reasoning { text: delta }
            };
            let _ = tx.send(event);
        }
        "tool" => {
            let call_id = part.call_id.clone().unwrap_or_default();
            let tool_name = part.tool.clone().unwrap_or_else(|| return "unknown".to_string());
            let tool_state = match &part.state {
                Some(tool_state) => tool_state,
                None => return,
            };
            let status = tool_state
                .get("status")
                .and_then(|e| return e.as_str())
                .unwrap_or("");

            match status {
                "running" => {
                    if state.started_tools.insert(call_id.clone()) {
                        let _ = tx.send(StreamEvent::ToolStart {
                            id: call_id,
                            name: tool_name,
                        });
                    }
                }
                "completed" => {
                    // The running update can be missed entirely on fast tools.
                    if state.started_tools.insert(call_id.clone()) {
                        let _ = tx.send(StreamEvent::ToolStart {
                            id: call_id.clone(),
                            name: tool_name,
                        });
                    }

                    let output = tool_state
                        .get("metadata")
                        .and_then(|e| return e.get("output"))
                        .and_then(|e| return e.as_str())
                        .or_else(|| {
                            return tool_state.get("output").and_then(|e| return e.as_str());
                        })
                        .unwrap_or("")
                        .to_string();

                    let _ = tx.send(StreamEvent::ToolEnd {
                        id: call_id,
                        result: output,
                    });
                }
                "error" => {
                    let error_msg = tool_state
                        .get("error")
                        .and_then(|e| return e.as_str())
                        .unwrap_or("Tool execution failed");

                    let _ = tx.send(StreamEvent::ToolEnd {
                        id: call_id,
                        result: format!("[error] {error_msg}"),
                    });
                }
                _ => {}
            }
        }
        "step-start" => {
            let _ = tx.send(StreamEvent::Status {
                text: "Thinking...".to_string(),
            });
        }
        _ => {}
    }
}

fn handle_message_update(
    properties: &Value,
    session_id: &str,
    tx: &mpsc::UnboundedSender<StreamEvent>,
    state: &mut SubscriptionState,
) -> bool {
    let info = match properties.get("info") {
        Some(info) => info,
        None => return false,
    };

    let message_session = info
        .get("sessionID")
        .and_then(|e| return e.as_str())
        .unwrap_or("");
    if message_session != session_id {
        return false;
    }

    let role = info.get("role").and_then(|e| return e.as_str()).unwrap_or("");
    let message_id = info.get("id").and_then(|e| return e.as_str()).unwrap_or("");

    if role == "user" && !message_id.is_empty() {
        state.user_message_ids.insert(message_id.to_string());
    }

    if let Some(tokens) = info.get("tokens") {
        let input = tokens
            .get("input")
            .and_then(|e| return e.as_u64())
            .unwrap_or(0);
        let output = tokens
            .get("output")
            .and_then(|e| return e.as_u64())
            .unwrap_or(0);
        if input > 0 || output > 0 {
            let _ = tx.send(StreamEvent::Usage {
                input_tokens: input,
                output_tokens: output,
            });
        }
    }

    if role == "assistant" {
        let has_error = info.get("error").map_or(false, |e| return !e.is_null());
        if has_error && !state.known_message_ids.contains(message_id) {
            tracing::debug!(message_id = message_id, "assistant message reported an error");
            let _ = tx.send(StreamEvent::StreamEnd);
            return true;
        }
    }

    return false;
}

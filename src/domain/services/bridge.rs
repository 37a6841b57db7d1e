#[cfg(test)]
#[path = "bridge_test.rs"]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;

use super::CoreSignals;
use super::SessionStore;
use crate::domain::models::Message;
use crate::domain::models::Role;
use crate::domain::models::Session;
use crate::infrastructure::remote::RemoteClient;
use crate::infrastructure::remote::RemoteMessage;
use crate::infrastructure::remote::RemoteSession;

/// Reachability re-probe cadence.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);
/// Active-session message poll cadence.
const MESSAGE_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Session-list poll cadence.
const LIST_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// A message poll this soon after a turn ended would re-fetch content the
/// engine just finalized locally, duplicating or stuttering the rendered
/// reply.
const TURN_COOLDOWN: Duration = Duration::from_secs(15);

const UNTITLED_SESSION: &str = "Untitled chat";

/// Keeps local session state consistent with the remote session service
/// without colliding with an active turn. The poll loops only read and
/// merge; `reload_sessions` is the one authoritative refresh.
pub struct RemoteBridge {
    client: RemoteClient,
    store: Arc<SessionStore>,
    signals: Arc<CoreSignals>,
}

impl RemoteBridge {
    pub fn new(
        client: RemoteClient,
        store: Arc<SessionStore>,
        signals: Arc<CoreSignals>,
    ) -> RemoteBridge {
        return RemoteBridge {
            client,
            store,
            signals,
        };
    }

    /// One-shot startup reconciliation, run once local persistence has
    /// finished loading: remote reachable means the remote list becomes the
    /// session list; unreachable means full local hydration.
    pub async fn startup(&self) {
        self.store.hydrate_continuity();
        if self.probe().await {
            if self.load_remote_sessions().await {
                return;
            }
        }
        self.store.hydrate_sessions();
    }

    /// Authoritative refresh on demand: re-probes, and on success fully
    /// replaces the local list with the remote one (unlike the accretive
    /// background poll).
    pub async fn reload_sessions(&self) -> Result<()> {
        if !self.probe().await {
            bail!("remote session service is unreachable");
        }
        if !self.load_remote_sessions().await {
            bail!("failed to fetch the remote session list");
        }
        return Ok(());
    }

    pub fn spawn_pollers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![];

        let bridge = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(PROBE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                bridge.probe().await;
            }
        }));

        let bridge = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(MESSAGE_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !bridge.poll_gate_open() || !bridge.signals.turn_cooldown_elapsed(TURN_COOLDOWN)
                {
                    continue;
                }
                bridge.sync_active_messages().await;
            }
        }));

        let bridge = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(LIST_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !bridge.poll_gate_open() {
                    continue;
                }
                bridge.refresh_session_list().await;
            }
        }));

        return handles;
    }

    /// Single reachability probe, updating the shared connected flag the
    /// facade uses to pick the send path.
    pub async fn probe(&self) -> bool {
        let reachable = match self.client.health_check().await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(error = ?err, "remote session service probe failed");
                false
            }
        };
        self.signals.set_connected(reachable);
        return reachable;
    }

    /// Fetches remote messages for the active session and merges in only the
    /// ones not already present (by-id de-duplication, never replacement).
    pub async fn sync_active_messages(&self) {
        let session = match self.store.active_session() {
            Some(session) => session,
            None => return,
        };
        let remote_id = match session.remote_id {
            Some(remote_id) => remote_id,
            None => return,
        };

        match self.client.get_messages(&remote_id).await {
            Ok(remote) => {
                self.store
                    .merge_messages(&session.id, convert_messages(remote));
            }
            Err(err) => {
                // Background poll: existing state stays untouched.
                tracing::debug!(error = ?err, "active session message poll failed");
            }
        }
    }

    /// Accretive list poll: prepends sessions the store does not know yet,
    /// never removing or reordering what the user already sees.
    pub async fn refresh_session_list(&self) {
        match self.client.list_sessions().await {
            Ok(remote) => {
                self.store.merge_unknown_sessions(convert_sessions(remote));
            }
            Err(err) => {
                tracing::debug!(error = ?err, "session list poll failed");
            }
        }
    }

    fn poll_gate_open(&self) -> bool {
        return self.signals.is_focused()
            && self.signals.is_connected()
            && !self.signals.is_streaming();
    }

    async fn load_remote_sessions(&self) -> bool {
        match self.client.list_sessions().await {
            Ok(remote) => {
                self.store.replace_sessions(convert_sessions(remote));
                return true;
            }
            Err(err) => {
                tracing::warn!(error = ?err, "failed to fetch the remote session list");
                return false;
            }
        }
    }
}

/// Only top-level sessions are surfaced; sub-sessions of another session are
/// dropped.
fn convert_sessions(remote: Vec<RemoteSession>) -> Vec<Session> {
    return remote
        .into_iter()
        .filter(|e| return e.parent_id.is_none())
        .map(convert_session)
        .collect();
}

fn convert_session(remote: RemoteSession) -> Session {
    let name = remote
        .title
        .filter(|e| return !e.is_empty())
        .unwrap_or_else(|| return UNTITLED_SESSION.to_string());
    let created_at = remote
        .time
        .as_ref()
        .map(|e| return e.created as i64)
        .unwrap_or_else(|| return Utc::now().timestamp_millis());

    let mut session = Session::new(&remote.id, &name);
    session.created_at = created_at;
    session.remote_id = Some(remote.id);
    return session;
}

/// Remote messages map only for user/assistant roles; anything else drops
/// silently. Text parts concatenate in their given order.
fn convert_messages(remote: Vec<RemoteMessage>) -> Vec<Message> {
    let mut messages = vec![];
    for entry in remote {
        let role = match entry.info.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => continue,
        };

        let content = entry
            .parts
            .iter()
            .filter(|e| return e.part_type == "text")
            .filter_map(|e| return e.text.clone())
            .collect::<Vec<String>>()
            .join("");

        let mut message = Message::new(role, &content);
        message.id = entry.info.id;
        if let Some(time) = entry.info.time {
            message.timestamp = time.created as i64;
        }
        messages.push(message);
    }

    return messages;
}

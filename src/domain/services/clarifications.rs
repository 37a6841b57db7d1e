#[cfg(test)]
#[path = "clarifications_test.rs"]
mod tests;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

use super::CoreSignals;
use super::SessionStore;
use crate::domain::models::ClarificationRequest;
use crate::infrastructure::remote::RemoteClient;

/// Poll faster while a turn streams — clarifications usually arrive
/// mid-generation.
const STREAMING_POLL: Duration = Duration::from_secs(2);
const IDLE_POLL: Duration = Duration::from_secs(5);

/// Side-channel surfacing backend-issued clarification requests for the
/// active remote session. At most one request is surfaced at a time.
pub struct ClarificationChannel {
    client: RemoteClient,
    store: Arc<SessionStore>,
    signals: Arc<CoreSignals>,
    surfaced: Mutex<Option<ClarificationRequest>>,
}

impl ClarificationChannel {
    pub fn new(
        client: RemoteClient,
        store: Arc<SessionStore>,
        signals: Arc<CoreSignals>,
    ) -> ClarificationChannel {
        return ClarificationChannel {
            client,
            store,
            signals,
            surfaced: Mutex::new(None),
        };
    }

    pub fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        return tokio::spawn(async move {
            loop {
                let delay = if channel.signals.is_streaming() {
                    STREAMING_POLL
                } else {
                    IDLE_POLL
                };
                tokio::time::sleep(delay).await;
                channel.poll_once().await;
            }
        });
    }

    /// Fetches all pending requests and surfaces the one addressed to the
    /// active session's remote id, if any. Disabled without a remote-backed
    /// active session.
    pub async fn poll_once(&self) {
        let remote_id = match self.store.active_remote_id() {
            Some(remote_id) => remote_id,
            None => {
                *self.surfaced.lock().unwrap() = None;
                return;
            }
        };

        match self.client.pending_clarifications().await {
            Ok(pending) => {
                let surfaced = pending
                    .into_iter()
                    .find(|e| return e.session_id.as_deref() == Some(remote_id.as_str()));
                *self.surfaced.lock().unwrap() = surfaced;
            }
            Err(err) => {
                // Poll failure leaves whatever is surfaced untouched.
                tracing::debug!(error = ?err, "clarification poll failed");
            }
        }
    }

    pub fn pending(&self) -> Option<ClarificationRequest> {
        return self.surfaced.lock().unwrap().clone();
    }

    /// Submits answers — one inner list per sub-question, multi-select
    /// supported. The request stays pending on failure so the user can retry.
    pub async fn reply(&self, request_id: &str, answers: Vec<Vec<String>>) -> Result<()> {
        self.client.reply_clarification(request_id, answers).await?;
        self.clear(request_id);
        return Ok(());
    }

    /// Dismisses without answering, same success/failure handling as reply.
    pub async fn reject(&self, request_id: &str) -> Result<()> {
        self.client.reject_clarification(request_id).await?;
        self.clear(request_id);
        return Ok(());
    }

    fn clear(&self, request_id: &str) {
        let mut surfaced = self.surfaced.lock().unwrap();
        if surfaced.as_ref().is_some_and(|e| return e.id == request_id) {
            *surfaced = None;
        }
    }
}

#[cfg(test)]
#[path = "facade_test.rs"]
mod tests;

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::models::BackendBox;
use crate::domain::models::BackendPrompt;
use crate::domain::models::ClarificationRequest;
use crate::domain::models::Message;
use crate::domain::models::MessageImage;
use crate::domain::models::Role;
use crate::domain::models::Session;
use crate::domain::models::StreamEvent;
use crate::domain::services::ClarificationChannel;
use crate::domain::services::CoreSignals;
use crate::domain::services::RemoteBridge;
use crate::domain::services::SessionStore;
use crate::domain::services::StreamingEngine;
use crate::domain::services::VisibilityScheduler;
use crate::infrastructure::remote::RemoteClient;
use crate::infrastructure::stores::DocumentStore;

const UNSUPPORTED_ATTACHMENT_NOTICE: &str =
    "Image attachments aren't supported in remote-backed sessions yet. Send text only, or work in a local session.";

/// The single interface presentation code talks to: composes the session
/// store, the streaming engine, the reconciliation bridge, and the
/// clarification channel. Must be constructed inside a tokio runtime.
pub struct AssistantCore {
    signals: Arc<CoreSignals>,
    store: Arc<SessionStore>,
    engine: Arc<StreamingEngine>,
    bridge: Arc<RemoteBridge>,
    clarifications: Arc<ClarificationChannel>,
    backend: Arc<BackendBox>,
    remote: RemoteClient,
    producer_task: Mutex<Option<JoinHandle<()>>>,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl AssistantCore {
    pub fn new(
        backend: BackendBox,
        remote: RemoteClient,
        docs: Arc<dyn DocumentStore>,
    ) -> AssistantCore {
        let signals = Arc::new(CoreSignals::new());
        let store = SessionStore::new(docs, Arc::clone(&signals));
        let scheduler = Arc::new(VisibilityScheduler::new(signals.subscribe_visible()));
        let engine = Arc::new(StreamingEngine::new(
            Arc::clone(&store),
            Arc::clone(&signals),
            scheduler,
        ));
        let bridge = Arc::new(RemoteBridge::new(
            remote.clone(),
            Arc::clone(&store),
            Arc::clone(&signals),
        ));
        let clarifications = Arc::new(ClarificationChannel::new(
            remote.clone(),
            Arc::clone(&store),
            Arc::clone(&signals),
        ));

        return AssistantCore {
            signals,
            store,
            engine,
            bridge,
            clarifications,
            backend: Arc::new(backend),
            remote,
            producer_task: Mutex::new(None),
            consumer_task: Mutex::new(None),
            pollers: Mutex::new(Vec::new()),
        };
    }

    /// Startup reconciliation plus the background poll loops.
    pub async fn start(&self) {
        self.bridge.startup().await;

        let mut pollers = self.pollers.lock().unwrap();
        pollers.extend(self.bridge.spawn_pollers());
        pollers.push(self.clarifications.spawn_poller());
    }

    /// Sends a user message on the active session, creating one from draft
    /// mode first. No-op while a turn is already streaming.
    pub async fn send_message(&self, text: &str, images: Vec<MessageImage>) -> Result<()> {
        if self.signals.is_streaming() {
            return Ok(());
        }
        let trimmed = text.trim().to_string();
        if trimmed.is_empty() && images.is_empty() {
            return Ok(());
        }

        let session_id = self.ensure_active_session(&trimmed).await;
        self.store
            .append_message(&session_id, Message::user(&trimmed, images.clone()));

        let session = match self.store.active_session() {
            Some(session) => session,
            None => return Ok(()),
        };
        let remote_path = self.signals.is_connected() && session.remote_id.is_some();

        if remote_path && !images.is_empty() {
            // The remote protocol carries no image channel in this mode.
            self.store.append_message(
                &session_id,
                Message::new(Role::Assistant, UNSUPPORTED_ATTACHMENT_NOTICE),
            );
            return Ok(());
        }

        // Closes the no-op window before the engine task gets scheduled.
        self.signals.set_streaming(true);

        let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
        let producer = if remote_path {
            let client = self.remote.clone();
            let remote_id = session.remote_id.clone().unwrap();
            let content = trimmed.clone();
            tokio::spawn(async move {
                // The remote path sends only the latest user message.
                if let Err(err) = client.send_message(&remote_id, &content, &tx).await {
                    tracing::error!(error = ?err, "remote send failed");
                    let _ = tx.send(StreamEvent::Error {
                        message: format!("{err}"),
                    });
                }
            })
        } else {
            let backend = Arc::clone(&self.backend);
            // The direct path carries the full message history.
            let prompt = BackendPrompt::new(session.messages.clone());
            tokio::spawn(async move {
                if let Err(err) = backend.get_completion(prompt, &tx).await {
                    tracing::error!(error = ?err, "completion request failed");
                    let _ = tx.send(StreamEvent::Error {
                        message: format!("{err:?}"),
                    });
                }
            })
        };

        let engine = Arc::clone(&self.engine);
        let engine_session = session_id.clone();
        let consumer = tokio::spawn(async move {
            engine.run_turn(&engine_session, rx).await;
        });

        *self.producer_task.lock().unwrap() = Some(producer);
        *self.consumer_task.lock().unwrap() = Some(consumer);

        return Ok(());
    }

    /// Stop button: the busy flag drops immediately, the producer is torn
    /// down, and the backend is best-effort told to stop generating. The
    /// engine still finalizes whatever partial content accumulated.
    pub fn abort_stream(&self) {
        self.engine.abort();

        if let Some(producer) = self.producer_task.lock().unwrap().take() {
            producer.abort();
        }

        if self.signals.is_connected() {
            if let Some(remote_id) = self.store.active_remote_id() {
                let client = self.remote.clone();
                tokio::spawn(async move {
                    if let Err(err) = client.abort(&remote_id).await {
                        tracing::warn!(error = ?err, "remote abort failed");
                    }
                });
            }
        }
    }

    pub fn add_session(&self) {
        self.store.add_session();
    }

    /// Switches the active session; a remote-backed session with no loaded
    /// messages gets its history lazily fetched and merged in.
    pub async fn switch_session(&self, id: &str) {
        if !self.store.switch_session(id) {
            return;
        }

        let needs_history = self
            .store
            .active_session()
            .map(|e| return e.is_remote_backed() && e.messages.is_empty())
            .unwrap_or(false);
        if needs_history && self.signals.is_connected() {
            self.bridge.sync_active_messages().await;
        }
    }

    /// Local delete always wins; the remote counterpart goes best-effort.
    pub fn delete_session(&self, id: &str) {
        let remote_id = self.store.delete_session(id);

        if let Some(remote_id) = remote_id {
            if self.signals.is_connected() {
                let client = self.remote.clone();
                tokio::spawn(async move {
                    if let Err(err) = client.delete_session(&remote_id).await {
                        tracing::warn!(error = ?err, "remote delete failed");
                    }
                });
            }
        }
    }

    pub fn rename_session(&self, id: &str, name: &str) {
        let remote_id = self.store.rename_session(id, name);

        if let Some(remote_id) = remote_id {
            if self.signals.is_connected() {
                let client = self.remote.clone();
                let title = name.to_string();
                tokio::spawn(async move {
                    if let Err(err) = client.rename_session(&remote_id, &title).await {
                        tracing::warn!(error = ?err, "remote rename failed");
                    }
                });
            }
        }
    }

    pub fn archive_session(&self, id: &str) {
        self.store.archive_session(id, true);
    }

    pub fn unarchive_session(&self, id: &str) {
        self.store.archive_session(id, false);
    }

    pub fn reorder_sessions(&self, from: usize, to: usize) {
        self.store.reorder_sessions(from, to);
    }

    pub async fn reload_sessions(&self) -> Result<()> {
        return self.bridge.reload_sessions().await;
    }

    // ---- Read surface ----

    pub fn sessions(&self) -> Vec<Session> {
        return self.store.sessions();
    }

    pub fn active_session(&self) -> Option<Session> {
        return self.store.active_session();
    }

    pub fn is_streaming(&self) -> bool {
        return self.signals.is_streaming();
    }

    pub fn remote_connected(&self) -> bool {
        return self.signals.is_connected();
    }

    pub fn usage(&self) -> u64 {
        return self.store.usage();
    }

    pub fn weekly_usage(&self) -> u64 {
        return self.store.weekly_usage();
    }

    pub fn pending_clarification(&self) -> Option<ClarificationRequest> {
        return self.clarifications.pending();
    }

    pub async fn reply_clarification(
        &self,
        request_id: &str,
        answers: Vec<Vec<String>>,
    ) -> Result<()> {
        return self.clarifications.reply(request_id, answers).await;
    }

    pub async fn reject_clarification(&self, request_id: &str) -> Result<()> {
        return self.clarifications.reject(request_id).await;
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        return self.backend.list_models().await;
    }

    // ---- Shell signal inputs ----

    pub fn set_focused(&self, focused: bool) {
        self.signals.set_focused(focused);
    }

    pub fn set_visible(&self, visible: bool) {
        self.signals.set_visible(visible);
    }

    /// Resolves once no turn is streaming. For embedders that need to block
    /// on a settled state (shutdown, tests).
    pub async fn wait_idle(&self) {
        let mut streaming = self.signals.subscribe_streaming();
        loop {
            if !*streaming.borrow() {
                return;
            }
            if streaming.changed().await.is_err() {
                return;
            }
        }
    }

    // ---- Internal ----

    /// Draft mode materializes into a session named from the truncated input
    /// text. When the bridge is connected the session is remote-backed;
    /// remote creation failure falls back to the direct path rather than
    /// losing the message.
    async fn ensure_active_session(&self, text: &str) -> String {
        if !self.store.is_draft() {
            if let Some(id) = self.store.active_session_id() {
                return id;
            }
        }

        let name = Session::name_from_input(text);
        let id = self.store.create_active_session(&name);

        if self.signals.is_connected() {
            match self.remote.create_session().await {
                Ok(remote) => {
                    let remote_id = remote.id.clone();
                    self.store.update_session(&id, |session| {
                        session.remote_id = Some(remote_id);
                    });
                    if let Err(err) = self.remote.rename_session(&remote.id, &name).await {
                        tracing::warn!(error = ?err, "failed to title the remote session");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = ?err, "remote session creation failed, sending directly");
                }
            }
        }

        return id;
    }
}

impl Drop for AssistantCore {
    fn drop(&mut self) {
        for poller in self.pollers.lock().unwrap().drain(..) {
            poller.abort();
        }
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use chrono::Local;
use chrono::LocalResult;
use chrono::TimeZone;
use chrono::Utc;
use chrono::Weekday;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use super::CoreSignals;
use crate::domain::models::Message;
use crate::domain::models::Session;
use crate::infrastructure::stores::DocumentStore;

/// Quiet period before a state change hits the document store.
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(500);

const DOC_SESSIONS: &str = "sessions";
const DOC_ACTIVE_SESSION: &str = "active-session-id";
const DOC_DRAFT: &str = "draft";
const DOC_ARCHIVED: &str = "archived-ids";
const DOC_USAGE: &str = "usage";
const DOC_WEEKLY_USAGE: &str = "weekly-usage";
const DOC_WEEKLY_RESET: &str = "weekly-reset-at";

#[derive(Default)]
struct StoreState {
    /// Display order, non-archived sessions always before archived ones.
    sessions: Vec<Session>,
    active_id: Option<String>,
    /// Draft mode: no active session, the next sent message creates one.
    draft: bool,
    /// Persisted separately from the sessions so archival survives a full
    /// remote resynchronization.
    archived_ids: HashSet<String>,
    usage: u64,
    weekly_usage: u64,
    weekly_reset_at: i64,
}

/// Authoritative in-memory session collection plus debounced persistence.
/// `update_session` is the single serialization point for every writer —
/// engine flushes, poll callbacks, and direct user actions alike.
pub struct SessionStore {
    state: Mutex<StoreState>,
    docs: Arc<dyn DocumentStore>,
    signals: Arc<CoreSignals>,
    persist_tx: mpsc::UnboundedSender<()>,
}

impl SessionStore {
    pub fn new(docs: Arc<dyn DocumentStore>, signals: Arc<CoreSignals>) -> Arc<SessionStore> {
        let (persist_tx, persist_rx) = mpsc::unbounded_channel::<()>();
        let store = Arc::new(SessionStore {
            state: Mutex::new(StoreState {
                draft: true,
                ..StoreState::default()
            }),
            docs,
            signals,
            persist_tx,
        });

        tokio::spawn(run_persist_loop(Arc::downgrade(&store), persist_rx));

        return store;
    }

    pub fn create_id() -> String {
        return Uuid::new_v4()
            .to_string()
            .split('-')
            .enumerate()
            .filter_map(|(idx, str)| {
                if idx > 1 {
                    return None;
                }
                return Some(str);
            })
            .collect::<Vec<&str>>()
            .join("-");
    }

    // ---- Hydration ----

    /// Restores the continuity keys that are always locally persisted, even
    /// when the remote service owns session content.
    pub fn hydrate_continuity(&self) {
        let mut state = self.state.lock().unwrap();

        if let Some(val) = self.docs.get(DOC_ARCHIVED) {
            if let Ok(ids) = serde_json::from_value::<Vec<String>>(val) {
                state.archived_ids = ids.into_iter().collect();
            }
        }
        if let Some(val) = self.docs.get(DOC_ACTIVE_SESSION) {
            state.active_id = val.as_str().map(|e| return e.to_string());
        }
        state.draft = match self.docs.get(DOC_DRAFT) {
            Some(val) => val.as_bool().unwrap_or(state.active_id.is_none()),
            None => state.active_id.is_none(),
        };
        if let Some(val) = self.docs.get(DOC_USAGE) {
            state.usage = val.as_u64().unwrap_or(0);
        }
        if let Some(val) = self.docs.get(DOC_WEEKLY_USAGE) {
            state.weekly_usage = val.as_u64().unwrap_or(0);
        }
        if let Some(val) = self.docs.get(DOC_WEEKLY_RESET) {
            state.weekly_reset_at = val.as_i64().unwrap_or(0);
        }

        SessionStore::apply_weekly_reset(&mut state);
    }

    /// Loads session content from the local document. A malformed payload is
    /// treated as absent — the store starts empty rather than throwing.
    pub fn hydrate_sessions(&self) {
        let mut state = self.state.lock().unwrap();

        let mut sessions: Vec<Session> = vec![];
        if let Some(val) = self.docs.get(DOC_SESSIONS) {
            match serde_json::from_value::<Vec<Session>>(val) {
                Ok(loaded) => sessions = loaded,
                Err(err) => {
                    tracing::warn!(error = ?err, "persisted sessions are malformed, starting empty");
                }
            }
        }

        for session in sessions.iter_mut() {
            // Crash recovery: a message that was mid-stream when the process
            // last died must never come back as still streaming.
            for message in session.messages.iter_mut() {
                message.is_streaming = false;
                message.status_text = None;
            }
            if state.archived_ids.contains(&session.id) {
                session.archived = true;
            }
            if session.archived {
                state.archived_ids.insert(session.id.clone());
            }
        }
        sessions.sort_by_key(|e| return e.archived);
        state.sessions = sessions;

        SessionStore::revalidate_active(&mut state);
    }

    pub fn hydrate(&self) {
        self.hydrate_continuity();
        self.hydrate_sessions();
    }

    // ---- CRUD ----

    /// Enters draft mode: the next sent message creates a new session. No-op
    /// when already drafting.
    pub fn add_session(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.draft {
                return;
            }
            state.draft = true;
            state.active_id = None;
        }
        self.schedule_persist();
    }

    pub fn switch_session(&self, id: &str) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if !state.sessions.iter().any(|e| return e.id == id) {
                return false;
            }
            state.active_id = Some(id.to_string());
            state.draft = false;
        }
        self.schedule_persist();
        return true;
    }

    /// Creates the session a draft-mode send materializes into, and makes it
    /// active.
    pub fn create_active_session(&self, name: &str) -> String {
        let id = SessionStore::create_id();
        {
            let mut state = self.state.lock().unwrap();
            state.sessions.insert(0, Session::new(&id, name));
            state.active_id = Some(id.clone());
            state.draft = false;
        }
        self.schedule_persist();
        return id;
    }

    /// Removes the session locally and returns its remote id (if any) so the
    /// caller can fire the best-effort remote delete.
    pub fn delete_session(&self, id: &str) -> Option<String> {
        let remote_id;
        {
            let mut state = self.state.lock().unwrap();
            let idx = state.sessions.iter().position(|e| return e.id == id)?;
            let removed = state.sessions.remove(idx);
            remote_id = removed.remote_id;
            state.archived_ids.remove(id);
            if state.active_id.as_deref() == Some(id) {
                SessionStore::reselect_active(&mut state);
            }
        }
        self.schedule_persist();
        return remote_id;
    }

    /// Local rename; returns the remote id when the session is remote-backed
    /// so the caller can propagate.
    pub fn rename_session(&self, id: &str, name: &str) -> Option<String> {
        let mut remote_id = None;
        self.update_session(id, |session| {
            session.name = name.to_string();
            remote_id = session.remote_id.clone();
        });
        return remote_id;
    }

    pub fn archive_session(&self, id: &str, archived: bool) {
        {
            let mut state = self.state.lock().unwrap();
            match state.sessions.iter_mut().find(|e| return e.id == id) {
                Some(session) => session.archived = archived,
                None => return,
            }
            if archived {
                state.archived_ids.insert(id.to_string());
            } else {
                state.archived_ids.remove(id);
            }
            // Stable repartition: archived sessions sort after active ones
            // and keep their relative order.
            state.sessions.sort_by_key(|e| return e.archived);
            if archived && state.active_id.as_deref() == Some(id) {
                SessionStore::reselect_active(&mut state);
            }
        }
        self.schedule_persist();
    }

    /// Reorders within the non-archived prefix only.
    pub fn reorder_sessions(&self, from: usize, to: usize) {
        {
            let mut state = self.state.lock().unwrap();
            let visible = state.sessions.iter().filter(|e| return !e.archived).count();
            if from >= visible || to >= visible || from == to {
                return;
            }
            let session = state.sessions.remove(from);
            state.sessions.insert(to, session);
        }
        self.schedule_persist();
    }

    /// The single mutation primitive: applies a transform to one session by
    /// id. Safe to call from poll callbacks, flush callbacks, and user
    /// actions interleaved arbitrarily.
    pub fn update_session<F>(&self, id: &str, updater: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let found;
        {
            let mut state = self.state.lock().unwrap();
            match state.sessions.iter_mut().find(|e| return e.id == id) {
                Some(session) => {
                    updater(session);
                    found = true;
                }
                None => found = false,
            }
        }
        if found {
            self.schedule_persist();
        }
        return found;
    }

    pub fn append_message(&self, id: &str, message: Message) -> bool {
        return self.update_session(id, |session| {
            session.messages.push(message);
        });
    }

    pub fn merge_messages(&self, id: &str, messages: Vec<Message>) -> bool {
        return self.update_session(id, |session| {
            session.merge_messages(messages);
        });
    }

    // ---- Remote reconciliation entry points ----

    /// Authoritative replace used by startup and explicit reloads. The
    /// remembered active id is restored when still present; an empty list
    /// lands in draft mode.
    pub fn replace_sessions(&self, mut sessions: Vec<Session>) {
        {
            let mut state = self.state.lock().unwrap();
            for session in sessions.iter_mut() {
                if state.archived_ids.contains(&session.id) {
                    session.archived = true;
                }
            }
            sessions.sort_by_key(|e| return e.archived);
            state.sessions = sessions;
            SessionStore::revalidate_active(&mut state);
        }
        self.schedule_persist();
    }

    /// Accretive merge used by the background list poll: prepends sessions
    /// not already known, never removes or reorders what the user sees.
    pub fn merge_unknown_sessions(&self, incoming: Vec<Session>) {
        let mut changed = false;
        {
            let mut state = self.state.lock().unwrap();
            let fresh: Vec<Session> = incoming
                .into_iter()
                .filter(|e| return !SessionStore::knows_session(&state, e))
                .collect();
            for mut session in fresh.into_iter().rev() {
                if state.archived_ids.contains(&session.id) {
                    session.archived = true;
                }
                state.sessions.insert(0, session);
                changed = true;
            }
            if changed {
                state.sessions.sort_by_key(|e| return e.archived);
            }
        }
        if changed {
            self.schedule_persist();
        }
    }

    // ---- Usage counters ----

    pub fn bump_usage(&self, delta: u64) {
        {
            let mut state = self.state.lock().unwrap();
            SessionStore::apply_weekly_reset(&mut state);
            state.usage += delta;
            state.weekly_usage += delta;
        }
        self.schedule_persist();
    }

    pub fn usage(&self) -> u64 {
        return self.state.lock().unwrap().usage;
    }

    pub fn weekly_usage(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        SessionStore::apply_weekly_reset(&mut state);
        return state.weekly_usage;
    }

    // ---- Snapshots ----

    pub fn sessions(&self) -> Vec<Session> {
        return self.state.lock().unwrap().sessions.clone();
    }

    pub fn active_session(&self) -> Option<Session> {
        let state = self.state.lock().unwrap();
        let id = state.active_id.clone()?;
        return state.sessions.iter().find(|e| return e.id == id).cloned();
    }

    pub fn active_session_id(&self) -> Option<String> {
        return self.state.lock().unwrap().active_id.clone();
    }

    pub fn active_remote_id(&self) -> Option<String> {
        return self.active_session().and_then(|e| return e.remote_id);
    }

    pub fn is_draft(&self) -> bool {
        return self.state.lock().unwrap().draft;
    }

    pub fn archived_ids(&self) -> HashSet<String> {
        return self.state.lock().unwrap().archived_ids.clone();
    }

    // ---- Persistence ----

    fn schedule_persist(&self) {
        let _ = self.persist_tx.send(());
    }

    /// Writes the current state to the document store. Skipped entirely while
    /// a turn streams; while the bridge is connected the remote service owns
    /// session content, so only the continuity keys are written.
    pub async fn persist(&self) {
        if self.signals.is_streaming() {
            return;
        }
        let connected = self.signals.is_connected();

        let (sessions, active_id, draft, archived, usage, weekly_usage, weekly_reset) = {
            let state = self.state.lock().unwrap();
            let archived: Vec<String> = state.archived_ids.iter().cloned().collect();
            (
                state.sessions.clone(),
                state.active_id.clone(),
                state.draft,
                archived,
                state.usage,
                state.weekly_usage,
                state.weekly_reset_at,
            )
        };

        self.docs.set(DOC_ACTIVE_SESSION, json!(active_id));
        self.docs.set(DOC_DRAFT, json!(draft));
        self.docs.set(DOC_ARCHIVED, json!(archived));
        self.docs.set(DOC_USAGE, json!(usage));
        self.docs.set(DOC_WEEKLY_USAGE, json!(weekly_usage));
        self.docs.set(DOC_WEEKLY_RESET, json!(weekly_reset));
        if !connected {
            match serde_json::to_value(&sessions) {
                Ok(val) => self.docs.set(DOC_SESSIONS, val),
                Err(err) => tracing::warn!(error = ?err, "failed to serialize sessions"),
            }
        }

        if let Err(err) = self.docs.save().await {
            // Swallowed: the next state change retries naturally.
            tracing::warn!(error = ?err, "failed to persist session state");
        }
    }

    // ---- Internal ----

    fn knows_session(state: &StoreState, candidate: &Session) -> bool {
        return state.sessions.iter().any(|e| {
            return e.id == candidate.id
                || e.remote_id.as_deref() == Some(candidate.id.as_str())
                || (candidate.remote_id.is_some() && e.remote_id == candidate.remote_id);
        });
    }

    /// After delete/archive of the active session: first remaining
    /// non-archived session, or draft mode when none remain.
    fn reselect_active(state: &mut StoreState) {
        match state.sessions.iter().find(|e| return !e.archived) {
            Some(first) => {
                state.active_id = Some(first.id.clone());
                state.draft = false;
            }
            None => {
                state.active_id = None;
                state.draft = true;
            }
        }
    }

    /// Keeps the active pointer valid against the current session list.
    fn revalidate_active(state: &mut StoreState) {
        if state.draft {
            state.active_id = None;
            return;
        }
        let valid = state
            .active_id
            .as_ref()
            .is_some_and(|id| return state.sessions.iter().any(|e| return e.id == *id));
        if !valid {
            SessionStore::reselect_active(state);
        }
    }

    fn apply_weekly_reset(state: &mut StoreState) {
        let week_start = current_week_start_ms();
        if state.weekly_reset_at < week_start {
            state.weekly_usage = 0;
            state.weekly_reset_at = week_start;
        }
    }
}

async fn run_persist_loop(store: Weak<SessionStore>, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        // Coalesce rapid successive changes into one write after a quiet
        // period.
        loop {
            match timeout(PERSIST_DEBOUNCE, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        match store.upgrade() {
            Some(store) => store.persist().await,
            None => return,
        }
    }
}

/// Monday 00:00 of the current week in local wall-clock time, as epoch ms.
fn current_week_start_ms() -> i64 {
    let monday = Local::now().date_naive().week(Weekday::Mon).first_day();
    let midnight = monday.and_hms_opt(0, 0, 0).unwrap();
    return match midnight.and_local_timezone(Local) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(dt, _) => dt.timestamp_millis(),
        LocalResult::None => Utc.from_utc_datetime(&midnight).timestamp_millis(),
    };
}

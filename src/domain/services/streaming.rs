#[cfg(test)]
#[path = "streaming_test.rs"]
mod tests;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;

use super::CoreSignals;
use super::FlushScheduler;
use super::SessionStore;
use crate::domain::models::Message;
use crate::domain::models::StreamEvent;
use crate::domain::models::Turn;

/// Converts one ordered stream of backend events into mutations on exactly
/// one assistant message: placeholder in, coalesced flushes while events
/// arrive, a single finalize out.
pub struct StreamingEngine {
    store: Arc<SessionStore>,
    signals: Arc<CoreSignals>,
    scheduler: Arc<dyn FlushScheduler>,
    /// Token of the currently active turn. A turn whose token no longer
    /// matches is stale.
    active_turn: Mutex<Option<String>>,
    cancel_requested: AtomicBool,
}

impl StreamingEngine {
    pub fn new(
        store: Arc<SessionStore>,
        signals: Arc<CoreSignals>,
        scheduler: Arc<dyn FlushScheduler>,
    ) -> StreamingEngine {
        return StreamingEngine {
            store,
            signals,
            scheduler,
            active_turn: Mutex::new(None),
            cancel_requested: AtomicBool::new(false),
        };
    }

    /// User-initiated abort: drops the busy flag for the UI right away, sets
    /// the cancel flag, and invalidates the active-turn token. The running
    /// turn still reaches finalize, settling whatever partial content
    /// accumulated — cancellation is graceful truncation, not data loss.
    pub fn abort(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        *self.active_turn.lock().unwrap() = None;
        self.signals.set_streaming(false);
    }

    fn is_active(&self, token: &str) -> bool {
        return self.active_turn.lock().unwrap().as_deref() == Some(token);
    }

    /// Runs one turn to completion. The placeholder assistant message is
    /// inserted immediately; every event mutates the turn accumulator
    /// synchronously and schedules at most one pending flush.
    pub async fn run_turn(&self, session_id: &str, mut rx: mpsc::UnboundedReceiver<StreamEvent>) {
        let turn = Arc::new(Mutex::new(Turn::new()));
        let token = turn.lock().unwrap().token.clone();

        // Registering the fresh token is what makes this turn non-stale: a
        // cancel flag left over from a previous turn's abort must not kill
        // it, so the flag is deliberately not reset here.
        *self.active_turn.lock().unwrap() = Some(token.clone());
        self.signals.set_streaming(true);

        let placeholder = Message::placeholder();
        let placeholder_id = placeholder.id.clone();
        self.store.append_message(session_id, placeholder);

        loop {
            let event = rx.recv().await;

            // An event is a cancellation trigger only when the cancel flag is
            // set AND this turn has gone stale. The flag alone must not kill
            // an in-flight turn: a cancel aimed at a previous turn can land
            // after this one already started.
            if self.cancel_requested.load(Ordering::SeqCst) && !self.is_active(&token) {
                break;
            }

            let event = match event {
                Some(event) => event,
                // Producer gone without a terminal event: settle what we have.
                None => break,
            };

            match event {
                StreamEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    // Not accumulated in the turn; feeds the lifetime and
                    // weekly counters immediately.
                    self.store.bump_usage(input_tokens + output_tokens);
                    continue;
                }
                other => {
                    let done = {
                        let mut turn = turn.lock().unwrap();
                        turn.apply(&other);
                        turn.done
                    };
                    if done {
                        break;
                    }
                }
            }

            self.schedule_flush(session_id, &placeholder_id, &turn);
        }

        self.finalize(session_id, &placeholder_id, &turn, &token);
    }

    fn schedule_flush(&self, session_id: &str, placeholder_id: &str, turn: &Arc<Mutex<Turn>>) {
        let store = Arc::clone(&self.store);
        let turn = Arc::clone(turn);
        let session_id = session_id.to_string();
        let message_id = placeholder_id.to_string();

        self.scheduler.schedule(Box::new(move || {
            let snapshot = turn.lock().unwrap().clone();
            store.update_session(&session_id, |session| {
                if let Some(message) = session
                    .messages
                    .iter_mut()
                    .find(|e| return e.id == message_id)
                {
                    // A flush that loses the race with finalize must not
                    // resurrect streaming state on a settled message.
                    if !message.is_streaming {
                        return;
                    }
                    message.content = snapshot.content;
                    message.status_text = snapshot.status;
                    message.reasoning = if snapshot.reasoning.is_empty() {
                        None
                    } else {
                        Some(snapshot.reasoning)
                    };
                    message.tool_activities = if snapshot.tools.is_empty() {
                        None
                    } else {
                        Some(snapshot.tools)
                    };
                }
            });
        }));
    }

    /// Invoked exactly once per turn, from the terminal-event path or the
    /// cancellation path. Three mutually exclusive outcomes: error bubble,
    /// empty-turn elision, or commit.
    fn finalize(
        &self,
        session_id: &str,
        placeholder_id: &str,
        turn: &Arc<Mutex<Turn>>,
        token: &str,
    ) {
        self.scheduler.cancel();
        let snapshot = turn.lock().unwrap().clone();
        let message_id = placeholder_id.to_string();

        if let Some(error) = snapshot.error {
            self.store.update_session(session_id, |session| {
                if let Some(message) = session
                    .messages
                    .iter_mut()
                    .find(|e| return e.id == message_id)
                {
                    message.content = format!("Error: {error}");
                    message.is_streaming = false;
                    message.status_text = None;
                    // Whatever tools ran before the failure stay visible.
                    message.tool_activities = if snapshot.tools.is_empty() {
                        None
                    } else {
                        Some(snapshot.tools)
                    };
                }
            });
        } else if snapshot.content.trim().is_empty() && snapshot.tools.is_empty() {
            // Never persist an empty assistant bubble. A turn that ran tools
            // but produced no text is not empty — the activity stays.
            self.store.update_session(session_id, |session| {
                session.messages.retain(|e| return e.id != message_id);
            });
        } else {
            self.store.update_session(session_id, |session| {
                if let Some(message) = session
                    .messages
                    .iter_mut()
                    .find(|e| return e.id == message_id)
                {
                    message.content = snapshot.content;
                    message.is_streaming = false;
                    message.status_text = None;
                    message.reasoning = if snapshot.reasoning.is_empty() {
                        None
                    } else {
                        Some(snapshot.reasoning)
                    };
                    message.tool_activities = if snapshot.tools.is_empty() {
                        None
                    } else {
                        Some(snapshot.tools)
                    };
                }
            });
        }

        // Lets the bridge skip the next remote fetch for content this engine
        // just wrote itself.
        self.signals.mark_turn_ended();
        {
            let mut active = self.active_turn.lock().unwrap();
            if active.as_deref() == Some(token) {
                *active = None;
            }
        }
        self.signals.set_streaming(false);
    }
}

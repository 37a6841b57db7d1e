use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::watch;

/// Cross-callback coordination state shared by the engine, the store, the
/// bridge, and the clarification channel. One instance per core — explicit
/// fields instead of module globals, so exactly one owner hands it out.
pub struct CoreSignals {
    streaming_tx: watch::Sender<bool>,
    streaming_rx: watch::Receiver<bool>,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    focused_tx: watch::Sender<bool>,
    focused_rx: watch::Receiver<bool>,
    visible_tx: watch::Sender<bool>,
    visible_rx: watch::Receiver<bool>,
    last_turn_ended: Mutex<Option<Instant>>,
}

impl Default for CoreSignals {
    fn default() -> CoreSignals {
        return CoreSignals::new();
    }
}

impl CoreSignals {
    pub fn new() -> CoreSignals {
        let (streaming_tx, streaming_rx) = watch::channel(false);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (focused_tx, focused_rx) = watch::channel(true);
        let (visible_tx, visible_rx) = watch::channel(true);

        return CoreSignals {
            streaming_tx,
            streaming_rx,
            connected_tx,
            connected_rx,
            focused_tx,
            focused_rx,
            visible_tx,
            visible_rx,
            last_turn_ended: Mutex::new(None),
        };
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.streaming_tx.send_replace(streaming);
    }

    pub fn is_streaming(&self) -> bool {
        return *self.streaming_rx.borrow();
    }

    pub fn subscribe_streaming(&self) -> watch::Receiver<bool> {
        return self.streaming_rx.clone();
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected_tx.send_replace(connected);
    }

    pub fn is_connected(&self) -> bool {
        return *self.connected_rx.borrow();
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        return self.connected_rx.clone();
    }

    pub fn set_focused(&self, focused: bool) {
        self.focused_tx.send_replace(focused);
    }

    pub fn is_focused(&self) -> bool {
        return *self.focused_rx.borrow();
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible_tx.send_replace(visible);
    }

    pub fn is_visible(&self) -> bool {
        return *self.visible_rx.borrow();
    }

    pub fn subscribe_visible(&self) -> watch::Receiver<bool> {
        return self.visible_rx.clone();
    }

    /// Stamped by the engine at finalize so the bridge can skip re-fetching
    /// content it just watched stream in.
    pub fn mark_turn_ended(&self) {
        *self.last_turn_ended.lock().unwrap() = Some(Instant::now());
    }

    pub fn turn_cooldown_elapsed(&self, cooldown: Duration) -> bool {
        return match *self.last_turn_ended.lock().unwrap() {
            Some(ended) => ended.elapsed() >= cooldown,
            None => true,
        };
    }
}

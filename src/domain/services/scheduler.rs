#[cfg(test)]
#[path = "scheduler_test.rs"]
mod tests;

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One display frame at 60Hz. Flushes ride the frame cadence while the UI is
/// visible so a token burst costs one repaint, not hundreds.
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

pub type FlushFn = Box<dyn FnOnce() + Send + 'static>;

/// Coalesces streaming writes: at most one flush is pending at a time, and a
/// pending flush can be cancelled when the turn finalizes first.
pub trait FlushScheduler: Send + Sync {
    /// Schedules `flush` to run soon. No-op while another flush is pending.
    fn schedule(&self, flush: FlushFn);

    /// Cancels the pending flush, if any.
    fn cancel(&self);

    fn is_pending(&self) -> bool;
}

struct PendingFlush {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PendingFlush {
    fn new() -> PendingFlush {
        return PendingFlush {
            handle: Mutex::new(None),
        };
    }

    fn schedule(&self, delay: Duration, flush: FlushFn) {
        let mut pending = self.handle.lock().unwrap();
        if pending.as_ref().is_some_and(|e| return !e.is_finished()) {
            return;
        }

        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            flush();
        }));
    }

    fn cancel(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn is_pending(&self) -> bool {
        return self
            .handle
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|e| return !e.is_finished());
    }
}

/// Frame-aligned strategy used while the UI is visible.
pub struct FrameScheduler {
    pending: PendingFlush,
}

impl Default for FrameScheduler {
    fn default() -> FrameScheduler {
        return FrameScheduler {
            pending: PendingFlush::new(),
        };
    }
}

impl FlushScheduler for FrameScheduler {
    fn schedule(&self, flush: FlushFn) {
        self.pending.schedule(FRAME_INTERVAL, flush);
    }

    fn cancel(&self) {
        self.pending.cancel();
    }

    fn is_pending(&self) -> bool {
        return self.pending.is_pending();
    }
}

/// Immediate-timer strategy used while the UI is hidden. Frame callbacks do
/// not fire reliably in the background, which would stall terminal events and
/// anything keyed off them.
pub struct TimerScheduler {
    pending: PendingFlush,
}

impl Default for TimerScheduler {
    fn default() -> TimerScheduler {
        return TimerScheduler {
            pending: PendingFlush::new(),
        };
    }
}

impl FlushScheduler for TimerScheduler {
    fn schedule(&self, flush: FlushFn) {
        self.pending.schedule(Duration::ZERO, flush);
    }

    fn cancel(&self) {
        self.pending.cancel();
    }

    fn is_pending(&self) -> bool {
        return self.pending.is_pending();
    }
}

/// Picks a strategy per flush from the shared visibility signal.
pub struct VisibilityScheduler {
    visible: watch::Receiver<bool>,
    frame: FrameScheduler,
    timer: TimerScheduler,
}

impl VisibilityScheduler {
    pub fn new(visible: watch::Receiver<bool>) -> VisibilityScheduler {
        return VisibilityScheduler {
            visible,
            frame: FrameScheduler::default(),
            timer: TimerScheduler::default(),
        };
    }
}

impl FlushScheduler for VisibilityScheduler {
    fn schedule(&self, flush: FlushFn) {
        if self.is_pending() {
            return;
        }

        if *self.visible.borrow() {
            self.frame.schedule(flush);
        } else {
            self.timer.schedule(flush);
        }
    }

    fn cancel(&self) {
        self.frame.cancel();
        self.timer.cancel();
    }

    fn is_pending(&self) -> bool {
        return self.frame.is_pending() || self.timer.is_pending();
    }
}

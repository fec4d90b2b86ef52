//! User-initiated abort.
//!
//! The first interrupt sets a shared flag: schedulers stop dispatching new
//! work, and in-flight fetches and installs run to their next commit point.
//! Later interrupts only repeat the notice.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    signals: AtomicU8,
}

/// Cloneable handle to one cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early once cancelled.
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_cancelled() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            thread::sleep(left.min(SLEEP_SLICE));
        }
    }

    /// Route SIGINT/SIGTERM to this token. Call once at startup.
    pub fn install_handler(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || {
            let count = state.signals.fetch_add(1, Ordering::SeqCst);
            state.requested.store(true, Ordering::SeqCst);
            if count == 0 {
                eprintln!("\nReceived interrupt, finishing in-flight work before exiting...");
            } else {
                eprintln!("\nStill waiting for in-flight work to reach a commit point...");
            }
        })
    }
}

//! Pause, resume and abort signalling plus progress reporting.
//!
//! A [`ControlHandle`] is a single-value switch shared between the caller and
//! the executor. The executor only samples it at the start of each block, so
//! a chunk in flight always completes or fails before a pause or abort
//! takes effect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::client::FinalizeReceipt;

/// Default interval at which a paused upload re-checks its control state.
pub const DEFAULT_PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Requested state of a running upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlState {
    /// Keep going
    #[default]
    Active,
    /// Stop before the next block until resumed or aborted
    Paused,
    /// Stop before the next block for good
    Aborted,
}

/// Caller-side switch controlling one or more uploads.
///
/// Cloning the handle shares the switch.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Arc<watch::Sender<ControlState>>,
}

impl ControlHandle {
    /// Create a handle in the [`ControlState::Active`] state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::Active);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    /// Pause before the next block.
    ///
    /// Has no effect once aborted.
    pub fn pause(&self) {
        self.transition(ControlState::Paused);
    }

    /// Resume a paused upload.
    ///
    /// Has no effect once aborted.
    pub fn resume(&self) {
        self.transition(ControlState::Active);
    }

    /// Abort before the next block. Aborting is final.
    pub fn abort(&self) {
        self.transition(ControlState::Aborted);
    }

    /// Whether [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.state() == ControlState::Aborted
    }

    /// Executor-side view of this switch.
    pub fn signal(&self) -> ControlSignal {
        ControlSignal {
            rx: self.tx.subscribe(),
        }
    }

    fn transition(&self, next: ControlState) {
        self.tx.send_if_modified(|state| {
            if *state == ControlState::Aborted || *state == next {
                return false;
            }
            tracing::debug!(from = ?*state, to = ?next, "Control state changed");
            *state = next;
            true
        });
    }
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Executor-side receiver of a [`ControlHandle`].
#[derive(Debug, Clone)]
pub struct ControlSignal {
    rx: watch::Receiver<ControlState>,
}

impl ControlSignal {
    /// Current state.
    pub fn state(&self) -> ControlState {
        *self.rx.borrow()
    }

    /// Wait while paused, re-checking at least every `poll_interval`.
    ///
    /// Returns [`ControlState::Active`] or [`ControlState::Aborted`].
    pub async fn wait_while_paused(&mut self, poll_interval: Duration) -> ControlState {
        let mut announced = false;

        loop {
            let state = *self.rx.borrow_and_update();
            if state != ControlState::Paused {
                return state;
            }

            if !announced {
                tracing::info!("Upload paused");
                announced = true;
            }

            match tokio::time::timeout(poll_interval, self.rx.changed()).await {
                Ok(Ok(())) | Err(_) => {}
                // Every handle is gone, nobody can resume
                Ok(Err(_)) => return ControlState::Aborted,
            }
        }
    }
}

/// Receives `(bytes_sent, total_bytes)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Receives the committed object after a successful finalize.
pub type CompletionCallback = Arc<dyn Fn(&FinalizeReceipt) + Send + Sync>;

/// Forwards progress to a callback without ever going backwards.
///
/// A restarted block re-sends bytes that were already counted; those are
/// not reported a second time.
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
    total: u64,
    reported: Option<u64>,
}

impl ProgressReporter {
    /// Report progress of a `total`-byte upload to `callback`.
    pub fn new(callback: Option<ProgressCallback>, total: u64) -> Self {
        Self {
            callback,
            total,
            reported: None,
        }
    }

    /// Record that `sent` bytes have been acknowledged.
    pub fn report(&mut self, sent: u64) {
        let sent = sent.min(self.total);
        if self.reported.is_some_and(|r| sent <= r) {
            return;
        }

        self.reported = Some(sent);
        if let Some(callback) = &self.callback {
            callback(sent, self.total);
        }
    }

    /// Highest value reported so far.
    pub fn reported(&self) -> u64 {
        self.reported.unwrap_or(0)
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("total", &self.total)
            .field("reported", &self.reported)
            .finish_non_exhaustive()
    }
}

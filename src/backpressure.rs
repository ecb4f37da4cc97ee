//! Per-session outbound back-pressure.
//!
//! Every DATA byte a session hands to the writer task is counted in its
//! [`Backlog`] until the writer task has put it on the channel. Once the
//! count reaches the high-water mark the session is *stalled*: writers park
//! their waker and stay suspended until the writer task drains the backlog
//! down to the low-water mark. The hysteresis avoids waking a writer for
//! every frame that leaves the queue.
//!
//! A stall is not an error. Deadlines on top of it belong to the caller.

use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

#[derive(Debug, Default)]
struct BacklogState {
    queued: usize,
    stalled: bool,
    waiters: Vec<Waker>,
}

/// Outbound byte counter with high/low watermarks.
#[derive(Debug)]
pub struct Backlog {
    high_water: usize,
    low_water: usize,
    state: Mutex<BacklogState>,
}

impl Backlog {
    /// Create a backlog. `low_water` must be below `high_water`.
    pub fn new(high_water: usize, low_water: usize) -> Self {
        debug_assert!(low_water < high_water);
        Self {
            high_water,
            low_water,
            state: Mutex::new(BacklogState::default()),
        }
    }

    /// Bytes queued but not yet written to the channel.
    pub fn queued(&self) -> usize {
        self.lock().queued
    }

    /// Check if writers are currently suspended.
    pub fn is_stalled(&self) -> bool {
        self.lock().stalled
    }

    /// Ready when the session may queue more bytes.
    ///
    /// While stalled the waker is parked and woken by [`Backlog::release`]
    /// or [`Backlog::wake_all`].
    pub fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.lock();
        if !state.stalled {
            return Poll::Ready(());
        }
        if !state.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            state.waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }

    /// Account `n` freshly queued bytes.
    pub fn add(&self, n: usize) {
        let mut state = self.lock();
        state.queued += n;
        if state.queued >= self.high_water {
            state.stalled = true;
        }
    }

    /// Account `n` bytes written out by the writer task.
    pub fn release(&self, n: usize) {
        let waiters = {
            let mut state = self.lock();
            state.queued = state.queued.saturating_sub(n);
            if state.stalled && state.queued <= self.low_water {
                state.stalled = false;
                std::mem::take(&mut state.waiters)
            } else {
                Vec::new()
            }
        };
        for waker in waiters {
            waker.wake();
        }
    }

    /// Wake every parked writer so it can observe a state change
    /// (close, failure) on its session.
    pub fn wake_all(&self) {
        let waiters = std::mem::take(&mut self.lock().waiters);
        for waker in waiters {
            waker.wake();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BacklogState> {
        // A poisoned lock only means a panicking thread held it; the counters stay usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

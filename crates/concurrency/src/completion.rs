//! Per-command completions
//!
//! Every submitted command owns a [`Completion`] shared between the caller's
//! [`PendingResult`] handle and the merger thread. The merger resolves it
//! once, after the batch containing the command has committed or aborted;
//! waiters block on a condvar, never poll.
//!
//! ## Cancellation
//!
//! A command moves `QUEUED → EXECUTING` when the merger takes it into a
//! batch. `cancel()` only wins the race while the command is still queued;
//! afterwards the caller observes the real outcome.

use corvid_core::{CorvidError, CorvidResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const QUEUED: u8 = 0;
const EXECUTING: u8 = 1;
const CANCELED: u8 = 2;

enum Slot<T> {
    Empty,
    Ready(CorvidResult<T>),
    Taken,
}

/// One-shot result cell resolved by the merger
pub(crate) struct Completion<T> {
    state: AtomicU8,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(QUEUED),
            slot: Mutex::new(Slot::Empty),
            ready: Condvar::new(),
        }
    }

    /// Claim the command for execution; false if it was canceled first
    pub(crate) fn begin_execution(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, EXECUTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn resolve(&self, result: CorvidResult<T>) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Empty) {
            *slot = Slot::Ready(result);
            self.ready.notify_all();
        }
    }

    fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(QUEUED, CANCELED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.resolve(Err(CorvidError::Canceled));
        }
        won
    }

    fn take(slot: &mut Slot<T>) -> Option<CorvidResult<T>> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(result) => Some(result),
            Slot::Taken => Some(Err(CorvidError::internal("command result already delivered"))),
            Slot::Empty => {
                *slot = Slot::Empty;
                None
            }
        }
    }
}

/// Caller-side handle to a queued command
///
/// The result is delivered once: after [`wait`](Self::wait),
/// [`wait_timeout`](Self::wait_timeout) or [`try_result`](Self::try_result)
/// returned it, later calls report an internal error.
pub struct PendingResult<T> {
    completion: Arc<Completion<T>>,
}

impl<T> PendingResult<T> {
    pub(crate) fn new(completion: Arc<Completion<T>>) -> Self {
        Self { completion }
    }

    /// Block until the command's batch committed or failed
    pub fn wait(self) -> CorvidResult<T> {
        let mut slot = self.completion.slot.lock();
        loop {
            if let Some(result) = Completion::take(&mut slot) {
                return result;
            }
            self.completion.ready.wait(&mut slot);
        }
    }

    /// Block for at most `timeout`
    ///
    /// On timeout returns [`CorvidError::OutcomeUnknown`]: the command may
    /// still commit. The handle stays usable for a later wait.
    pub fn wait_timeout(&self, timeout: Duration) -> CorvidResult<T> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut slot = self.completion.slot.lock();
        loop {
            if let Some(result) = Completion::take(&mut slot) {
                return result;
            }
            if self
                .completion
                .ready
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                if let Some(result) = Completion::take(&mut slot) {
                    return result;
                }
                return Err(CorvidError::OutcomeUnknown {
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
        }
    }

    /// Result if already available, without blocking
    pub fn try_result(&self) -> Option<CorvidResult<T>> {
        Completion::take(&mut self.completion.slot.lock())
    }

    /// True once the merger (or a cancel) resolved the command
    pub fn is_complete(&self) -> bool {
        !matches!(*self.completion.slot.lock(), Slot::Empty)
    }

    /// Cancel the command if it has not entered a batch yet
    ///
    /// Returns true if the command will never execute. A later wait
    /// returns [`CorvidError::Canceled`].
    pub fn cancel(&self) -> bool {
        self.completion.cancel()
    }
}

//! Shared rate-limit breaker for concurrent batch workers.
//!
//! One instance is shared by every worker of a bootstrap run. A rate-limit
//! failure opens a backoff window that all workers wait out together; the
//! first failure in a window sets its length and later ones piggyback on it.
//! Sustained failures, or a single unreachable-service failure, abort the
//! breaker for good.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::BreakerAborted;

/// Backoff schedule in seconds, indexed by consecutive failures.
pub const BACKOFF_SCHEDULE_SECS: [u64; 5] = [15, 30, 60, 120, 300];

/// Consecutive rate-limit failures that abort the breaker.
pub const ABORT_THRESHOLD: u32 = 5;

/// Maps a consecutive-failure count to the wait before the next attempt.
///
/// Counts past the end of the schedule clamp to its last entry.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use kyrograph::bootstrap::compute_backoff;
///
/// assert_eq!(compute_backoff(1), Duration::from_secs(15));
/// assert_eq!(compute_backoff(9), Duration::from_secs(300));
/// ```
#[must_use]
pub fn compute_backoff(consecutive_failures: u32) -> Duration {
    let last = BACKOFF_SCHEDULE_SECS.len() - 1;
    let index = usize::try_from(consecutive_failures.saturating_sub(1))
        .unwrap_or(last)
        .min(last);
    Duration::from_secs(BACKOFF_SCHEDULE_SECS[index])
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    resume_at: Option<Instant>,
    aborted: bool,
}

/// In-memory gate coordinating backoff among batch workers.
#[derive(Debug, Default)]
pub struct RateLimitBreaker {
    state: Mutex<BreakerState>,
    aborted: Notify,
}

impl RateLimitBreaker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until no backoff window is active.
    ///
    /// # Errors
    /// Returns `BreakerAborted` immediately, or as soon as the breaker aborts
    /// while waiting.
    pub async fn await_gate(&self) -> Result<(), BreakerAborted> {
        loop {
            let notified = self.aborted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let resume_at = {
                let state = self.state();
                if state.aborted {
                    return Err(BreakerAborted);
                }
                match state.resume_at {
                    Some(resume_at) if resume_at > Instant::now() => resume_at,
                    _ => return Ok(()),
                }
            };

            tokio::select! {
                () = tokio::time::sleep_until(resume_at) => {}
                () = &mut notified => {}
            }
        }
    }

    /// Records a rate-limit failure and opens a backoff window if none is active.
    ///
    /// Returns false once the failure threshold is reached; the breaker is
    /// then aborted and every waiter fails.
    pub fn start_backoff(&self) -> bool {
        let mut state = self.state();
        if state.aborted {
            return false;
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let failures = state.consecutive_failures;
        if failures >= ABORT_THRESHOLD {
            state.aborted = true;
            drop(state);
            tracing::warn!(failures, "rate-limit breaker aborted");
            self.aborted.notify_waiters();
            return false;
        }

        let now = Instant::now();
        if state.resume_at.map_or(true, |resume_at| resume_at <= now) {
            let wait = compute_backoff(failures);
            state.resume_at = Some(now + wait);
            tracing::warn!(failures, wait_secs = wait.as_secs(), "rate limited; backing off");
        }
        true
    }

    /// Resets the consecutive-failure counter.
    pub fn on_success(&self) {
        self.state().consecutive_failures = 0;
    }

    /// Forces the aborted state, failing every current and future gate wait.
    pub fn abort(&self) {
        let mut state = self.state();
        if state.aborted {
            return;
        }
        state.aborted = true;
        drop(state);
        tracing::warn!("rate-limit breaker aborted by caller");
        self.aborted.notify_waiters();
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state().aborted
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.state().consecutive_failures
    }
}

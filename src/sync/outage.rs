use std::sync::{Mutex, PoisonError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct OutageState {
    first_failure_at: Option<u64>,
    consecutive_failures: u64,
}

/// Tracks how long the primary transport has been failing without a
/// success in between.
///
/// The outage is active only once the failure streak is strictly longer
/// than the threshold.
#[derive(Debug)]
pub struct OutageTracker {
    threshold_ms: u64,
    state: Mutex<OutageState>,
}

impl OutageTracker {
    pub fn new(threshold_ms: u64) -> Self {
        Self {
            threshold_ms,
            state: Mutex::new(OutageState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, OutageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_failure(&self, now: u64) {
        let mut state = self.state();
        if state.first_failure_at.is_none() {
            state.first_failure_at = Some(now);
        }
        state.consecutive_failures += 1;
    }

    pub fn record_success(&self) {
        let mut state = self.state();
        if state.consecutive_failures > 0 {
            log::info!(
                "sync: primary transport recovered after {} failures",
                state.consecutive_failures
            );
        }
        *state = OutageState::default();
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.state().consecutive_failures
    }

    /// Length of the current failure streak, if any.
    pub fn failing_for(&self, now: u64) -> Option<u64> {
        self.state()
            .first_failure_at
            .map(|t| now.saturating_sub(t))
    }

    pub fn is_active(&self, now: u64) -> bool {
        self.failing_for(now)
            .map_or(false, |d| d > self.threshold_ms)
    }
}

//! Execution budget accounting for one streamed execution.
//!
//! The budget pauses while the host is deciding an approval, so wall
//! clock spent waiting on a human never reduces the remaining time.
//! Tool-provider time and kernel time do count.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ExecutionBudget {
    deadline: Option<Instant>,
    paused_since: Option<Instant>,
    paused_total: Duration,
}

impl ExecutionBudget {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            paused_since: None,
            paused_total: Duration::ZERO,
        }
    }

    /// Start a pause. Idempotent while already paused.
    pub fn pause(&mut self) {
        if self.paused_since.is_none() {
            self.paused_since = Some(Instant::now());
        }
    }

    /// End the current pause, crediting its duration back to the budget.
    pub fn resume(&mut self) {
        if let Some(since) = self.paused_since.take() {
            self.paused_total += since.elapsed();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }

    /// Remaining time, or `None` when the budget is unlimited.
    ///
    /// `deadline − now + paused_total + (now − paused_since)`: while
    /// paused the two `now` terms cancel, so the remaining time holds
    /// steady until the decision arrives.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = self.deadline?;
        let now = Instant::now();
        let credit = self.paused_total
            + self
                .paused_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or(Duration::ZERO);
        Some((deadline + credit).saturating_duration_since(now))
    }

    /// True once the budget is exhausted while not paused.
    pub fn expired(&self) -> bool {
        !self.is_paused() && self.remaining() == Some(Duration::ZERO)
    }
}

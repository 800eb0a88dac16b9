use std::time::Duration;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(retry_delay: Duration, max_retries: u32) -> Self {
        Self {
            retry_delay,
            max_retries,
        }
    }

    /// Delay before the next poll given the current failure streak.
    pub fn next_delay(&self, state: &RetryState, refresh_interval: Duration) -> Duration {
        if state.is_in_backoff() {
            self.retry_delay
        } else {
            refresh_interval
        }
    }

    pub fn budget_exceeded(&self, state: &RetryState) -> bool {
        state.consecutive_failures() > self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_DELAY, DEFAULT_MAX_RETRIES)
    }
}

#[derive(Debug, Clone)]
pub struct RetryState {
    consecutive_failures: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_in_backoff(&self) -> bool {
        self.consecutive_failures > 0
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

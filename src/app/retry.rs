use std::thread;
use std::time::{Duration, Instant};

/// Central retry/backoff settings: how many attempts, how long each may take,
/// an optional overall budget, and the pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    pub total_budget: Option<Duration>,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            per_attempt_timeout: Duration::from_secs(10),
            total_budget: None,
            backoff,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = timeout;
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.total_budget = Some(budget);
        self
    }

    /// Runs `attempt` until it succeeds, attempts run out, or the budget is spent.
    /// The closure receives the 1-based attempt number. The last error is returned.
    pub fn run<T, E>(&self, mut attempt: impl FnMut(u32) -> Result<T, E>) -> Result<T, E> {
        let deadline = self.total_budget.map(Deadline::after);
        let mut number = 1;
        loop {
            let err = match attempt(number) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if number >= self.max_attempts {
                return Err(err);
            }
            if let Some(deadline) = &deadline {
                if deadline.remaining() <= self.backoff {
                    return Err(err);
                }
            }
            thread::sleep(self.backoff);
            number += 1;
        }
    }
}

/// Fixed point in time derived from a start instant and a budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Sleeps for `interval`, never past the deadline.
    pub fn pause(&self, interval: Duration) {
        let sleep_for = interval.min(self.remaining());
        if !sleep_for.is_zero() {
            thread::sleep(sleep_for);
        }
    }
}

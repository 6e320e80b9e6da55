use std::time::Duration;

/// Bounded retry with an increasing backoff schedule.
///
/// `max_attempts` counts every delivery, the first one included. When the
/// schedule is shorter than the number of retries its last step repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(30),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the next delivery, given how many attempts have run.
    /// `None` once attempts are exhausted.
    pub fn delay_after(&self, attempts_made: u32) -> Option<Duration> {
        if attempts_made >= self.max_attempts {
            return None;
        }
        let idx = attempts_made.saturating_sub(1) as usize;
        Some(
            self.backoff
                .get(idx)
                .or_else(|| self.backoff.last())
                .copied()
                .unwrap_or(Duration::ZERO),
        )
    }
}

use std::thread;
use std::time::Duration;

/// A bounded retry schedule: at most `max_attempts` tries with a fixed
/// `interval` between consecutive tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Invoke `op` until it returns `Some`, up to the attempt budget.
    /// Sleeps between attempts but never after the last one. Returns
    /// `None` once the budget is exhausted.
    pub fn run<T>(&self, mut op: impl FnMut(u32) -> Option<T>) -> Option<T> {
        for attempt in 1..=self.max_attempts {
            if let Some(value) = op(attempt) {
                return Some(value);
            }
            if attempt < self.max_attempts {
                thread::sleep(self.interval);
            }
        }
        None
    }
}

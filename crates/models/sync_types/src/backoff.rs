use std::{
    cmp,
    time::Duration,
};

/// Exponential backoff over a bounded attempt budget.
///
/// Attempts are numbered from 1; `delay_for(n)` doubles the initial delay per
/// attempt, capped at `max_backoff`, and returns `None` once the budget is
/// exhausted.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    budget: Option<u32>,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            budget: None,
            num_failures: 0,
        }
    }

    pub fn with_budget(initial_backoff: Duration, max_backoff: Duration, budget: u32) -> Self {
        Self {
            budget: Some(budget),
            ..Self::new(initial_backoff, max_backoff)
        }
    }

    /// The delay before retrying the given 1-based attempt, independent of
    /// accumulated state.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return None;
        }
        if let Some(budget) = self.budget {
            if attempt > budget {
                return None;
            }
        }
        let p = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        Some(cmp::min(backoff, self.max_backoff))
    }

    /// Record a failure and return the delay before the next attempt, or
    /// `None` when the budget is exhausted.
    pub fn fail(&mut self) -> Option<Duration> {
        self.num_failures += 1;
        self.delay_for(self.num_failures)
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_budgeted_schedule() {
        let mut backoff = Backoff::with_budget(
            Duration::from_secs(2),
            Duration::from_secs(8),
            3,
        );
        assert_eq!(backoff.fail(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.fail(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.fail(), Some(Duration::from_secs(8)));
        assert_eq!(backoff.fail(), None);
        assert_eq!(backoff.failures(), 4);

        backoff.reset();
        assert_eq!(backoff.fail(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_unbudgeted_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.fail(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.fail(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.fail(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.fail(), Some(Duration::from_millis(800)));
        assert_eq!(backoff.fail(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.fail(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_delay_overflow_saturates() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(u32::MAX), Some(Duration::from_secs(8)));
        assert_eq!(backoff.delay_for(0), None);
    }
}

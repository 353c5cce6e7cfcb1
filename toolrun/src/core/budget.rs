//! Iteration budget for the run loop.

/// Default planner/executor round trips per run.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Counts planner/executor round trips against a fixed maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationBudget {
    max_iterations: u32,
    used: u32,
}

impl IterationBudget {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            used: 0,
        }
    }

    /// Claim the next iteration, returning its 1-indexed number.
    ///
    /// Returns `None` once `max_iterations` have been claimed.
    pub fn try_begin(&mut self) -> Option<u32> {
        if self.used >= self.max_iterations {
            return None;
        }
        self.used += 1;
        Some(self.used)
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_stops_after_max() {
        let mut budget = IterationBudget::new(2);
        assert_eq!(budget.try_begin(), Some(1));
        assert_eq!(budget.try_begin(), Some(2));
        assert_eq!(budget.try_begin(), None);
        assert_eq!(budget.used(), 2);
    }

    #[test]
    fn zero_budget_never_begins() {
        assert_eq!(IterationBudget::new(0).try_begin(), None);
    }
}

//! Admission ledger for the scheduler's resource budget

use scanflow_core::{ResourceBudget, ResourceCost};

/// Outcome of asking the ledger for room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Enough is free right now
    Admit,
    /// Fits the budget but not what is currently free
    Wait,
    /// Exceeds the whole budget; can never run
    Never,
}

/// Tracks reserved workers and memory against a fixed budget.
///
/// Only the scheduler loop touches the ledger, so reservations are plain
/// bookkeeping with no locking.
#[derive(Debug, Clone)]
pub struct BudgetLedger {
    budget: ResourceBudget,
    in_use: ResourceCost,
    peak: ResourceCost,
}

impl BudgetLedger {
    pub fn new(budget: ResourceBudget) -> Self {
        Self {
            budget,
            in_use: ResourceCost::default(),
            peak: ResourceCost::default(),
        }
    }

    #[must_use]
    pub fn budget(&self) -> ResourceBudget {
        self.budget
    }

    #[must_use]
    pub fn check(&self, cost: ResourceCost) -> Admission {
        if !cost.fits_within(&self.budget) {
            Admission::Never
        } else if self.in_use.workers + cost.workers <= self.budget.workers
            && self.in_use.memory_mb + cost.memory_mb <= self.budget.memory_mb
        {
            Admission::Admit
        } else {
            Admission::Wait
        }
    }

    /// Reserve `cost` if it fits right now
    pub fn try_acquire(&mut self, cost: ResourceCost) -> Admission {
        let admission = self.check(cost);
        if admission == Admission::Admit {
            self.in_use.workers += cost.workers;
            self.in_use.memory_mb += cost.memory_mb;
            self.peak.workers = self.peak.workers.max(self.in_use.workers);
            self.peak.memory_mb = self.peak.memory_mb.max(self.in_use.memory_mb);
        }
        admission
    }

    pub fn release(&mut self, cost: ResourceCost) {
        self.in_use.workers = self.in_use.workers.saturating_sub(cost.workers);
        self.in_use.memory_mb = self.in_use.memory_mb.saturating_sub(cost.memory_mb);
    }

    #[must_use]
    pub fn in_use(&self) -> ResourceCost {
        self.in_use
    }

    /// Highest simultaneous reservation seen
    #[must_use]
    pub fn peak(&self) -> ResourceCost {
        self.peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(workers: usize, memory_mb: u64) -> ResourceBudget {
        ResourceBudget { workers, memory_mb }
    }

    #[test]
    fn test_admit_wait_never() {
        let mut ledger = BudgetLedger::new(budget(2, 1000));
        assert_eq!(ledger.try_acquire(ResourceCost::new(1, 600)), Admission::Admit);
        assert_eq!(ledger.try_acquire(ResourceCost::new(1, 600)), Admission::Wait);
        assert_eq!(ledger.try_acquire(ResourceCost::new(1, 400)), Admission::Admit);
        assert_eq!(ledger.check(ResourceCost::new(3, 10)), Admission::Never);
        assert_eq!(ledger.check(ResourceCost::new(1, 2000)), Admission::Never);
        assert_eq!(ledger.in_use(), ResourceCost::new(2, 1000));
    }

    #[test]
    fn test_release_and_peak() {
        let mut ledger = BudgetLedger::new(budget(4, 4000));
        ledger.try_acquire(ResourceCost::new(3, 3000));
        ledger.release(ResourceCost::new(3, 3000));
        ledger.try_acquire(ResourceCost::new(1, 100));
        assert_eq!(ledger.in_use(), ResourceCost::new(1, 100));
        assert_eq!(ledger.peak(), ResourceCost::new(3, 3000));
    }
}

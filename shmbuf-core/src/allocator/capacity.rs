//! Sampled capacity checks.

use crate::error::{Result, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Utilization above which every allocation recomputes.
pub const HIGH_UTILIZATION: f64 = 0.9;

/// Decides when an allocation must recompute the allocated total.
///
/// Recomputing walks the allocated table, so it runs every `interval`
/// calls, plus on every call once utilization is high or when a single
/// slot is more than 1% of the budget.
pub(super) struct CapacityTracker {
    budget: u64,
    interval: u64,
    /// Allocation calls seen.
    calls: AtomicU64,
    /// Recomputations performed.
    checks: AtomicU64,
    /// Last computed utilization, as `f64` bits.
    utilization: AtomicU64,
}

impl CapacityTracker {
    pub fn new(budget: u64, interval: u64) -> Self {
        Self {
            budget,
            interval: interval.max(1),
            calls: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            utilization: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Count an allocation call and report whether it must recompute.
    pub fn should_check(&self, slot_len: u64) -> bool {
        let n = self.calls.fetch_add(1, Ordering::AcqRel) + 1;
        n % self.interval == 0
            || self.utilization() > HIGH_UTILIZATION
            || slot_len.saturating_mul(100) > self.budget
    }

    /// Record a recomputed total and fail if `slot_len` more would exceed
    /// the budget.
    pub fn check(&self, used: u64, slot_len: u64) -> Result<()> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let projected = used.saturating_add(slot_len);
        let utilization = projected as f64 / self.budget as f64;
        self.utilization
            .store(utilization.to_bits(), Ordering::Release);

        if projected > self.budget {
            return Err(StoreError::CapacityExceeded {
                requested: slot_len,
                used,
                budget: self.budget,
            });
        }
        Ok(())
    }

    pub fn utilization(&self) -> f64 {
        f64::from_bits(self.utilization.load(Ordering::Acquire))
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }
}

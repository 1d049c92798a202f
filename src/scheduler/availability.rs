//! Cross-allocation availability aggregation.
//!
//! Percentages are computed per allocation row (DST-normalized) and
//! averaged over the expected size of each mirror family, so a family with
//! rows that were never materialized still counts the absent capacity as
//! fully free.

use crate::model::{Allocation, ReservedSlot};

/// An allocation row together with the reserved slots that reference it.
#[derive(Debug, Clone)]
pub struct AllocationUsage {
    pub allocation: Allocation,
    pub slots: Vec<ReservedSlot>,
}

impl AllocationUsage {
    pub fn new(allocation: Allocation, slots: Vec<ReservedSlot>) -> Self {
        Self { allocation, slots }
    }

    fn availability(&self) -> f64 {
        self.allocation.normalized_availability(&self.slots)
    }
}

/// Overall availability in percent over any set of allocation rows.
/// Returns a value in `[0, 100]`; an empty set is 0 (nothing reservable).
pub fn availability_by_allocations(usages: &[AllocationUsage]) -> f64 {
    let mut total = 0.0;
    let mut count: i64 = 0;
    let mut expected: i64 = 0;

    for usage in usages {
        total += usage.availability();
        count += 1;
        if usage.allocation.is_master() {
            expected += i64::from(usage.allocation.quota);
        }
    }

    if expected == 0 {
        return 0.0;
    }

    // family members that don't exist as rows are untouched capacity
    let missing = (expected - count).max(0);
    total += missing as f64 * 100.0;

    total / expected as f64
}

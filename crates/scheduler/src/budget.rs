//! The dual worker budget: one global pool shared by all batches, plus a
//! per-batch cap. Acquire and release always move both counters together.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::warn;

use autoflow_core_types::BatchId;

struct BatchSlots {
    limit: usize,
    active: AtomicUsize,
}

pub struct WorkerBudget {
    global_limit: usize,
    global_active: AtomicUsize,
    batches: DashMap<BatchId, BatchSlots>,
}

impl WorkerBudget {
    pub fn new(global_limit: usize) -> Self {
        Self {
            global_limit: global_limit.max(1),
            global_active: AtomicUsize::new(0),
            batches: DashMap::new(),
        }
    }

    pub fn register_batch(&self, batch: BatchId, limit: usize) {
        self.batches.insert(
            batch,
            BatchSlots {
                limit: limit.max(1),
                active: AtomicUsize::new(0),
            },
        );
    }

    pub fn forget_batch(&self, batch: &BatchId) {
        self.batches.remove(batch);
    }

    pub fn global_limit(&self) -> usize {
        self.global_limit
    }

    pub fn global_active(&self) -> usize {
        self.global_active.load(Ordering::SeqCst)
    }

    pub fn has_global_capacity(&self) -> bool {
        self.global_active() < self.global_limit
    }

    pub fn batch_active(&self, batch: &BatchId) -> usize {
        self.batches
            .get(batch)
            .map(|slots| slots.active.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn batch_has_capacity(&self, batch: &BatchId) -> bool {
        self.batches
            .get(batch)
            .map(|slots| slots.active.load(Ordering::SeqCst) < slots.limit)
            .unwrap_or(false)
    }

    /// Take one global slot and one slot in `batch`, or neither.
    pub fn try_acquire(&self, batch: &BatchId) -> bool {
        let Some(slots) = self.batches.get(batch) else {
            return false;
        };
        if self
            .global_active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < self.global_limit).then_some(active + 1)
            })
            .is_err()
        {
            return false;
        }
        let acquired = slots
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < slots.limit).then_some(active + 1)
            })
            .is_ok();
        if !acquired {
            // Roll the global slot back; the pair moves atomically or not at
            // all.
            self.global_active.fetch_sub(1, Ordering::SeqCst);
        }
        acquired
    }

    /// Release the pair taken by [`WorkerBudget::try_acquire`].
    pub fn release(&self, batch: &BatchId) {
        if self
            .global_active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                active.checked_sub(1)
            })
            .is_err()
        {
            warn!(target: "scheduler", "global worker release with no active workers");
        }
        match self.batches.get(batch) {
            Some(slots) => {
                if slots
                    .active
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                        active.checked_sub(1)
                    })
                    .is_err()
                {
                    warn!(target: "scheduler", %batch, "batch worker release with no active workers");
                }
            }
            None => warn!(target: "scheduler", %batch, "release for unregistered batch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_caps_are_enforced() {
        let budget = WorkerBudget::new(3);
        let a = BatchId::new();
        let b = BatchId::new();
        budget.register_batch(a.clone(), 2);
        budget.register_batch(b.clone(), 2);

        assert!(budget.try_acquire(&a));
        assert!(budget.try_acquire(&a));
        // Batch cap reached, global still open.
        assert!(!budget.try_acquire(&a));
        assert!(budget.try_acquire(&b));
        // Global cap reached.
        assert!(!budget.try_acquire(&b));
        assert_eq!(budget.global_active(), 3);
        assert_eq!(budget.batch_active(&a), 2);
    }

    #[test]
    fn failed_batch_acquire_rolls_back_the_global_slot() {
        let budget = WorkerBudget::new(4);
        let a = BatchId::new();
        budget.register_batch(a.clone(), 1);
        assert!(budget.try_acquire(&a));
        assert!(!budget.try_acquire(&a));
        assert_eq!(budget.global_active(), 1);
    }

    #[test]
    fn release_restores_both_counters() {
        let budget = WorkerBudget::new(2);
        let a = BatchId::new();
        budget.register_batch(a.clone(), 1);
        assert!(budget.try_acquire(&a));
        budget.release(&a);
        assert_eq!(budget.global_active(), 0);
        assert!(budget.try_acquire(&a));
    }

    #[test]
    fn unknown_batch_never_acquires() {
        let budget = WorkerBudget::new(2);
        assert!(!budget.try_acquire(&BatchId::new()));
        assert_eq!(budget.global_active(), 0);
    }
}

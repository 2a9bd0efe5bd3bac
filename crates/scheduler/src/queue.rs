//! Priority/FIFO queue of executions waiting for a worker. Higher priority
//! dispatches first; within a priority, submission order wins.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use autoflow_core_types::{BatchId, ExecutionId};

#[derive(Clone, Debug)]
pub struct QueueItem {
    pub execution: ExecutionId,
    pub batch: BatchId,
    pub priority: i32,
    pub seq: u64,
}

fn sort_key(item: &QueueItem) -> (Reverse<i32>, u64) {
    (Reverse(item.priority), item.seq)
}

/// Kept sorted on insert so dispatch scans front to back.
#[derive(Default)]
pub struct ExecutionQueue {
    items: Mutex<Vec<QueueItem>>,
    seq: AtomicU64,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, execution: ExecutionId, batch: BatchId, priority: i32) {
        let item = QueueItem {
            execution,
            batch,
            priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.insert(item);
    }

    /// Re-insert an item with its original sequence number.
    pub fn requeue(&self, item: QueueItem) {
        self.insert(item);
    }

    fn insert(&self, item: QueueItem) {
        let mut items = self.items.lock();
        let position = items.partition_point(|existing| sort_key(existing) <= sort_key(&item));
        items.insert(position, item);
    }

    /// Remove and return the first item the predicate accepts, scanning past
    /// entries it rejects (e.g. batches at their worker cap).
    pub fn take_first(&self, mut accept: impl FnMut(&QueueItem) -> bool) -> Option<QueueItem> {
        let mut items = self.items.lock();
        let position = items.iter().position(|item| accept(item))?;
        Some(items.remove(position))
    }

    /// Remove a queued execution. Returns false when it was not queued (most
    /// likely already taken by dispatch).
    pub fn cancel(&self, execution: &ExecutionId) -> bool {
        let mut items = self.items.lock();
        match items.iter().position(|item| &item.execution == execution) {
            Some(position) => {
                items.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (BatchId, Vec<ExecutionId>) {
        (BatchId::new(), (0..4).map(|_| ExecutionId::new()).collect())
    }

    #[test]
    fn priority_then_submission_order() {
        let (batch, execs) = ids();
        let queue = ExecutionQueue::new();
        queue.push(execs[0].clone(), batch.clone(), 0);
        queue.push(execs[1].clone(), batch.clone(), 5);
        queue.push(execs[2].clone(), batch.clone(), 0);

        let order: Vec<ExecutionId> = std::iter::from_fn(|| queue.take_first(|_| true))
            .map(|item| item.execution)
            .collect();
        assert_eq!(
            order,
            vec![execs[1].clone(), execs[0].clone(), execs[2].clone()]
        );
    }

    #[test]
    fn take_first_scans_past_rejected_batches() {
        let blocked = BatchId::new();
        let open = BatchId::new();
        let queue = ExecutionQueue::new();
        let first = ExecutionId::new();
        let second = ExecutionId::new();
        queue.push(first.clone(), blocked.clone(), 0);
        queue.push(second.clone(), open.clone(), 0);

        let taken = queue.take_first(|item| item.batch == open).unwrap();
        assert_eq!(taken.execution, second);
        // The blocked entry keeps its place at the front.
        assert_eq!(queue.take_first(|_| true).unwrap().execution, first);
    }

    #[test]
    fn cancel_removes_only_queued_items() {
        let (batch, execs) = ids();
        let queue = ExecutionQueue::new();
        queue.push(execs[0].clone(), batch.clone(), 0);
        assert!(queue.cancel(&execs[0]));
        assert!(!queue.cancel(&execs[0]));
        assert!(queue.is_empty());
    }
}

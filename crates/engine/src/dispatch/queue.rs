//! Bounded priority queue of jobs waiting for a worker.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;

use tokio::sync::Notify;

use relay_core::{Amount, Job, TaskIdCommitment, TaskType};

/// Heap entry. Higher fee first, then task type rank, then older jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub commitment: TaskIdCommitment,
    pub id: i64,
    pub fee: Amount,
    pub task_type: TaskType,
}

impl From<&Job> for QueuedJob {
    fn from(job: &Job) -> Self {
        Self {
            commitment: job.commitment,
            id: job.id,
            fee: job.fee,
            task_type: job.task_type,
        }
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fee
            .cmp(&other.fee)
            .then_with(|| self.task_type.dispatch_rank().cmp(&other.task_type.dispatch_rank()))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    members: HashSet<TaskIdCommitment>,
    closed: bool,
}

/// Blocking max-heap shared by the producer and consumer loops.
///
/// `pop` waits until an entry arrives or the queue is closed. After `close`,
/// `pop` returns `None` immediately and pushes are ignored.
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Add entries, skipping ones already queued and ones beyond capacity.
    /// Returns how many were accepted.
    pub fn push<I>(&self, jobs: I) -> usize
    where
        I: IntoIterator<Item = QueuedJob>,
    {
        let accepted = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return 0;
            }
            let mut accepted = 0;
            for job in jobs {
                if state.heap.len() >= self.capacity {
                    break;
                }
                if state.members.insert(job.commitment) {
                    state.heap.push(job);
                    accepted += 1;
                }
            }
            accepted
        };
        if accepted > 0 {
            self.notify.notify_waiters();
        }
        accepted
    }

    pub async fn pop(&self) -> Option<QueuedJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.closed {
                    return None;
                }
                if let Some(job) = state.heap.pop() {
                    state.members.remove(&job.commitment);
                    return Some(job);
                }
            }
            notified.await;
        }
    }

    /// Idempotent. Wakes every waiting `pop`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn entry(byte: u8, id: i64, fee: u64, task_type: TaskType) -> QueuedJob {
        QueuedJob {
            commitment: TaskIdCommitment::repeat_byte(byte),
            id,
            fee: Amount::from(fee),
            task_type,
        }
    }

    #[tokio::test]
    async fn pops_by_fee_then_type_then_age() {
        let queue = DispatchQueue::new(10);
        queue.push([
            entry(1, 1, 5, TaskType::FineTune),
            entry(2, 2, 9, TaskType::Image),
            entry(3, 3, 5, TaskType::TextGeneration),
            entry(4, 4, 5, TaskType::Image),
            entry(5, 5, 5, TaskType::Image),
        ]);
        let mut order = Vec::new();
        while !queue.is_empty() {
            order.push(queue.pop().await.unwrap().id);
        }
        assert_eq!(order, vec![2, 3, 4, 5, 1]);
    }

    #[test]
    fn duplicates_and_overflow_are_dropped() {
        let queue = DispatchQueue::new(2);
        assert_eq!(queue.push([entry(1, 1, 1, TaskType::Image)]), 1);
        assert_eq!(queue.push([entry(1, 1, 1, TaskType::Image)]), 0);
        assert_eq!(
            queue.push([entry(2, 2, 1, TaskType::Image), entry(3, 3, 1, TaskType::Image)]),
            1
        );
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(DispatchQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push([entry(7, 7, 1, TaskType::Image)]);
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.map(|j| j.id), Some(7));
    }

    #[tokio::test]
    async fn close_releases_waiters_and_is_idempotent() {
        let queue = Arc::new(DispatchQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        queue.close();
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());
        assert!(queue.pop().await.is_none());
        assert_eq!(queue.push([entry(1, 1, 1, TaskType::Image)]), 0);
        assert!(queue.is_closed());
    }
}

//! Pending-task queue for batched execution.
//!
//! Callers accumulate work with [`ParallelExecutor::batch`] and later flush it
//! in one fan-out with [`ParallelExecutor::execute_batch`]. The queue is not
//! transactional: a flush takes whatever is queued at the moment it starts, and
//! tasks appended concurrently land in either that flush or the next one.
//!
//! [`ParallelExecutor::batch`]: crate::executor::ParallelExecutor::batch
//! [`ParallelExecutor::execute_batch`]: crate::executor::ParallelExecutor::execute_batch

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::executor::Task;

/// Unbounded, insertion-ordered queue of pending tasks.
#[derive(Default)]
pub struct BatchQueue {
    pending: Mutex<Vec<Task>>,
}

impl BatchQueue {
    pub fn new() -> BatchQueue {
        BatchQueue::default()
    }

    pub fn push(&self, task: Task) {
        self.lock().push(task);
    }

    /// Appends all tasks at once; concurrent appends do not interleave with them.
    pub fn push_all(&self, tasks: impl IntoIterator<Item = Task>) {
        // Materialized first so user iterator code never runs under the lock.
        let tasks: Vec<Task> = tasks.into_iter().collect();
        self.lock().extend(tasks);
    }

    /// Removes and returns everything queued, oldest first.
    pub fn take_all(&self) -> Vec<Task> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Task>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for BatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchQueue").field("len", &self.len()).finish()
    }
}

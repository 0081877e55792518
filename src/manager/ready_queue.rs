use crate::task::{Priority, TaskId, TaskRef};
use std::collections::VecDeque;

/// Tasks waiting for a run slot, bucketed by priority.
///
/// Bucket 0 holds [`Priority::MAX`]. Within a bucket tasks leave in
/// insertion order.
pub(crate) struct ReadyQueue {
    buckets: [VecDeque<TaskRef>; Priority::LEVELS],
}

fn bucket_of(priority: Priority) -> usize {
    (Priority::MAX.value() - priority.value()) as usize
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| VecDeque::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.buckets
            .iter()
            .any(|bucket| bucket.iter().any(|t| t.id() == id))
    }

    /// Returns `false` if the task is already queued
    pub(crate) fn enqueue(&mut self, task: TaskRef) -> bool {
        let bucket = &mut self.buckets[bucket_of(task.priority())];
        if bucket.iter().any(|t| t.id() == task.id()) {
            return false;
        }
        bucket.push_back(task);
        true
    }

    pub(crate) fn remove(&mut self, task: &TaskRef) -> bool {
        let bucket = &mut self.buckets[bucket_of(task.priority())];
        match bucket.iter().position(|t| t.id() == task.id()) {
            Some(index) => bucket.remove(index).is_some(),
            None => false,
        }
    }

    /// Oldest task of the highest non-empty priority
    pub(crate) fn dequeue(&mut self) -> Option<TaskRef> {
        self.buckets.iter_mut().find_map(VecDeque::pop_front)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &TaskRef> {
        self.buckets.iter().flatten()
    }
}

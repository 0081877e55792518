use crate::env;
use crate::task::{TaskId, TaskRef};
use std::collections::VecDeque;

/// Finished tasks kept for inspection, oldest first.
///
/// Shrinks in batches: nothing is evicted until the set reaches its high-water
/// mark, then it drops back to the low-water mark at once.
pub(crate) struct WatchedSet {
    max: usize,
    tasks: VecDeque<TaskRef>,
}

impl WatchedSet {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max,
            tasks: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.tasks.iter().any(|t| t.id() == id)
    }

    pub(crate) fn remove(&mut self, id: TaskId) -> bool {
        match self.tasks.iter().position(|t| t.id() == id) {
            Some(index) => self.tasks.remove(index).is_some(),
            None => false,
        }
    }

    /// Append `task`, returning the tasks evicted to make room
    pub(crate) fn insert(&mut self, task: TaskRef) -> Vec<TaskRef> {
        let mut evicted = Vec::new();
        if self.tasks.len() >= env::watched_high_water(self.max) {
            let excess = self.tasks.len() + 1 - self.max;
            evicted.extend(self.tasks.drain(..excess));
        }
        self.tasks.push_back(task);
        evicted
    }

    pub(crate) fn tasks(&self) -> Vec<TaskRef> {
        self.tasks.iter().cloned().collect()
    }
}

//! Task cache for reusing contexts across units of work.
//!
//! When a task finishes, it is pushed into its carrier's local cache, or the
//! shared global cache when the local one is full. The next submission pops
//! a cached task and resets it instead of creating a new context. A cache
//! built with capacity 0 disables caching at that level.

use crate::task::{Task, TaskStatus};
use crossbeam::queue::ArrayQueue;
use std::sync::Arc;

/// Bounded lock-free pool of CACHED tasks.
pub struct TaskCache {
    slots: Option<ArrayQueue<Arc<Task>>>,
}

impl TaskCache {
    /// Create a cache that holds up to `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (capacity > 0).then(|| ArrayQueue::new(capacity)),
        }
    }

    /// Take a cached task, if any.
    pub fn pop(&self) -> Option<Arc<Task>> {
        self.slots.as_ref()?.pop()
    }

    /// Offer a task to the cache; handed back when the cache is full or
    /// disabled.
    pub fn push(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        debug_assert_eq!(task.status(), TaskStatus::Cached);
        match &self.slots {
            Some(slots) => slots.push(task),
            None => Err(task),
        }
    }

    /// Number of cached tasks
    pub fn len(&self) -> usize {
        self.slots.as_ref().map_or(0, |s| s.len())
    }

    /// Whether the cache holds no tasks
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of cached tasks
    pub fn capacity(&self) -> usize {
        self.slots.as_ref().map_or(0, |s| s.capacity())
    }

    /// Discard every cached task, returning how many were destroyed.
    pub fn drain_discard(&self) -> usize {
        let mut discarded = 0;
        while let Some(task) = self.pop() {
            task.discard();
            discarded += 1;
        }
        discarded
    }
}

impl Drop for TaskCache {
    fn drop(&mut self) {
        self.drain_discard();
    }
}

impl std::fmt::Debug for TaskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    #[test]
    fn test_cache_push_pop() {
        let cache = TaskCache::new(4);
        let task = Task::new(Weak::new());
        let id = task.id();

        cache.push(task).unwrap();
        assert_eq!(cache.len(), 1);

        // Pop returns the very same task
        let recycled = cache.pop().unwrap();
        assert_eq!(recycled.id(), id);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_max_size() {
        let cache = TaskCache::new(2);

        cache.push(Task::new(Weak::new())).unwrap();
        cache.push(Task::new(Weak::new())).unwrap();
        let rejected = Task::new(Weak::new());
        let id = rejected.id();

        // Full: the task is handed back to the caller
        let back = cache.push(rejected).unwrap_err();
        assert_eq!(back.id(), id);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache = TaskCache::new(0);
        assert_eq!(cache.capacity(), 0);
        assert!(cache.push(Task::new(Weak::new())).is_err());
        assert!(cache.pop().is_none());
    }

    #[test]
    fn test_drain_discards_tasks() {
        let cache = TaskCache::new(3);
        let task = Task::new(Weak::new());
        cache.push(task.clone()).unwrap();
        assert_eq!(cache.drain_discard(), 1);
        assert_eq!(task.status(), TaskStatus::Dead);
    }
}

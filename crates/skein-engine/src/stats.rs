//! Engine statistics
//!
//! Counters are advisory: they are bumped with relaxed atomics and never
//! feed back into scheduling decisions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Scheduler statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Units of work accepted by `submit`
    pub tasks_submitted: u64,
    /// Units of work that finished (including panics and cancellation)
    pub tasks_completed: u64,
    /// Submissions refused because the engine was shutting down
    pub tasks_rejected: u64,
    /// Work currently submitted but not finished
    pub outstanding: u64,
    /// Tasks currently ALIVE
    pub live_tasks: usize,

    /// Task contexts created
    pub contexts_created: u64,
    /// Task reuses served from a carrier's own cache
    pub local_cache_hits: u64,
    /// Task reuses served from the global cache
    pub global_cache_hits: u64,
    /// Task reuses served from another carrier's cache
    pub stolen_cache_hits: u64,
    /// Finished tasks destroyed because every cache was full
    pub cache_discards: u64,

    /// Tasks moved to another carrier
    pub steal_successes: u64,
    /// Steal attempts abandoned (contention or shutdown)
    pub steal_failures: u64,
    /// Resumes retried because the task was still steal-locked
    pub switch_failures: u64,

    /// Timeouts armed
    pub timers_armed: u64,
    /// Timeouts that fired
    pub timers_fired: u64,
    /// Timeouts cancelled before firing
    pub timers_cancelled: u64,

    /// Resumes held back by a control group
    pub quota_throttles: u64,
    /// Run time not charged to any control group, in nanoseconds
    pub free_running_nanos: u64,
}

/// Live counters behind [`SchedulerStats`]
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) tasks_submitted: AtomicU64,
    pub(crate) tasks_completed: AtomicU64,
    pub(crate) tasks_rejected: AtomicU64,
    pub(crate) contexts_created: AtomicU64,
    pub(crate) local_cache_hits: AtomicU64,
    pub(crate) global_cache_hits: AtomicU64,
    pub(crate) stolen_cache_hits: AtomicU64,
    pub(crate) cache_discards: AtomicU64,
    pub(crate) steal_successes: AtomicU64,
    pub(crate) steal_failures: AtomicU64,
    pub(crate) switch_failures: AtomicU64,
    pub(crate) timers_armed: AtomicU64,
    pub(crate) timers_fired: AtomicU64,
    pub(crate) timers_cancelled: AtomicU64,
    pub(crate) quota_throttles: AtomicU64,
    pub(crate) free_running_nanos: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, outstanding: u64, live_tasks: usize) -> SchedulerStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SchedulerStats {
            tasks_submitted: get(&self.tasks_submitted),
            tasks_completed: get(&self.tasks_completed),
            tasks_rejected: get(&self.tasks_rejected),
            outstanding,
            live_tasks,
            contexts_created: get(&self.contexts_created),
            local_cache_hits: get(&self.local_cache_hits),
            global_cache_hits: get(&self.global_cache_hits),
            stolen_cache_hits: get(&self.stolen_cache_hits),
            cache_discards: get(&self.cache_discards),
            steal_successes: get(&self.steal_successes),
            steal_failures: get(&self.steal_failures),
            switch_failures: get(&self.switch_failures),
            timers_armed: get(&self.timers_armed),
            timers_fired: get(&self.timers_fired),
            timers_cancelled: get(&self.timers_cancelled),
            quota_throttles: get(&self.quota_throttles),
            free_running_nanos: get(&self.free_running_nanos),
        }
    }
}

impl SchedulerStats {
    /// Total task reuses across all cache levels
    pub fn cache_hits(&self) -> u64 {
        self.local_cache_hits + self.global_cache_hits + self.stolen_cache_hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let counters = Counters::default();
        Counters::bump(&counters.tasks_submitted);
        Counters::bump(&counters.tasks_submitted);
        Counters::add(&counters.free_running_nanos, 1500);
        Counters::bump(&counters.global_cache_hits);
        Counters::bump(&counters.local_cache_hits);

        let stats = counters.snapshot(1, 2);
        assert_eq!(stats.tasks_submitted, 2);
        assert_eq!(stats.free_running_nanos, 1500);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.live_tasks, 2);
        assert_eq!(stats.cache_hits(), 2);
    }
}

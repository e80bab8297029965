//! CPU quota control groups
//!
//! A [`ControlGroup`] is a CFS-style leaky bucket: `quota` nanoseconds of run
//! time are credited every `period` nanoseconds. Member tasks are admitted
//! while the bucket is non-negative; their actual run time is subtracted on
//! every switch-out, so the bucket may go negative (borrowed-ahead usage) and
//! the debt is paid back by later refills.
//!
//! Refills are additive and clamped to one quota, so timing jitter around a
//! period boundary neither loses nor mints quota.

use crate::error::{SchedError, SchedResult};
use crate::task::{current_task, Task, TaskId};
use crate::timer::nano_time;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Period used by [`ControlGroup::with_cpu_percent`]
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(100);

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// CPU quota accounting domain shared by a set of tasks
pub struct ControlGroup {
    id: u64,
    quota: i64,
    period: i64,
    /// Signed: negative means the group ran ahead of its quota
    remaining: AtomicI64,
    period_start: AtomicI64,
    members: DashMap<TaskId, (Arc<Task>, u64)>,
    consumed: AtomicI64,
    throttles: AtomicU64,
    destroyed: AtomicBool,
}

fn to_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

impl ControlGroup {
    /// Group admitting `quota` of run time per `period`
    pub fn new(quota: Duration, period: Duration) -> SchedResult<Arc<Self>> {
        Self::from_nanos(to_nanos(quota), to_nanos(period), nano_time())
    }

    /// Group limited to `percent` of one CPU over [`DEFAULT_PERIOD`].
    ///
    /// Values above 100 allow more than one CPU's worth of run time.
    pub fn with_cpu_percent(percent: f64) -> SchedResult<Arc<Self>> {
        let period = to_nanos(DEFAULT_PERIOD);
        if !percent.is_finite() || percent <= 0.0 {
            return Err(SchedError::InvalidQuota { quota: 0, period });
        }
        let quota = ((period as f64) * percent / 100.0) as i64;
        Self::from_nanos(quota, period, nano_time())
    }

    pub(crate) fn from_nanos(quota: i64, period: i64, now: i64) -> SchedResult<Arc<Self>> {
        if quota <= 0 || period <= 0 {
            return Err(SchedError::InvalidQuota { quota, period });
        }
        Ok(Arc::new(Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            quota,
            period,
            remaining: AtomicI64::new(quota),
            period_start: AtomicI64::new(now),
            members: DashMap::new(),
            consumed: AtomicI64::new(0),
            throttles: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Unique group id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run time admitted per period
    pub fn quota(&self) -> Duration {
        Duration::from_nanos(self.quota as u64)
    }

    /// Refill period
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period as u64)
    }

    /// Remaining quota in nanoseconds (may be negative)
    pub fn remaining_nanos(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Total run time charged to the group
    pub fn consumed(&self) -> Duration {
        Duration::from_nanos(self.consumed.load(Ordering::Relaxed).max(0) as u64)
    }

    /// How many times a member was held back for lack of quota
    pub fn throttle_count(&self) -> u64 {
        self.throttles.load(Ordering::Relaxed)
    }

    /// Number of attached tasks
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Whether `destroy` was called
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Roll the bucket forward to `now`. Concurrent callers race on the
    /// period start; only the winner credits the refill.
    fn refill(&self, now: i64) {
        loop {
            let start = self.period_start.load(Ordering::Acquire);
            let elapsed = now.wrapping_sub(start);
            if elapsed < self.period {
                return;
            }
            let periods = elapsed / self.period;
            let next_start = start.wrapping_add(periods.saturating_mul(self.period));
            if self
                .period_start
                .compare_exchange(start, next_start, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let credit = periods.saturating_mul(self.quota);
            let mut current = self.remaining.load(Ordering::Acquire);
            loop {
                let next = current.saturating_add(credit).min(self.quota);
                match self.remaining.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => current = actual,
                }
            }
        }
    }

    /// Delay in nanoseconds until the group may run again, 0 to admit
    pub(crate) fn check_cpu_limit_at(&self, now: i64) -> i64 {
        self.refill(now);
        let remaining = self.remaining.load(Ordering::Acquire);
        if remaining >= 0 {
            return 0;
        }
        let start = self.period_start.load(Ordering::Acquire);
        let to_boundary = start.wrapping_add(self.period).wrapping_sub(now).max(1);
        // Each extra full period repays one quota of debt
        let extra_periods = (-remaining - 1) / self.quota;
        to_boundary.saturating_add(extra_periods.saturating_mul(self.period))
    }

    /// Admission check for `task`.
    ///
    /// Returns 0 when the task may run, else the nanoseconds until enough
    /// quota has accrued; the caller schedules the resume. With
    /// `update_timestamp` an admitted task's entry timestamp is restarted so
    /// time spent waiting is not charged.
    pub fn check_cpu_limit(&self, task: &Task, update_timestamp: bool) -> i64 {
        let now = nano_time();
        let delay = self.check_cpu_limit_at(now);
        if delay == 0 {
            if update_timestamp {
                task.set_entry_ts(now);
            }
        } else {
            self.throttles.fetch_add(1, Ordering::Relaxed);
        }
        delay
    }

    /// Subtract run time from the bucket
    pub(crate) fn charge(&self, nanos: i64) {
        if nanos <= 0 {
            return;
        }
        self.remaining.fetch_sub(nanos, Ordering::AcqRel);
        self.consumed.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Charge the task's run time since its entry timestamp
    pub fn calc_cpu_ticks(&self, task: &Task) -> i64 {
        let elapsed = task.take_elapsed(nano_time());
        self.charge(elapsed);
        elapsed
    }

    /// Attach `task` to this group
    pub fn attach(self: &Arc<Self>, task: &Arc<Task>) -> SchedResult<()> {
        if self.is_destroyed() {
            return Err(SchedError::Rejected);
        }
        if let Some(existing) = task.cgroup() {
            if Arc::ptr_eq(&existing, self) {
                return Ok(());
            }
            return Err(SchedError::AlreadyAttached);
        }
        // Time before attaching is not the group's
        task.take_elapsed(nano_time());
        task.set_cgroup(Some(self.clone()));
        self.members
            .insert(task.id(), (task.clone(), task.generation()));
        tracing::trace!(group = self.id, task_id = task.id().as_u64(), "attached");
        Ok(())
    }

    /// Detach `task`, charging its outstanding run time
    pub fn detach(&self, task: &Task) {
        let Some(existing) = task.cgroup() else {
            return;
        };
        if !std::ptr::eq(Arc::as_ptr(&existing), self) {
            return;
        }
        self.calc_cpu_ticks(task);
        task.set_cgroup(None);
        self.members.remove(&task.id());
        tracing::trace!(group = self.id, task_id = task.id().as_u64(), "detached");
    }

    /// Run `f` on the current task under this group's quota.
    ///
    /// The task is throttled first if the group is out of quota and is
    /// detached again when `f` returns or unwinds.
    pub fn run<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> SchedResult<R> {
        let task = current_task().ok_or(SchedError::NotInTask)?;
        self.attach(&task)?;
        let _guard = DetachGuard { group: self, task: &task };
        if self.check_cpu_limit_at(nano_time()) > 0 {
            // The carrier re-checks the quota on resume and holds the task
            // back until it has accrued.
            crate::current::yield_now();
        }
        Ok(f())
    }

    /// Cancel every member and wait for them to exit.
    ///
    /// Returns how many members were cancelled, or `Timeout` if some were
    /// still attached when `timeout` elapsed.
    pub fn destroy(&self, timeout: Option<Duration>) -> SchedResult<usize> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let me = current_task().map(|t| t.id());
        let targets: Vec<(Arc<Task>, u64)> = self
            .members
            .iter()
            .filter(|entry| Some(*entry.key()) != me)
            .map(|entry| entry.value().clone())
            .collect();
        for (task, generation) in &targets {
            task.cancel(*generation);
        }
        tracing::debug!(group = self.id, members = targets.len(), "destroying control group");

        let start = Instant::now();
        while self
            .members
            .iter()
            .any(|entry| Some(*entry.key()) != me)
        {
            if timeout.map_or(false, |t| start.elapsed() >= t) {
                return Err(SchedError::Timeout);
            }
            if me.is_some() {
                crate::current::sleep(Duration::from_millis(1));
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(targets.len())
    }
}

struct DetachGuard<'a> {
    group: &'a ControlGroup,
    task: &'a Task,
}

impl Drop for DetachGuard<'_> {
    fn drop(&mut self) {
        self.group.detach(self.task);
    }
}

impl std::fmt::Debug for ControlGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlGroup")
            .field("id", &self.id)
            .field("quota", &self.quota)
            .field("period", &self.period)
            .field("remaining", &self.remaining_nanos())
            .field("members", &self.member_count())
            .finish()
    }
}

//! Carrier: the per-worker-thread scheduler
//!
//! Each carrier owns one OS thread, a run queue, a local task cache and a
//! timer heap. Its thread is represented by a synthetic "thread task" whose
//! context is the carrier thread itself. Running a task means switching
//! from the thread task to the task's context; the task comes back only
//! through [`Carrier::schedule`] or its exit path, so the carrier always
//! decides what runs next.

use crate::cache::TaskCache;
use crate::cgroup::ControlGroup;
use crate::config::SchedulingPolicy;
use crate::context::{Context, Resumed};
use crate::error::{SchedError, SchedResult};
use crate::event::{Channel, Interest};
use crate::park::Parker;
use crate::registry;
use crate::scheduler::Shared;
use crate::stats::Counters;
use crate::task::{Task, TaskStatus, Work};
use crate::timer::{nano_time, TimeOut, TimeoutAction, TimerManager, PRECISE_OWNER};
use crossbeam_deque::{Injector, Steal};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Longest idle sleep; bounds the latency of noticing stealable work
const IDLE_PARK_MAX: Duration = Duration::from_millis(10);

/// Slice handed to the event pump while idle
const IO_POLL_SLICE: Duration = Duration::from_millis(1);

/// New work waiting for a task
pub(crate) struct Dispatch {
    pub(crate) work: Work,
    pub(crate) name: String,
    pub(crate) group: Option<Arc<ControlGroup>>,
}

/// Entry in a run queue
pub(crate) enum Runnable {
    /// Obtain a task and run new work on it
    Spawn(Dispatch),
    /// Switch back into a suspended task
    Resume(Arc<Task>),
}

/// Carrier state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CarrierState {
    /// Running the thread task (looking for work or idle)
    Idle = 0,
    /// A user task is current
    Running = 1,
    /// The scheduling loop has exited
    Terminated = 2,
}

impl CarrierState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CarrierState::Idle,
            1 => CarrierState::Running,
            _ => CarrierState::Terminated,
        }
    }
}

/// Per-worker-thread scheduler
pub(crate) struct Carrier {
    index: usize,
    queue: Injector<Runnable>,
    queue_len: AtomicUsize,
    cache: TaskCache,
    timers: TimerManager,
    thread_task: OnceCell<Arc<Task>>,
    current: Mutex<Option<Arc<Task>>>,
    /// Nesting depth of critical sections of the current task
    critical: AtomicUsize,
    /// The carrier thread sleeps here when there is nothing to run
    idle: Parker,
    /// Task that yielded; re-enqueued once it has switched out
    deferred_wakeup: Mutex<Option<Arc<Task>>>,
    /// Precise-timer registrations made by the running task
    pending_precise: Mutex<Vec<Arc<TimeOut>>>,
    state: AtomicU8,
}

impl Carrier {
    pub(crate) fn new(index: usize, cache_size: usize) -> Self {
        Self {
            index,
            queue: Injector::new(),
            queue_len: AtomicUsize::new(0),
            cache: TaskCache::new(cache_size),
            timers: TimerManager::new(index),
            thread_task: OnceCell::new(),
            current: Mutex::new(None),
            critical: AtomicUsize::new(0),
            idle: Parker::new(),
            deferred_wakeup: Mutex::new(None),
            pending_precise: Mutex::new(Vec::new()),
            state: AtomicU8::new(CarrierState::Idle as u8),
        }
    }

    /// Carrier index within its engine
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn state(&self) -> CarrierState {
        CarrierState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CarrierState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Entries waiting in the run queue
    pub(crate) fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    pub(crate) fn cache(&self) -> &TaskCache {
        &self.cache
    }

    pub(crate) fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Task currently switched in, if any
    #[cfg(test)]
    pub(crate) fn current(&self) -> Option<Arc<Task>> {
        self.current.lock().clone()
    }

    pub(crate) fn thread_context(&self) -> Option<Arc<Context>> {
        self.thread_task.get().and_then(|t| t.context())
    }

    /// Start the carrier thread
    pub(crate) fn start(
        self: &Arc<Self>,
        shared: Arc<Shared>,
    ) -> SchedResult<thread::JoinHandle<()>> {
        let carrier = Arc::clone(self);
        thread::Builder::new()
            .name(format!("skein-carrier-{}", self.index))
            .spawn(move || carrier.run_loop(&shared))
            .map_err(SchedError::Spawn)
    }

    /// Push an entry and wake the carrier if it is idle
    pub(crate) fn enqueue(&self, runnable: Runnable) {
        self.queue.push(runnable);
        self.queue_len.fetch_add(1, Ordering::Relaxed);
        self.notify();
    }

    /// Wake the carrier thread if it is sleeping
    pub(crate) fn notify(&self) {
        self.idle.unpark_native();
    }

    /// Pop one entry from this carrier's queue (owner or thief)
    fn take_queued(&self) -> Option<Runnable> {
        loop {
            match self.queue.steal() {
                Steal::Success(runnable) => {
                    self.queue_len.fetch_sub(1, Ordering::Relaxed);
                    return Some(runnable);
                }
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    // =========================================================================
    // Scheduling loop (carrier thread)
    // =========================================================================

    fn run_loop(self: &Arc<Self>, shared: &Arc<Shared>) {
        registry::register_worker_thread();
        let _ = self
            .thread_task
            .set(Task::new_thread_task(Arc::downgrade(shared), self.index));
        self.set_state(CarrierState::Idle);
        tracing::debug!(carrier = self.index, "carrier started");

        loop {
            let next_deadline = self.process_timers(shared);

            if let Some(runnable) = self.next_runnable(shared) {
                self.dispatch(shared, runnable);
                continue;
            }

            if shared.is_terminated() {
                break;
            }

            self.idle_wait(shared, next_deadline);
        }

        let discarded = self.cache.drain_discard();
        self.set_state(CarrierState::Terminated);
        registry::unregister_worker_thread();
        tracing::debug!(carrier = self.index, discarded, "carrier terminated");
        shared.carrier_exited();
    }

    fn process_timers(&self, shared: &Arc<Shared>) -> Option<i64> {
        self.timers
            .process_timeouts_and_get_wait_deadline(nano_time(), |t| shared.fire_timeout(t))
    }

    /// Own queue, then (pull policy) the global queue, then a random peer
    fn next_runnable(&self, shared: &Arc<Shared>) -> Option<Runnable> {
        if let Some(runnable) = self.take_queued() {
            return Some(runnable);
        }
        if shared.config.policy != SchedulingPolicy::Pull {
            return None;
        }
        loop {
            match shared.injector.steal() {
                Steal::Success(runnable) => return Some(runnable),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        if shared.is_shutdown() {
            return None;
        }

        let peers = shared.carriers().len();
        if peers < 2 {
            return None;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..shared.config.steal_retry {
            let victim = rng.gen_range(0..peers);
            if victim == self.index {
                continue;
            }
            if let Some(runnable) = shared.carrier(victim).take_queued() {
                tracing::trace!(carrier = self.index, victim, "stole run queue entry");
                return Some(runnable);
            }
        }
        None
    }

    fn dispatch(self: &Arc<Self>, shared: &Arc<Shared>, runnable: Runnable) {
        match runnable {
            Runnable::Spawn(dispatch) => self.run_task(shared, dispatch),
            Runnable::Resume(task) => {
                task.clear_enqueued();
                self.resume(shared, task);
            }
        }
    }

    fn idle_wait(&self, shared: &Arc<Shared>, next_deadline: Option<i64>) {
        let timeout = next_deadline
            .map(|deadline| Duration::from_nanos(deadline.wrapping_sub(nano_time()).max(0) as u64));

        if shared.has_io_waiters() {
            let slice = timeout.map_or(IO_POLL_SLICE, |t| t.min(IO_POLL_SLICE));
            if shared.poll_events(slice) {
                return;
            }
        }

        let timeout = timeout.map_or(IDLE_PARK_MAX, |t| t.min(IDLE_PARK_MAX));
        if !timeout.is_zero() {
            self.idle.park_native(Some(timeout));
        }
    }

    // =========================================================================
    // runTask / resume (carrier thread)
    // =========================================================================

    /// Obtain a task for new work and switch to it
    pub(crate) fn run_task(self: &Arc<Self>, shared: &Arc<Shared>, dispatch: Dispatch) {
        let Dispatch { work, name, group } = dispatch;

        let group_gone = group.as_ref().map_or(false, |g| g.is_destroyed());
        if work.binding().cancel_requested() || group_gone {
            work.binding().abandon();
            shared.work_abandoned();
            return;
        }

        let task = self.obtain_task(shared);
        let fresh = task.context().is_none();
        if let Err(e) = task.ensure_context(shared.config.stack_size) {
            tracing::warn!(carrier = self.index, error = %e, "failed to create task context, requeueing");
            // The task never ran; it is still CACHED and can go back
            if let Err(task) = self.cache.push(task) {
                task.discard();
            }
            self.enqueue(Runnable::Spawn(Dispatch { work, name, group }));
            return;
        }
        if fresh {
            Counters::bump(&shared.stats.contexts_created);
        }

        task.reset(work, name, self.index);
        shared.task_started(&task);
        if let Some(group) = group {
            if let Err(e) = group.attach(&task) {
                tracing::warn!(task_id = task.id().as_u64(), error = %e, "running unmetered");
            }
        }
        tracing::trace!(carrier = self.index, task_id = task.id().as_u64(), "run task");
        self.resume(shared, task);
    }

    /// Local cache, then global cache, then a peer's cache, then a new task
    fn obtain_task(&self, shared: &Arc<Shared>) -> Arc<Task> {
        if let Some(task) = self.cache.pop() {
            Counters::bump(&shared.stats.local_cache_hits);
            return task;
        }
        if let Some(task) = shared.global_cache.pop() {
            Counters::bump(&shared.stats.global_cache_hits);
            return task;
        }
        if let Some(task) = shared.steal_cached(self.index) {
            Counters::bump(&shared.stats.stolen_cache_hits);
            return task;
        }
        Task::new(Arc::downgrade(shared))
    }

    /// Switch to an ALIVE task and run the post-resume hooks when it comes
    /// back.
    pub(crate) fn resume(self: &Arc<Self>, shared: &Arc<Shared>, task: Arc<Task>) {
        assert_eq!(
            task.status(),
            TaskStatus::Alive,
            "resume of task {} that is not alive",
            task.id()
        );

        if task.carrier_index() != self.index {
            if !self.steal(shared, &task) {
                Counters::bump(&shared.stats.steal_failures);
                tracing::trace!(carrier = self.index, task_id = task.id().as_u64(), "steal failed");
                shared.wakeup_task(task);
                return;
            }
            Counters::bump(&shared.stats.steal_successes);
        }

        if let Some(group) = task.cgroup() {
            let delay = group.check_cpu_limit(&task, true);
            if delay > 0 {
                Counters::bump(&shared.stats.quota_throttles);
                shared.cancel_task_timeout(&task);
                let deadline = nano_time().saturating_add(delay);
                self.arm_timeout(shared, &task, deadline, TimeoutAction::Resume, false);
                tracing::trace!(task_id = task.id().as_u64(), delay, "quota exhausted");
                return;
            }
        }

        if !task.try_lock_steal(shared.config.steal_retry) {
            Counters::bump(&shared.stats.switch_failures);
            tracing::debug!(carrier = self.index, task_id = task.id().as_u64(), "switch failed, retrying");
            shared.wakeup_task(task);
            return;
        }

        let (Some(target), Some(thread_ctx)) = (task.context(), self.thread_context()) else {
            panic!("resume: task {} has no context", task.id());
        };

        task.set_entry_ts(nano_time());
        *self.current.lock() = Some(task.clone());
        self.set_state(CarrierState::Running);

        thread_ctx.switch_to(&target, false);

        self.set_state(CarrierState::Idle);
        self.current.lock().take();
        task.unlock_steal();
        self.after_resume(shared);

        if task.status() == TaskStatus::Dead {
            task.release_context();
        }
    }

    fn after_resume(&self, shared: &Arc<Shared>) {
        let pending = std::mem::take(&mut *self.pending_precise.lock());
        if let Some(timer) = shared.precise_timer() {
            for timeout in pending {
                timer.register(timeout);
            }
        }
        if let Some(task) = self.deferred_wakeup.lock().take() {
            shared.wakeup_task(task);
        }
    }

    /// Move `task` to this carrier. Waits out the steal lock of a task still
    /// switching out elsewhere; refuses once shutdown began.
    pub(crate) fn steal(&self, shared: &Arc<Shared>, task: &Arc<Task>) -> bool {
        if shared.is_shutdown() {
            return false;
        }
        let from = task.carrier_index();
        if from == self.index {
            return true;
        }
        if !task.wait_steal_unlocked(shared.config.steal_retry) {
            return false;
        }
        if !task.cas_carrier(from, self.index) {
            return false;
        }
        task.record_stolen();
        tracing::trace!(task_id = task.id().as_u64(), from, to = self.index, "task stolen");
        true
    }

    // =========================================================================
    // Called on the running task's context
    // =========================================================================

    /// Give up the processor: account run time and switch to the thread task
    pub(crate) fn schedule(&self, shared: &Arc<Shared>, task: &Arc<Task>) -> Resumed {
        self.account_run(shared, task, nano_time());
        let (Some(my_ctx), Some(thread_ctx)) = (task.context(), self.thread_context()) else {
            panic!("schedule: task {} has no context", task.id());
        };
        my_ctx.switch_to(&thread_ctx, false)
    }

    /// Re-enqueue `task` after it has switched out
    pub(crate) fn defer_wakeup(&self, task: Arc<Task>) {
        *self.deferred_wakeup.lock() = Some(task);
    }

    /// Charge run time since the entry timestamp to the task's group, or to
    /// the free-running counter.
    pub(crate) fn account_run(&self, shared: &Arc<Shared>, task: &Task, now: i64) {
        let elapsed = task.take_elapsed(now);
        match task.cgroup() {
            Some(group) => group.charge(elapsed),
            None => Counters::add(&shared.stats.free_running_nanos, elapsed.max(0) as u64),
        }
    }

    /// Offer a finished task to the local cache, then the global one
    pub(crate) fn try_cache(&self, shared: &Arc<Shared>, task: Arc<Task>) -> bool {
        task.set_status(TaskStatus::Cached);
        let task = match self.cache.push(task) {
            Ok(()) => return true,
            Err(task) => task,
        };
        match shared.global_cache.push(task) {
            Ok(()) => true,
            Err(_) => {
                Counters::bump(&shared.stats.cache_discards);
                false
            }
        }
    }

    pub(crate) fn enter_critical(&self) {
        self.critical.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exit_critical(&self) {
        let prev = self.critical.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced critical section exit");
    }

    /// Whether the running task is inside a critical section
    pub(crate) fn in_critical_section(&self) -> bool {
        self.critical.load(Ordering::Acquire) > 0
    }

    // =========================================================================
    // Timers and I/O registration
    // =========================================================================

    /// Arm a timeout for `task`.
    ///
    /// In precise mode the entry goes to the timer thread; registrations
    /// made from the running task (`from_task`) are held until it has
    /// switched out so the timer cannot wake it mid-switch.
    pub(crate) fn arm_timeout(
        &self,
        shared: &Arc<Shared>,
        task: &Arc<Task>,
        deadline: i64,
        action: TimeoutAction,
        from_task: bool,
    ) -> Arc<TimeOut> {
        let now = nano_time();
        Counters::bump(&shared.stats.timers_armed);
        match shared.precise_timer() {
            Some(timer) => {
                let timeout = TimeOut::new(task.clone(), now, deadline, action, PRECISE_OWNER);
                task.set_timeout(&timeout);
                let defer = from_task && !matches!(action, TimeoutAction::WakeNative(_));
                if defer {
                    self.pending_precise.lock().push(timeout.clone());
                } else {
                    timer.register(timeout.clone());
                }
                timeout
            }
            None => {
                let timeout = TimeOut::new(task.clone(), now, deadline, action, self.index);
                task.set_timeout(&timeout);
                self.timers.add_timer(timeout.clone());
                timeout
            }
        }
    }

    /// Associate `task` with an I/O channel
    pub(crate) fn register_event(
        &self,
        shared: &Arc<Shared>,
        task: &Task,
        channel: Channel,
        interest: Interest,
    ) -> SchedResult<()> {
        if task.io_channel().is_some() {
            self.unregister_event(shared, task);
        }
        // Visible before the pump can report it
        task.set_io_channel(Some(channel));
        shared.io_waiters.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = shared.event_pump.register_interest(task.id(), channel, interest) {
            task.set_io_channel(None);
            shared.io_waiters.fetch_sub(1, Ordering::AcqRel);
            return Err(SchedError::EventPump(e));
        }
        Ok(())
    }

    /// Drop the task's I/O registration, if any
    pub(crate) fn unregister_event(&self, shared: &Arc<Shared>, task: &Task) {
        if task.io_channel().is_none() {
            return;
        }
        task.set_io_channel(None);
        shared.io_waiters.fetch_sub(1, Ordering::AcqRel);
        if let Err(e) = shared.event_pump.unregister_interest(task.id()) {
            tracing::warn!(task_id = task.id().as_u64(), error = %e, "failed to unregister interest");
        }
    }
}

impl std::fmt::Debug for Carrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Carrier")
            .field("index", &self.index)
            .field("state", &self.state())
            .field("queue_len", &self.queue_len())
            .field("cache", &self.cache)
            .field("timers", &self.timers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch(name: &str) -> Runnable {
        let (work, _state) = Work::new(|| ());
        Runnable::Spawn(Dispatch {
            work,
            name: name.to_string(),
            group: None,
        })
    }

    #[test]
    fn test_carrier_creation() {
        let carrier = Carrier::new(3, 8);
        assert_eq!(carrier.index(), 3);
        assert_eq!(carrier.state(), CarrierState::Idle);
        assert_eq!(carrier.queue_len(), 0);
        assert_eq!(carrier.cache().capacity(), 8);
        assert_eq!(carrier.timers().owner(), 3);
        assert!(carrier.current().is_none());
        assert!(carrier.thread_context().is_none());
    }

    #[test]
    fn test_queue_is_fifo_and_counted() {
        let carrier = Carrier::new(0, 0);
        carrier.enqueue(dispatch("a"));
        carrier.enqueue(dispatch("b"));
        assert_eq!(carrier.queue_len(), 2);

        let names: Vec<String> = std::iter::from_fn(|| carrier.take_queued())
            .map(|r| match r {
                Runnable::Spawn(d) => d.name,
                Runnable::Resume(_) => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(carrier.queue_len(), 0);
    }

    #[test]
    fn test_enqueue_leaves_idle_permit() {
        let carrier = Carrier::new(0, 0);
        carrier.enqueue(dispatch("x"));
        // The permit makes the next idle park return immediately
        let start = std::time::Instant::now();
        carrier.idle.park_native(Some(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_critical_section_nesting() {
        let carrier = Carrier::new(0, 0);
        assert!(!carrier.in_critical_section());
        carrier.enter_critical();
        carrier.enter_critical();
        carrier.exit_critical();
        assert!(carrier.in_critical_section());
        carrier.exit_critical();
        assert!(!carrier.in_critical_section());
    }
}

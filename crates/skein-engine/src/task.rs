//! Task structure and lifecycle
//!
//! A [`Task`] is a lightweight execution unit. Its context is created once
//! and reused: after one unit of work finishes, the task either goes back to
//! a cache (CACHED, context kept) and waits for the next `reset`, or is
//! destroyed (DEAD, context discarded). The body loop never returns to its
//! caller while the task is recyclable.

use crate::cgroup::ControlGroup;
use crate::context::{Context, Resumed};
use crate::current::Unparker;
use crate::error::{ContextDiscarded, JoinError, TaskCancelled};
use crate::event::Channel;
use crate::park::{ParkAxis, Parker, Wake};
use crate::scheduler::Shared;
use crate::timer::{nano_time, TimeOut};
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Carrier index meaning "not owned by any carrier"
pub(crate) const NO_CARRIER: usize = usize::MAX;

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a TaskId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        TaskId(id)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Associated with live work, running or scheduled to run
    Alive = 0,
    /// Finished; context retained for reuse (fresh tasks start here too)
    Cached = 1,
    /// Context discarded
    Dead = 2,
}

impl TaskStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskStatus::Alive,
            1 => TaskStatus::Cached,
            _ => TaskStatus::Dead,
        }
    }
}

/// How a finished unit of work left the task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ExitOutcome {
    /// Went through a cache and was resumed with new work
    Recycled,
    /// Context is gone; the body must return
    Destroyed,
}

/// Type-erased hooks between a task and the handle of the work it runs
pub(crate) trait WorkBinding: Send + Sync {
    /// The work was placed on `task` at `generation`
    fn bind(&self, task: &Arc<Task>, generation: u64);
    /// Cancellation was requested before a task picked the work up
    fn cancel_requested(&self) -> bool;
    /// Complete as cancelled without running
    fn abandon(&self);
}

/// A unit of work plus its completion hooks
pub(crate) struct Work {
    run: Box<dyn FnOnce() + Send + 'static>,
    binding: Arc<dyn WorkBinding>,
}

impl Work {
    /// Wrap a closure; panics and cancellation unwinds are caught and
    /// reported through the returned join state.
    pub(crate) fn new<F, T>(f: F) -> (Self, Arc<JoinState<T>>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::new(JoinState::new());
        let completion = state.clone();
        let run = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f)).map_err(JoinError::from_panic);
            completion.complete(result);
        });
        (
            Self {
                run,
                binding: state.clone(),
            },
            state,
        )
    }

    pub(crate) fn binding(&self) -> &Arc<dyn WorkBinding> {
        &self.binding
    }

    /// Run the work on the calling thread
    pub(crate) fn run(self) {
        (self.run)();
    }
}

/// A lightweight execution unit
pub struct Task {
    id: TaskId,
    status: AtomicU8,
    name: Mutex<String>,
    /// Bumped on every reset; stale handles compare against it
    generation: AtomicU64,
    work: Mutex<Option<Work>>,
    context: Mutex<Option<Arc<Context>>>,
    shared: Weak<Shared>,

    /// Owning carrier index; updated by CAS when stolen
    carrier: AtomicUsize,
    /// Held by the carrier that is switching to / running this task
    steal_lock: AtomicBool,
    /// A resume entry is already sitting in some run queue
    enqueued: AtomicBool,

    timeout: Mutex<Option<Weak<TimeOut>>>,
    cgroup: Mutex<Option<Arc<ControlGroup>>>,

    user_parker: Parker,
    internal_parker: Parker,

    cancelled: AtomicBool,
    cancel_delivered: AtomicBool,
    discarded: AtomicBool,

    io_channel: Mutex<Option<Channel>>,
    io_ready: AtomicU8,

    enqueue_ts: AtomicI64,
    entry_ts: AtomicI64,
    run_nanos: AtomicI64,
    times_stolen: AtomicU32,

    thread_task: bool,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

/// The task running on the calling thread, if any
pub fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|current| current.borrow().clone())
}

impl Task {
    /// Allocate a fresh task (CACHED, no context yet)
    pub(crate) fn new(shared: Weak<Shared>) -> Arc<Self> {
        Arc::new(Self::build(shared, false, None))
    }

    /// The synthetic task standing for a carrier's own thread
    pub(crate) fn new_thread_task(shared: Weak<Shared>, carrier: usize) -> Arc<Self> {
        let task = Self::build(shared, true, Some(Arc::new(Context::for_current_thread())));
        task.carrier.store(carrier, Ordering::Release);
        task.status.store(TaskStatus::Alive as u8, Ordering::Release);
        *task.name.lock() = format!("skein-carrier-{}", carrier);
        Arc::new(task)
    }

    fn build(shared: Weak<Shared>, thread_task: bool, context: Option<Arc<Context>>) -> Self {
        Self {
            id: TaskId::new(),
            status: AtomicU8::new(TaskStatus::Cached as u8),
            name: Mutex::new(String::new()),
            generation: AtomicU64::new(0),
            work: Mutex::new(None),
            context: Mutex::new(context),
            shared,
            carrier: AtomicUsize::new(NO_CARRIER),
            steal_lock: AtomicBool::new(false),
            enqueued: AtomicBool::new(false),
            timeout: Mutex::new(None),
            cgroup: Mutex::new(None),
            user_parker: Parker::new(),
            internal_parker: Parker::new(),
            cancelled: AtomicBool::new(false),
            cancel_delivered: AtomicBool::new(false),
            discarded: AtomicBool::new(false),
            io_channel: Mutex::new(None),
            io_ready: AtomicU8::new(0),
            enqueue_ts: AtomicI64::new(0),
            entry_ts: AtomicI64::new(0),
            run_nanos: AtomicI64::new(0),
            times_stolen: AtomicU32::new(0),
            thread_task,
        }
    }

    /// Get the Task's unique ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Name given at the last reset
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Current status
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Incarnation counter, bumped by every reset
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether this is a carrier's synthetic thread task
    pub fn is_thread_task(&self) -> bool {
        self.thread_task
    }

    pub(crate) fn shared(&self) -> Option<Arc<Shared>> {
        self.shared.upgrade()
    }

    /// Reinitialize a cached or fresh task for new work
    pub(crate) fn reset(self: &Arc<Self>, work: Work, name: String, carrier: usize) {
        let status = self.status();
        assert_ne!(status, TaskStatus::Alive, "reset called on an alive task {}", self.id);
        assert_ne!(status, TaskStatus::Dead, "reset called on a dead task {}", self.id);

        *self.name.lock() = name;
        *self.timeout.lock() = None;
        *self.cgroup.lock() = None;
        *self.io_channel.lock() = None;
        self.io_ready.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        self.cancel_delivered.store(false, Ordering::Relaxed);
        self.enqueue_ts.store(0, Ordering::Relaxed);
        self.entry_ts.store(0, Ordering::Relaxed);
        self.run_nanos.store(0, Ordering::Relaxed);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        // Permits left by the previous incarnation (unpark before exit, or a
        // cancel of a running task) must not wake the new work
        self.user_parker.clear();
        self.internal_parker.clear();
        self.carrier.store(carrier, Ordering::Release);
        // Alive before the handle can see the binding, so a cancel racing
        // with the bind is not dropped
        self.set_status(TaskStatus::Alive);
        work.binding().bind(self, generation);
        *self.work.lock() = Some(work);
    }

    // =========================================================================
    // Ownership and stealing
    // =========================================================================

    /// Index of the owning carrier
    pub fn carrier_index(&self) -> usize {
        self.carrier.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_carrier(&self, carrier: usize) {
        self.carrier.store(carrier, Ordering::Release);
    }

    pub(crate) fn cas_carrier(&self, from: usize, to: usize) -> bool {
        self.carrier
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a carrier currently holds the steal lock
    pub fn is_steal_locked(&self) -> bool {
        self.steal_lock.load(Ordering::Acquire)
    }

    /// Spin until the steal lock is free, giving up after `rounds` backoff
    /// cycles.
    pub(crate) fn wait_steal_unlocked(&self, rounds: usize) -> bool {
        for _ in 0..rounds.max(1) {
            let backoff = Backoff::new();
            while !backoff.is_completed() {
                if !self.is_steal_locked() {
                    return true;
                }
                backoff.snooze();
            }
        }
        !self.is_steal_locked()
    }

    /// Acquire the steal lock for a switch, spinning up to `rounds` backoff
    /// cycles.
    pub(crate) fn try_lock_steal(&self, rounds: usize) -> bool {
        for _ in 0..rounds.max(1) {
            let backoff = Backoff::new();
            while !backoff.is_completed() {
                if self
                    .steal_lock
                    .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                backoff.snooze();
            }
        }
        false
    }

    pub(crate) fn unlock_steal(&self) {
        self.steal_lock.store(false, Ordering::Release);
    }

    /// Claim the right to enqueue a resume entry; false if one is pending
    pub(crate) fn mark_enqueued(&self) -> bool {
        !self.enqueued.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_enqueued(&self) {
        self.enqueued.store(false, Ordering::Release);
    }

    /// How many times this task moved to another carrier
    pub fn times_stolen(&self) -> u32 {
        self.times_stolen.load(Ordering::Relaxed)
    }

    pub(crate) fn record_stolen(&self) {
        self.times_stolen.fetch_add(1, Ordering::Relaxed);
    }

    // =========================================================================
    // Context
    // =========================================================================

    pub(crate) fn context(&self) -> Option<Arc<Context>> {
        self.context.lock().clone()
    }

    /// Context of this task, created on first use
    pub(crate) fn ensure_context(self: &Arc<Self>, stack_size: usize) -> io::Result<Arc<Context>> {
        let mut slot = self.context.lock();
        if let Some(ctx) = slot.as_ref() {
            return Ok(ctx.clone());
        }
        let weak = Arc::downgrade(self);
        let ctx = Arc::new(Context::spawn(
            format!("skein-task-{}", self.id.as_u64()),
            stack_size,
            move || {
                if let Some(task) = weak.upgrade() {
                    task.body();
                }
            },
        )?);
        *slot = Some(ctx.clone());
        Ok(ctx)
    }

    /// Drop the context after a terminal switch
    pub(crate) fn release_context(&self) {
        self.context.lock().take();
    }

    /// Destroy a suspended (cached) task and its context
    pub(crate) fn discard(&self) {
        self.set_status(TaskStatus::Dead);
        self.discarded.store(true, Ordering::Release);
        if let Some(ctx) = self.context.lock().take() {
            ctx.discard();
        }
    }

    pub(crate) fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    /// Body loop run on the task's own context
    fn body(self: Arc<Self>) {
        CURRENT_TASK.with(|current| *current.borrow_mut() = Some(self.clone()));
        loop {
            let work = self.work.lock().take();
            if let Some(work) = work {
                work.run();
            }
            if self.is_discarded() {
                break;
            }
            if self.mark_exit() == ExitOutcome::Destroyed {
                break;
            }
        }
        CURRENT_TASK.with(|current| current.borrow_mut().take());
    }

    /// The single exit path of a unit of work. Runs on the task's own
    /// context and always ends in an explicit switch back to the carrier.
    pub(crate) fn mark_exit(self: &Arc<Self>) -> ExitOutcome {
        assert_eq!(
            self.status(),
            TaskStatus::Alive,
            "mark_exit on task {} that is not alive",
            self.id
        );
        debug_assert!(
            current_task().map_or(false, |t| Arc::ptr_eq(&t, self)),
            "mark_exit must run on the task's own context"
        );

        let Some(shared) = self.shared() else {
            // Engine is gone and so are the carriers; nothing to switch to
            self.set_status(TaskStatus::Dead);
            return ExitOutcome::Destroyed;
        };
        let carrier = shared.carrier(self.carrier_index()).clone();

        carrier.unregister_event(&shared, self);
        shared.cancel_task_timeout(self);
        carrier.account_run(&shared, self, nano_time());
        if let Some(group) = self.cgroup() {
            group.detach(self);
        }
        shared.task_exited(self);

        // Resolve both contexts before the task becomes visible in a cache:
        // from then on another carrier may reset it.
        let (Some(my_ctx), Some(carrier_ctx)) = (self.context(), carrier.thread_context()) else {
            panic!("mark_exit: task {} has no context to switch from", self.id);
        };

        let cached = carrier.try_cache(&shared, self.clone());
        // A cached context stays suspended indefinitely; it must not keep
        // the engine alive.
        drop(shared);
        if cached {
            match my_ctx.switch_to(&carrier_ctx, false) {
                Resumed::Continue => ExitOutcome::Recycled,
                Resumed::Terminal | Resumed::Discarded => ExitOutcome::Destroyed,
            }
        } else {
            self.set_status(TaskStatus::Dead);
            my_ctx.switch_to(&carrier_ctx, true);
            ExitOutcome::Destroyed
        }
    }

    // =========================================================================
    // Timeouts, control group, I/O registration
    // =========================================================================

    pub(crate) fn set_timeout(&self, timeout: &Arc<TimeOut>) {
        *self.timeout.lock() = Some(Arc::downgrade(timeout));
    }

    pub(crate) fn take_timeout(&self) -> Option<Arc<TimeOut>> {
        self.timeout.lock().take().and_then(|weak| weak.upgrade())
    }

    /// Clear the back-reference if it still points at `timeout`
    pub(crate) fn clear_timeout_if(&self, timeout: &Arc<TimeOut>) {
        let mut slot = self.timeout.lock();
        if slot
            .as_ref()
            .map_or(false, |weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(timeout)))
        {
            *slot = None;
        }
    }

    /// Whether a timeout is armed for this task
    pub fn has_timeout(&self) -> bool {
        self.timeout
            .lock()
            .as_ref()
            .map_or(false, |weak| weak.strong_count() > 0)
    }

    /// Control group this task is attached to
    pub fn cgroup(&self) -> Option<Arc<ControlGroup>> {
        self.cgroup.lock().clone()
    }

    pub(crate) fn set_cgroup(&self, group: Option<Arc<ControlGroup>>) {
        *self.cgroup.lock() = group;
    }

    pub(crate) fn io_channel(&self) -> Option<Channel> {
        *self.io_channel.lock()
    }

    pub(crate) fn set_io_channel(&self, channel: Option<Channel>) {
        *self.io_channel.lock() = channel;
    }

    pub(crate) fn set_io_ready(&self, mask: u8) {
        self.io_ready.fetch_or(mask, Ordering::AcqRel);
    }

    pub(crate) fn take_io_ready(&self) -> u8 {
        self.io_ready.swap(0, Ordering::AcqRel)
    }

    // =========================================================================
    // Parking
    // =========================================================================

    /// Parker for one blocking axis
    pub fn parker(&self, axis: ParkAxis) -> &Parker {
        match axis {
            ParkAxis::User => &self.user_parker,
            ParkAxis::Internal => &self.internal_parker,
        }
    }

    /// Unpark one axis: wake the task if it is blocked, else leave a permit
    pub(crate) fn unpark(self: &Arc<Self>, axis: ParkAxis) {
        let parker = self.parker(axis);
        match parker.release() {
            Wake::Permit => {}
            Wake::Native => parker.notify_native(),
            Wake::Cooperative => {
                if let Some(shared) = self.shared() {
                    shared.wakeup_task(self.clone());
                }
            }
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Request cancellation of the incarnation `generation` and force-wake
    /// it. Delivered at the task's next resume check-point.
    pub(crate) fn cancel(self: &Arc<Self>, generation: u64) -> bool {
        if self.generation() != generation || self.status() != TaskStatus::Alive {
            return false;
        }
        self.cancelled.store(true, Ordering::Release);
        self.unpark(ParkAxis::Internal);
        self.unpark(ParkAxis::User);
        true
    }

    /// Whether cancellation was requested for the current incarnation
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resume check-point: unwind if the task was cancelled or discarded
    pub(crate) fn checkpoint(&self) {
        if self.is_discarded() {
            panic::resume_unwind(Box::new(ContextDiscarded));
        }
        if self.is_cancelled() && !self.cancel_delivered.swap(true, Ordering::AcqRel) {
            panic::resume_unwind(Box::new(TaskCancelled));
        }
    }

    // =========================================================================
    // Accounting (advisory)
    // =========================================================================

    /// When the task last entered a run queue (monotonic ns)
    pub fn enqueue_ts(&self) -> i64 {
        self.enqueue_ts.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enqueue_ts(&self, ts: i64) {
        self.enqueue_ts.store(ts, Ordering::Relaxed);
    }

    /// When the task was last switched in (monotonic ns)
    pub fn entry_ts(&self) -> i64 {
        self.entry_ts.load(Ordering::Relaxed)
    }

    pub(crate) fn set_entry_ts(&self, ts: i64) {
        self.entry_ts.store(ts, Ordering::Relaxed);
    }

    /// Accumulated run time of the current incarnation
    pub fn run_time(&self) -> Duration {
        Duration::from_nanos(self.run_nanos.load(Ordering::Relaxed).max(0) as u64)
    }

    pub(crate) fn add_run_nanos(&self, nanos: i64) {
        self.run_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Run time since the entry timestamp; restarts the timestamp at `now`
    pub(crate) fn take_elapsed(&self, now: i64) -> i64 {
        let entry = self.entry_ts.swap(now, Ordering::Relaxed);
        if entry == 0 {
            return 0;
        }
        let elapsed = now.wrapping_sub(entry).max(0);
        self.add_run_nanos(elapsed);
        elapsed
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &*self.name.lock())
            .field("status", &self.status())
            .field("carrier", &self.carrier_index())
            .field("generation", &self.generation())
            .finish()
    }
}

// =============================================================================
// Join handles
// =============================================================================

/// Completion slot shared between a unit of work and its [`JoinHandle`]
pub(crate) struct JoinState<T> {
    result: Mutex<Option<Result<T, JoinError>>>,
    done: AtomicBool,
    cvar: Condvar,
    waiters: Mutex<Vec<Unparker>>,
    cancel_requested: AtomicBool,
    bound: Mutex<Option<(Arc<Task>, u64)>>,
}

impl<T> JoinState<T> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: AtomicBool::new(false),
            cvar: Condvar::new(),
            waiters: Mutex::new(Vec::new()),
            cancel_requested: AtomicBool::new(false),
            bound: Mutex::new(None),
        }
    }

    fn complete(&self, result: Result<T, JoinError>) {
        {
            let mut slot = self.result.lock();
            *slot = Some(result);
            self.done.store(true, Ordering::Release);
            self.cvar.notify_all();
        }
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            waiter.unpark();
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl<T: Send> WorkBinding for JoinState<T> {
    fn bind(&self, task: &Arc<Task>, generation: u64) {
        *self.bound.lock() = Some((task.clone(), generation));
    }

    fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    fn abandon(&self) {
        self.complete(Err(JoinError::Cancelled));
    }
}

/// Handle to a submitted unit of work
pub struct JoinHandle<T> {
    state: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(state: Arc<JoinState<T>>) -> Self {
        Self { state }
    }

    /// Id of the task running the work, once one picked it up
    pub fn task_id(&self) -> Option<TaskId> {
        self.state.bound.lock().as_ref().map(|(task, _)| task.id())
    }

    /// Whether the work has finished (successfully or not)
    pub fn is_finished(&self) -> bool {
        self.state.is_done()
    }

    /// Request cooperative cancellation.
    ///
    /// Work that has not started yet completes as cancelled without running;
    /// running work unwinds at its next blocking point.
    pub fn cancel(&self) {
        self.state.cancel_requested.store(true, Ordering::Release);
        let bound = self.state.bound.lock().clone();
        if let Some((task, generation)) = bound {
            task.cancel(generation);
        }
    }

    /// Wait for the work to finish and take its result.
    ///
    /// Inside a task this parks cooperatively; on a bare thread it blocks
    /// the thread.
    pub fn join(self) -> Result<T, JoinError> {
        self.wait(None);
        // Only a concurrent join_timeout on a shared reference could have
        // taken the value first.
        self.take().unwrap_or(Err(JoinError::Cancelled))
    }

    /// Wait up to `timeout`; `None` if the work is still running
    pub fn join_timeout(&self, timeout: Duration) -> Option<Result<T, JoinError>> {
        let deadline = crate::park::deadline_after(nano_time(), timeout);
        if self.wait(Some(deadline)) {
            self.take()
        } else {
            None
        }
    }

    fn take(&self) -> Option<Result<T, JoinError>> {
        self.state.result.lock().take()
    }

    fn wait(&self, deadline: Option<i64>) -> bool {
        if self.state.is_done() {
            return true;
        }
        match current_task() {
            Some(task) => self.wait_cooperative(&task, deadline),
            None => self.wait_native(deadline),
        }
    }

    fn wait_cooperative(&self, task: &Arc<Task>, deadline: Option<i64>) -> bool {
        loop {
            if self.state.is_done() {
                return true;
            }
            self.state
                .waiters
                .lock()
                .push(Unparker::for_task(task, ParkAxis::Internal));
            // complete() may have drained the waiters before our push
            if self.state.is_done() {
                return true;
            }
            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.wrapping_sub(nano_time());
                    if remaining <= 0 {
                        return self.state.is_done();
                    }
                    Some(Duration::from_nanos(remaining as u64))
                }
                None => None,
            };
            crate::current::park_task(task, ParkAxis::Internal, timeout);
        }
    }

    fn wait_native(&self, deadline: Option<i64>) -> bool {
        let mut slot = self.state.result.lock();
        while !self.state.is_done() {
            match deadline {
                None => self.state.cvar.wait(&mut slot),
                Some(deadline) => {
                    let remaining = deadline.wrapping_sub(nano_time());
                    if remaining <= 0 {
                        break;
                    }
                    self.state
                        .cvar
                        .wait_for(&mut slot, Duration::from_nanos(remaining as u64));
                }
            }
        }
        self.state.is_done()
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task_id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

//! Engine: the group of carriers and everything they share
//!
//! The [`Engine`] owns N carriers, the global pull queue, the global task
//! cache and the shutdown protocol. Carriers and tasks reach the shared
//! state through [`Shared`].

use crate::cache::TaskCache;
use crate::carrier::{Carrier, CarrierState, Dispatch, Runnable};
use crate::cgroup::ControlGroup;
use crate::config::{SchedulerConfig, SchedulingPolicy};
use crate::error::{SchedError, SchedResult};
use crate::event::{EventPump, NoopEventPump};
use crate::park::{ParkAxis, Wake};
use crate::stats::{Counters, SchedulerStats};
use crate::task::{current_task, JoinHandle, Task, TaskId, TaskStatus, Work};
use crate::timer::{PreciseTimer, TimeOut, TimeoutAction, PRECISE_OWNER};
use crossbeam_deque::Injector;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long dropping an engine waits for its carriers
const DROP_WAIT: Duration = Duration::from_secs(5);

/// Interval at which the drain task re-checks outstanding work
const DRAIN_POLL: Duration = Duration::from_millis(1);

/// State shared by the engine, its carriers and its tasks
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    carriers: Vec<Arc<Carrier>>,
    pub(crate) injector: Injector<Runnable>,
    pub(crate) global_cache: TaskCache,
    pub(crate) stats: Counters,

    /// ALIVE tasks by id
    live: DashMap<TaskId, Arc<Task>>,
    /// Work submitted and not yet finished
    outstanding: AtomicU64,

    accepting: AtomicBool,
    shutdown: AtomicBool,
    terminated: AtomicBool,

    running_carriers: AtomicUsize,
    exit_lock: Mutex<()>,
    exit_cvar: Condvar,

    pub(crate) event_pump: Arc<dyn EventPump>,
    pub(crate) io_waiters: AtomicUsize,
    io_poll_lock: Mutex<()>,

    precise: Option<Arc<PreciseTimer>>,
    next_notify: AtomicUsize,
}

impl Shared {
    pub(crate) fn carriers(&self) -> &[Arc<Carrier>] {
        &self.carriers
    }

    pub(crate) fn carrier(&self, index: usize) -> &Arc<Carrier> {
        debug_assert!(index < self.carriers.len(), "carrier index {} out of range", index);
        &self.carriers[index % self.carriers.len()]
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn precise_timer(&self) -> Option<&Arc<PreciseTimer>> {
        self.precise.as_ref()
    }

    // =========================================================================
    // Submission
    // =========================================================================

    fn submit<F, T>(
        &self,
        name: String,
        group: Option<Arc<ControlGroup>>,
        internal: bool,
        f: F,
    ) -> SchedResult<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        // Count first so the drain task never misses in-flight work
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if !internal && !self.accepting.load(Ordering::SeqCst) {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            Counters::bump(&self.stats.tasks_rejected);
            return Err(SchedError::Rejected);
        }
        if let Some(group) = &group {
            if group.is_destroyed() {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                Counters::bump(&self.stats.tasks_rejected);
                return Err(SchedError::Rejected);
            }
        }
        Counters::bump(&self.stats.tasks_submitted);

        let (work, state) = Work::new(f);
        self.place(Dispatch { work, name, group });
        Ok(JoinHandle::new(state))
    }

    fn place(&self, dispatch: Dispatch) {
        let runnable = Runnable::Spawn(dispatch);
        match self.config.policy {
            SchedulingPolicy::Pull => match self.own_current_task() {
                Some(task) => self.carrier(task.carrier_index()).enqueue(runnable),
                None => {
                    self.injector.push(runnable);
                    self.notify_idle_carrier();
                }
            },
            SchedulingPolicy::Push => {
                let target = self.push_target();
                self.carrier(target).enqueue(runnable);
            }
        }
    }

    /// The calling task, if it belongs to this engine
    fn own_current_task(&self) -> Option<Arc<Task>> {
        current_task().filter(|task| {
            task.shared()
                .map_or(false, |shared| std::ptr::eq(Arc::as_ptr(&shared), self))
        })
    }

    /// Least-loaded of `push_retry` randomly sampled carriers
    fn push_target(&self) -> usize {
        let mut rng = rand::thread_rng();
        let n = self.carriers.len();
        let mut best = rng.gen_range(0..n);
        for _ in 1..self.config.push_retry {
            let candidate = rng.gen_range(0..n);
            if self.carriers[candidate].queue_len() < self.carriers[best].queue_len() {
                best = candidate;
            }
        }
        best
    }

    /// Wake one carrier, preferring an idle one
    fn notify_idle_carrier(&self) {
        let n = self.carriers.len();
        let start = self.next_notify.fetch_add(1, Ordering::Relaxed) % n;
        let target = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| self.carriers[i].state() == CarrierState::Idle)
            .unwrap_or(start);
        self.carriers[target].notify();
    }

    // =========================================================================
    // Task bookkeeping
    // =========================================================================

    pub(crate) fn task_started(&self, task: &Arc<Task>) {
        self.live.insert(task.id(), task.clone());
    }

    /// The global running-count decrement of an exiting task
    pub(crate) fn task_exited(&self, task: &Task) {
        self.live.remove(&task.id());
        self.finish_one();
    }

    /// Work completed without ever getting a task
    pub(crate) fn work_abandoned(&self) {
        self.finish_one();
    }

    fn finish_one(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        Counters::bump(&self.stats.tasks_completed);
    }

    pub(crate) fn live_task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.live.get(&id).map(|entry| entry.value().clone())
    }

    /// Pop a cached task from a random peer. Fails soft during shutdown so
    /// callers fall back to allocating.
    pub(crate) fn steal_cached(&self, thief: usize) -> Option<Arc<Task>> {
        if self.is_shutdown() || self.carriers.len() < 2 {
            return None;
        }
        let n = self.carriers.len();
        let start = rand::thread_rng().gen_range(0..n);
        (0..n)
            .map(|offset| (start + offset) % n)
            .filter(|&i| i != thief)
            .find_map(|i| self.carriers[i].cache().pop())
    }

    /// Enqueue a resume entry on the task's owning carrier. Safe from any
    /// thread; duplicate wakeups collapse into one entry.
    pub(crate) fn wakeup_task(&self, task: Arc<Task>) {
        if task.status() != TaskStatus::Alive || task.is_thread_task() {
            return;
        }
        if !task.mark_enqueued() {
            return;
        }
        task.set_enqueue_ts(crate::timer::nano_time());
        let owner = task.carrier_index();
        self.carrier(owner).enqueue(Runnable::Resume(task));
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Run a due timeout's action
    pub(crate) fn fire_timeout(&self, timeout: Arc<TimeOut>) {
        if timeout.is_canceled() {
            return;
        }
        Counters::bump(&self.stats.timers_fired);
        let task = timeout.task().clone();
        task.clear_timeout_if(&timeout);
        match timeout.action() {
            TimeoutAction::Resume => self.wakeup_task(task),
            TimeoutAction::WakeCooperative(axis) | TimeoutAction::WakeNative(axis) => {
                let parker = task.parker(axis);
                match parker.wake_waiting() {
                    Some(Wake::Cooperative) => self.wakeup_task(task),
                    Some(Wake::Native) => parker.notify_native(),
                    Some(Wake::Permit) | None => {}
                }
            }
        }
    }

    /// Cancel the task's pending timeout, if any
    pub(crate) fn cancel_task_timeout(&self, task: &Task) {
        let Some(timeout) = task.take_timeout() else {
            return;
        };
        Counters::bump(&self.stats.timers_cancelled);
        if timeout.owner() == PRECISE_OWNER {
            if let Some(timer) = &self.precise {
                timer.manager().cancel_timer(&timeout, false);
            }
            return;
        }
        let local = timeout.owner() == task.carrier_index();
        self.carrier(timeout.owner())
            .timers()
            .cancel_timer(&timeout, local);
    }

    // =========================================================================
    // I/O
    // =========================================================================

    pub(crate) fn has_io_waiters(&self) -> bool {
        self.io_waiters.load(Ordering::Acquire) > 0
    }

    /// Poll the event pump for up to `slice` and wake ready tasks. Only one
    /// carrier polls at a time; returns false if another one already is.
    pub(crate) fn poll_events(&self, slice: Duration) -> bool {
        let Some(_guard) = self.io_poll_lock.try_lock() else {
            return false;
        };
        match self.event_pump.wait_for_events(Some(slice)) {
            Ok(events) => {
                for event in events {
                    let Some(task) = self.live_task(event.task) else {
                        continue;
                    };
                    if task.io_channel() == Some(event.channel) {
                        task.set_io_ready(event.ready.bits());
                        task.unpark(ParkAxis::Internal);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "event pump failed"),
        }
        true
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Body of the drain task: force-wake live tasks until only the drain
    /// task itself is outstanding, then terminate the carriers.
    fn drain(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::SeqCst);
        let me = current_task().map(|t| t.id());
        tracing::debug!(outstanding = self.outstanding.load(Ordering::SeqCst), "draining");

        while self.outstanding.load(Ordering::SeqCst) > 1 {
            let blocked: Vec<Arc<Task>> = self
                .live
                .iter()
                .filter(|entry| Some(*entry.key()) != me)
                .map(|entry| entry.value().clone())
                .collect();
            for task in blocked {
                if task.parker(ParkAxis::Internal).state().is_waiting() {
                    task.unpark(ParkAxis::Internal);
                }
                if task.parker(ParkAxis::User).state().is_waiting() {
                    task.unpark(ParkAxis::User);
                }
            }
            crate::current::sleep(DRAIN_POLL);
        }

        self.terminated.store(true, Ordering::SeqCst);
        for carrier in &self.carriers {
            carrier.notify();
        }
        tracing::info!("engine drained");
    }

    pub(crate) fn carrier_exited(&self) {
        if self.running_carriers.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(timer) = &self.precise {
                timer.stop();
            }
            let discarded = self.global_cache.drain_discard();
            tracing::debug!(discarded, "global task cache released");
            let _guard = self.exit_lock.lock();
            self.exit_cvar.notify_all();
        }
    }

    fn await_carriers(&self, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        let mut guard = self.exit_lock.lock();
        while self.running_carriers.load(Ordering::Acquire) > 0 {
            match timeout {
                None => self.exit_cvar.wait(&mut guard),
                Some(timeout) => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return false;
                    }
                    self.exit_cvar.wait_for(&mut guard, timeout - elapsed);
                }
            }
        }
        true
    }
}

/// The M:N scheduling engine
pub struct Engine {
    shared: Arc<Shared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Engine {
    /// Start an engine with no event pump
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        Self::with_event_pump(config, Arc::new(NoopEventPump))
    }

    /// Start an engine that waits on I/O through `pump`
    pub fn with_event_pump(config: SchedulerConfig, pump: Arc<dyn EventPump>) -> SchedResult<Self> {
        config.validate()?;
        let workers = config.effective_workers();
        let carriers = (0..workers)
            .map(|i| Arc::new(Carrier::new(i, config.carrier_cache_size)))
            .collect();
        let precise = config.high_precision_timer.then(PreciseTimer::new);

        let shared = Arc::new(Shared {
            global_cache: TaskCache::new(config.global_cache_size),
            carriers,
            injector: Injector::new(),
            stats: Counters::default(),
            live: DashMap::new(),
            outstanding: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            running_carriers: AtomicUsize::new(0),
            exit_lock: Mutex::new(()),
            exit_cvar: Condvar::new(),
            event_pump: pump,
            io_waiters: AtomicUsize::new(0),
            io_poll_lock: Mutex::new(()),
            precise,
            next_notify: AtomicUsize::new(0),
            config,
        });

        if let Some(timer) = &shared.precise {
            timer.start(Arc::downgrade(&shared))?;
        }

        let mut handles = Vec::with_capacity(workers);
        for carrier in shared.carriers() {
            shared.running_carriers.fetch_add(1, Ordering::AcqRel);
            match carrier.start(shared.clone()) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shared.running_carriers.fetch_sub(1, Ordering::AcqRel);
                    tracing::error!(carrier = carrier.index(), error = %e, "failed to start carrier");
                    shared.accepting.store(false, Ordering::SeqCst);
                    shared.shutdown.store(true, Ordering::SeqCst);
                    shared.terminated.store(true, Ordering::SeqCst);
                    for started in shared.carriers() {
                        started.notify();
                    }
                    if let Some(timer) = &shared.precise {
                        timer.stop();
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            workers,
            policy = %shared.config.policy,
            precise_timer = shared.config.high_precision_timer,
            "engine started"
        );
        Ok(Self {
            shared,
            handles: Mutex::new(handles),
        })
    }

    /// Submit a unit of work.
    ///
    /// Rejected once [`Engine::shutdown`] has been called.
    pub fn submit<F, T>(&self, name: impl Into<String>, f: F) -> SchedResult<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.shared.submit(name.into(), None, false, f)
    }

    /// Submit a unit of work that runs under `group`'s CPU quota
    pub fn submit_in<F, T>(
        &self,
        group: &Arc<ControlGroup>,
        name: impl Into<String>,
        f: F,
    ) -> SchedResult<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.shared.submit(name.into(), Some(group.clone()), false, f)
    }

    /// Run named blocking code as a task or on its own OS thread, as the
    /// configured thread-as-task policy decides.
    pub fn spawn_thread<F, T>(&self, name: impl Into<String>, f: F) -> SchedResult<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        if self.shared.config.thread_as_task.decide(&name) {
            tracing::trace!(name = %name, "running thread as task");
            return self.submit(name, f);
        }
        if !self.shared.accepting.load(Ordering::SeqCst) {
            Counters::bump(&self.shared.stats.tasks_rejected);
            return Err(SchedError::Rejected);
        }
        let (work, state) = Work::new(f);
        thread::Builder::new()
            .name(name)
            .spawn(move || work.run())
            .map_err(SchedError::Spawn)?;
        Ok(JoinHandle::new(state))
    }

    /// Cooperatively cancel a live task by id
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.shared.live_task(id) {
            Some(task) => task.cancel(task.generation()),
            None => false,
        }
    }

    /// Stop accepting work and drain. Idempotent.
    ///
    /// Queued and running work finishes normally; blocked tasks are
    /// force-woken until they exit.
    pub fn shutdown(&self) {
        if !self.shared.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("engine shutting down");
        let shared = self.shared.clone();
        let drained = self
            .shared
            .submit("skein-drain".to_string(), None, true, move || shared.drain());
        if let Err(e) = drained {
            tracing::error!(error = %e, "failed to submit drain task");
        }
    }

    /// Not supported: destroying contexts mid-flight is unsafe
    pub fn shutdown_now(&self) -> SchedResult<()> {
        Err(SchedError::Unsupported(
            "shutdown_now: running tasks cannot be destroyed mid-flight",
        ))
    }

    /// Wait until every carrier has exited; false on timeout
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let done = self.shared.await_carriers(Some(timeout));
        if done {
            for handle in self.handles.lock().drain(..) {
                let _ = handle.join();
            }
        }
        done
    }

    /// Whether `shutdown` was called
    pub fn is_shutdown(&self) -> bool {
        !self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Whether every carrier has exited
    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated() && self.shared.running_carriers.load(Ordering::Acquire) == 0
    }

    /// Number of carriers
    pub fn worker_count(&self) -> usize {
        self.shared.carriers().len()
    }

    /// Active configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.snapshot(
            self.shared.outstanding.load(Ordering::SeqCst),
            self.shared.live.len(),
        )
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
        // A task of this engine cannot wait for its own carriers
        let inside = current_task()
            .and_then(|t| t.shared())
            .map_or(false, |s| Arc::ptr_eq(&s, &self.shared));
        if inside {
            return;
        }
        if !self.await_termination(DROP_WAIT) {
            tracing::warn!("engine dropped before its carriers exited");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workers", &self.worker_count())
            .field("policy", &self.shared.config.policy)
            .field("shutdown", &self.is_shutdown())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

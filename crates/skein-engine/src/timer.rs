//! Timers: per-carrier deadline heaps and the high-precision timer thread
//!
//! Each carrier owns a [`TimerManager`]: a binary min-heap of [`TimeOut`]s
//! keyed by deadline. Only the owning carrier (or the task it is currently
//! running) mutates the heap directly; a cancellation coming from any other
//! thread goes through the lock-free removal queue and is applied the next
//! time the owner processes its timers.
//!
//! With `high_precision_timer` enabled, deadlines live in one shared manager
//! driven by a dedicated thread that sleeps exactly until the next deadline.

use crate::error::{SchedError, SchedResult};
use crate::park::ParkAxis;
use crate::registry;
use crate::scheduler::Shared;
use crate::task::Task;
use crossbeam::queue::SegQueue;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Owner id of timeouts held by the high-precision timer thread
pub(crate) const PRECISE_OWNER: usize = usize::MAX;

/// Largest distance between now and a deadline; keeps `deadline - now`
/// meaningful under wrapping arithmetic.
const MAX_DELAY: i64 = i64::MAX >> 1;

const INITIAL_CAPACITY: usize = 16;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic time in nanoseconds since the first call in this process
pub fn nano_time() -> i64 {
    i64::try_from(EPOCH.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

/// Clamp a deadline so that signed comparisons against `now` stay correct
pub fn normalize_deadline(now: i64, deadline: i64) -> i64 {
    let delay = deadline.wrapping_sub(now);
    if delay > MAX_DELAY {
        now.wrapping_add(MAX_DELAY)
    } else {
        deadline
    }
}

/// `a` strictly before `b`, tolerant of wraparound
#[inline]
fn before(a: i64, b: i64) -> bool {
    a.wrapping_sub(b) < 0
}

/// What happens when a timeout fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Enqueue the task for resumption unconditionally (quota throttling)
    Resume,
    /// Wake the task if it is still cooperatively parked on the axis
    WakeCooperative(ParkAxis),
    /// Wake the task if it is still natively parked on the axis
    WakeNative(ParkAxis),
}

/// A scheduled deadline-triggered action
pub struct TimeOut {
    task: Arc<Task>,
    deadline: i64,
    action: TimeoutAction,
    owner: usize,
    canceled: AtomicBool,
    /// Position in the owner's heap, -1 once removed
    index: AtomicIsize,
}

impl TimeOut {
    pub(crate) fn new(
        task: Arc<Task>,
        now: i64,
        deadline: i64,
        action: TimeoutAction,
        owner: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            task,
            deadline: normalize_deadline(now, deadline),
            action,
            owner,
            canceled: AtomicBool::new(false),
            index: AtomicIsize::new(-1),
        })
    }

    /// Target task
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Deadline in monotonic nanoseconds
    pub fn deadline(&self) -> i64 {
        self.deadline
    }

    /// Action to run on expiry
    pub fn action(&self) -> TimeoutAction {
        self.action
    }

    /// Id of the timer manager that holds this timeout
    pub fn owner(&self) -> usize {
        self.owner
    }

    /// Whether `cancel_timer` was called
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Heap index, or -1 when not in a heap
    pub fn heap_index(&self) -> isize {
        self.index.load(Ordering::Acquire)
    }

    fn set_index(&self, index: isize) {
        self.index.store(index, Ordering::Release);
    }
}

impl std::fmt::Debug for TimeOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeOut")
            .field("task", &self.task.id())
            .field("deadline", &self.deadline)
            .field("action", &self.action)
            .field("owner", &self.owner)
            .field("canceled", &self.is_canceled())
            .field("index", &self.heap_index())
            .finish()
    }
}

/// Min-heap of timeouts plus a removal queue for foreign cancellations.
///
/// A carrier's heap is only touched by that carrier or by the task holding
/// its baton, so the heap lock is uncontended there. It is contended only in
/// the precise timer's shared manager, which takes registrations from any
/// thread. Cancels from other carriers go through the removal queue and
/// never take the heap lock.
pub struct TimerManager {
    owner: usize,
    heap: Mutex<Vec<Arc<TimeOut>>>,
    removals: SegQueue<Arc<TimeOut>>,
}

impl TimerManager {
    /// Create an empty manager owned by carrier `owner`
    pub fn new(owner: usize) -> Self {
        Self {
            owner,
            heap: Mutex::new(Vec::with_capacity(INITIAL_CAPACITY)),
            removals: SegQueue::new(),
        }
    }

    /// Owner id
    pub fn owner(&self) -> usize {
        self.owner
    }

    /// Insert a timeout. O(log n).
    pub fn add_timer(&self, timeout: Arc<TimeOut>) {
        debug_assert_eq!(timeout.owner, self.owner, "timeout added to foreign heap");
        let mut heap = self.heap.lock();
        if heap.len() == heap.capacity() {
            let grow = heap.capacity().max(INITIAL_CAPACITY);
            heap.reserve_exact(grow);
        }
        let index = heap.len();
        timeout.set_index(index as isize);
        heap.push(timeout);
        sift_up(&mut heap, index);
    }

    /// Cancel a timeout.
    ///
    /// `local` means the caller runs on the owning carrier and may touch the
    /// heap directly; otherwise the removal is queued for the owner.
    pub fn cancel_timer(&self, timeout: &Arc<TimeOut>, local: bool) {
        timeout.canceled.store(true, Ordering::Release);
        if local {
            let mut heap = self.heap.lock();
            remove_at(&mut heap, timeout);
        } else {
            self.removals.push(timeout.clone());
        }
    }

    /// Drain the removal queue, fire every due timeout in deadline order and
    /// return the next pending deadline.
    pub fn process_timeouts_and_get_wait_deadline<F>(&self, now: i64, mut fire: F) -> Option<i64>
    where
        F: FnMut(Arc<TimeOut>),
    {
        let mut expired = Vec::new();
        let next = {
            let mut heap = self.heap.lock();
            while let Some(timeout) = self.removals.pop() {
                remove_at(&mut heap, &timeout);
            }
            while let Some(top) = heap.first() {
                if before(now, top.deadline) {
                    break;
                }
                let Some(timeout) = pop_min(&mut heap) else {
                    break;
                };
                if !timeout.is_canceled() {
                    expired.push(timeout);
                }
            }
            heap.first().map(|t| t.deadline)
        };
        for timeout in expired {
            fire(timeout);
        }
        next
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<i64> {
        self.heap.lock().first().map(|t| t.deadline)
    }

    /// Number of timeouts in the heap (cancelled-but-not-drained included)
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Whether the heap is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued foreign cancellations
    pub fn pending_removals(&self) -> usize {
        self.removals.len()
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("owner", &self.owner)
            .field("len", &self.len())
            .field("pending_removals", &self.pending_removals())
            .finish()
    }
}

fn swap_entries(heap: &mut [Arc<TimeOut>], a: usize, b: usize) {
    heap.swap(a, b);
    heap[a].set_index(a as isize);
    heap[b].set_index(b as isize);
}

fn sift_up(heap: &mut [Arc<TimeOut>], mut index: usize) {
    while index > 0 {
        let parent = (index - 1) / 2;
        if !before(heap[index].deadline, heap[parent].deadline) {
            break;
        }
        swap_entries(heap, index, parent);
        index = parent;
    }
}

fn sift_down(heap: &mut [Arc<TimeOut>], mut index: usize) {
    let len = heap.len();
    loop {
        let left = 2 * index + 1;
        if left >= len {
            break;
        }
        let right = left + 1;
        let mut smallest = left;
        if right < len && before(heap[right].deadline, heap[left].deadline) {
            smallest = right;
        }
        if !before(heap[smallest].deadline, heap[index].deadline) {
            break;
        }
        swap_entries(heap, index, smallest);
        index = smallest;
    }
}

fn pop_min(heap: &mut Vec<Arc<TimeOut>>) -> Option<Arc<TimeOut>> {
    let last = heap.len().checked_sub(1)?;
    swap_entries(heap, 0, last);
    let top = heap.pop()?;
    top.set_index(-1);
    if !heap.is_empty() {
        sift_down(heap, 0);
    }
    Some(top)
}

/// Swap-with-last removal. Returns false if the timeout was not present
/// (already fired or already removed).
fn remove_at(heap: &mut Vec<Arc<TimeOut>>, timeout: &Arc<TimeOut>) -> bool {
    let index = timeout.heap_index();
    if index < 0 {
        return false;
    }
    let index = index as usize;
    if index >= heap.len() || !Arc::ptr_eq(&heap[index], timeout) {
        return false;
    }
    let last = heap.len() - 1;
    if index != last {
        swap_entries(heap, index, last);
    }
    heap.pop();
    timeout.set_index(-1);
    if index < heap.len() {
        sift_down(heap, index);
        sift_up(heap, index);
    }
    true
}

/// High-precision timer thread
///
/// Instead of carriers polling their own heaps between tasks, this thread
/// waits on a condvar for exactly the next deadline and fires the action
/// itself.
pub(crate) struct PreciseTimer {
    manager: TimerManager,
    /// Bumped on every registration so a sleeping thread notices new work
    seq: Mutex<u64>,
    notify: Condvar,
    shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PreciseTimer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            manager: TimerManager::new(PRECISE_OWNER),
            seq: Mutex::new(0),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Start the timer thread
    pub(crate) fn start(self: &Arc<Self>, shared: Weak<Shared>) -> SchedResult<()> {
        let timer = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("skein-timer".to_string())
            .spawn(move || timer.run_loop(shared))
            .map_err(SchedError::Spawn)?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the timer thread, waiting briefly for it to exit
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let _seq = self.seq.lock();
            self.notify.notify_one();
        }

        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        let start = Instant::now();
        let timeout = Duration::from_secs(2);
        loop {
            if handle.is_finished() {
                let _ = handle.join();
                return;
            }
            if start.elapsed() > timeout {
                tracing::warn!("timer thread did not stop in time");
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub(crate) fn manager(&self) -> &TimerManager {
        &self.manager
    }

    /// Register a timeout and wake the thread if it sleeps past the deadline
    pub(crate) fn register(&self, timeout: Arc<TimeOut>) {
        self.manager.add_timer(timeout);
        let mut seq = self.seq.lock();
        *seq = seq.wrapping_add(1);
        self.notify.notify_one();
    }

    fn run_loop(&self, shared: Weak<Shared>) {
        registry::register_worker_thread();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let seen = *self.seq.lock();

            let next = {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                self.manager
                    .process_timeouts_and_get_wait_deadline(nano_time(), |t| shared.fire_timeout(t))
            };

            let mut seq = self.seq.lock();
            // Re-check under the lock: stop() may have notified between the
            // first check and here.
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if *seq != seen {
                continue;
            }
            match next {
                Some(deadline) => {
                    let remaining = deadline.wrapping_sub(nano_time());
                    if remaining > 0 {
                        self.notify
                            .wait_for(&mut seq, Duration::from_nanos(remaining as u64));
                    }
                }
                None => self.notify.wait(&mut seq),
            }
        }

        registry::unregister_worker_thread();
        tracing::debug!("timer thread shutting down");
    }
}

impl Drop for PreciseTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    const MS: i64 = 1_000_000;

    fn test_task() -> Arc<Task> {
        Task::new(Weak::new())
    }

    fn timeout_at(owner: usize, deadline: i64) -> Arc<TimeOut> {
        TimeOut::new(test_task(), 0, deadline, TimeoutAction::Resume, owner)
    }

    fn drain(manager: &TimerManager, now: i64) -> (Vec<i64>, Option<i64>) {
        let mut fired = Vec::new();
        let next = manager.process_timeouts_and_get_wait_deadline(now, |t| fired.push(t.deadline()));
        (fired, next)
    }

    #[test]
    fn test_manager_creation() {
        let manager = TimerManager::new(3);
        assert_eq!(manager.owner(), 3);
        assert!(manager.is_empty());
        assert_eq!(manager.next_deadline(), None);
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let manager = TimerManager::new(0);
        for deadline in [50, 10, 30, 20, 40] {
            manager.add_timer(timeout_at(0, deadline * MS));
        }
        assert_eq!(manager.next_deadline(), Some(10 * MS));

        let (fired, next) = drain(&manager, 35 * MS);
        assert_eq!(fired, vec![10 * MS, 20 * MS, 30 * MS]);
        assert_eq!(next, Some(40 * MS));

        let (fired, next) = drain(&manager, 100 * MS);
        assert_eq!(fired, vec![40 * MS, 50 * MS]);
        assert_eq!(next, None);
    }

    #[test]
    fn test_heap_grows_past_initial_capacity() {
        let manager = TimerManager::new(0);
        for i in (0..200).rev() {
            manager.add_timer(timeout_at(0, i));
        }
        assert_eq!(manager.len(), 200);
        let (fired, _) = drain(&manager, 1_000);
        assert_eq!(fired, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_local_cancel_removes_immediately() {
        let manager = TimerManager::new(0);
        let keep = timeout_at(0, 10 * MS);
        let drop_me = timeout_at(0, 5 * MS);
        manager.add_timer(keep.clone());
        manager.add_timer(drop_me.clone());

        manager.cancel_timer(&drop_me, true);
        assert_eq!(drop_me.heap_index(), -1);
        assert!(drop_me.is_canceled());
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.next_deadline(), Some(10 * MS));

        // Cancelling twice is harmless
        manager.cancel_timer(&drop_me, true);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_cross_carrier_cancel_never_fires() {
        // Armed for now+50ms on carrier 0, cancelled from another carrier at
        // now+10ms, polled after the deadline.
        let now = 1_000 * MS;
        let manager = TimerManager::new(0);
        let timeout = TimeOut::new(test_task(), now, now + 50 * MS, TimeoutAction::Resume, 0);
        manager.add_timer(timeout.clone());

        manager.cancel_timer(&timeout, false);
        assert_eq!(manager.pending_removals(), 1);
        // Still physically in the heap until the owner polls
        assert_eq!(manager.len(), 1);

        let (fired, next) = drain(&manager, now + 60 * MS);
        assert!(fired.is_empty());
        assert_eq!(next, None);
        assert_eq!(manager.pending_removals(), 0);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let manager = TimerManager::new(0);
        let timeout = timeout_at(0, MS);
        manager.add_timer(timeout.clone());
        let (fired, _) = drain(&manager, 2 * MS);
        assert_eq!(fired.len(), 1);

        manager.cancel_timer(&timeout, false);
        let (fired, _) = drain(&manager, 3 * MS);
        assert!(fired.is_empty());
        assert_eq!(manager.pending_removals(), 0);
    }

    #[test]
    fn test_normalize_deadline_clamps_far_future() {
        let now = 100;
        assert_eq!(normalize_deadline(now, i64::MAX), now + (i64::MAX >> 1));
        assert_eq!(normalize_deadline(now, 500), 500);
        // Past deadlines stay in the past
        assert_eq!(normalize_deadline(now, 50), 50);
    }

    #[test]
    fn test_ordering_across_wraparound() {
        // Deadlines straddling i64::MAX still compare correctly
        let now = i64::MAX - 10 * MS;
        let manager = TimerManager::new(0);
        let late = TimeOut::new(test_task(), now, now.wrapping_add(20 * MS), TimeoutAction::Resume, 0);
        let early = TimeOut::new(test_task(), now, now + 5 * MS, TimeoutAction::Resume, 0);
        manager.add_timer(late.clone());
        manager.add_timer(early.clone());
        assert_eq!(manager.next_deadline(), Some(early.deadline()));

        let mut fired = Vec::new();
        manager.process_timeouts_and_get_wait_deadline(now.wrapping_add(30 * MS), |t| {
            fired.push(t.deadline())
        });
        assert_eq!(fired, vec![early.deadline(), late.deadline()]);
    }

    #[test]
    fn test_random_add_cancel_poll_sequences() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _round in 0..50 {
            let manager = TimerManager::new(0);
            let mut live: Vec<Arc<TimeOut>> = Vec::new();
            let mut cancelled: BTreeSet<usize> = BTreeSet::new();
            let mut fired_total = Vec::new();
            let mut now = 0i64;

            for _ in 0..200 {
                match rng.gen_range(0..10) {
                    0..=5 => {
                        let deadline = now + rng.gen_range(0..100) * MS;
                        let timeout = timeout_at(0, deadline);
                        manager.add_timer(timeout.clone());
                        live.push(timeout);
                    }
                    6..=7 if !live.is_empty() => {
                        let pick = rng.gen_range(0..live.len());
                        let local = rng.gen_bool(0.5);
                        manager.cancel_timer(&live[pick], local);
                        cancelled.insert(Arc::as_ptr(&live[pick]) as usize);
                    }
                    _ => {
                        now += rng.gen_range(0..30) * MS;
                        let mut fired = Vec::new();
                        manager.process_timeouts_and_get_wait_deadline(now, |t| fired.push(t));
                        // Non-decreasing deadline order within one poll
                        for pair in fired.windows(2) {
                            assert!(pair[0].deadline() <= pair[1].deadline());
                        }
                        for t in &fired {
                            assert!(t.deadline() <= now);
                            assert!(!cancelled.contains(&(Arc::as_ptr(t) as usize)));
                        }
                        fired_total.extend(fired);
                    }
                }
            }

            now += 1_000 * MS;
            manager.process_timeouts_and_get_wait_deadline(now, |t| fired_total.push(t));

            // Fired set == non-cancelled set (cancel may have hit an already
            // fired timeout, which then counts as fired)
            let fired_ptrs: BTreeSet<usize> =
                fired_total.iter().map(|t| Arc::as_ptr(t) as usize).collect();
            assert_eq!(fired_ptrs.len(), fired_total.len(), "a timeout fired twice");
            for timeout in &live {
                let ptr = Arc::as_ptr(timeout) as usize;
                if !cancelled.contains(&ptr) {
                    assert!(fired_ptrs.contains(&ptr));
                }
            }
            assert!(manager.is_empty());
            assert_eq!(manager.pending_removals(), 0);
        }
    }
}

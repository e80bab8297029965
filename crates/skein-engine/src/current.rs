//! Operations for code running inside a task
//!
//! Every function here also works on a bare OS thread, where it falls back
//! to the native equivalent (`std::thread::sleep`, a thread-local parker).

use crate::carrier::Carrier;
use crate::context::Resumed;
use crate::error::{ContextDiscarded, SchedError, SchedResult};
use crate::event::{Channel, Interest};
use crate::park::{deadline_after, ParkAxis, Parker};
use crate::scheduler::Shared;
use crate::task::{current_task, Task, TaskId};
use crate::timer::{nano_time, TimeoutAction};
use std::fmt;
use std::panic;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

thread_local! {
    static THREAD_PARKER: Arc<Parker> = Arc::new(Parker::new());
}

/// Id of the task running on this thread
pub fn current_task_id() -> Option<TaskId> {
    current_task().map(|t| t.id())
}

/// Whether the caller runs inside a task
pub fn in_task() -> bool {
    current_task().is_some()
}

fn engine_task() -> Option<(Arc<Shared>, Arc<Task>)> {
    let task = current_task()?;
    let shared = task.shared()?;
    Some((shared, task))
}

/// Switch out and come back; unwinds if the context was discarded or the
/// task cancelled meanwhile.
fn suspend(shared: &Arc<Shared>, carrier: &Carrier, task: &Arc<Task>) {
    match carrier.schedule(shared, task) {
        Resumed::Continue => {}
        Resumed::Terminal | Resumed::Discarded => panic::resume_unwind(Box::new(ContextDiscarded)),
    }
    task.checkpoint();
}

/// Let other runnable tasks on this carrier go first
pub fn yield_now() {
    let Some((shared, task)) = engine_task() else {
        thread::yield_now();
        return;
    };
    task.checkpoint();
    let carrier = shared.carrier(task.carrier_index()).clone();
    if carrier.in_critical_section() {
        thread::yield_now();
        return;
    }
    carrier.defer_wakeup(task.clone());
    suspend(&shared, &carrier, &task);
}

/// Block the current task for at least `duration`
pub fn sleep(duration: Duration) {
    let Some(task) = current_task() else {
        thread::sleep(duration);
        return;
    };
    let deadline = deadline_after(nano_time(), duration);
    loop {
        let remaining = deadline.wrapping_sub(nano_time());
        if remaining <= 0 {
            return;
        }
        park_task(&task, ParkAxis::Internal, Some(Duration::from_nanos(remaining as u64)));
    }
}

/// Block until unparked. May return spuriously.
pub fn park() {
    match current_task() {
        Some(task) => park_task(&task, ParkAxis::User, None),
        None => THREAD_PARKER.with(|p| p.park_native(None)),
    }
}

/// Block until unparked or `timeout` elapses. May return spuriously.
pub fn park_timeout(timeout: Duration) {
    match current_task() {
        Some(task) => park_task(&task, ParkAxis::User, Some(timeout)),
        None => THREAD_PARKER.with(|p| p.park_native(Some(timeout))),
    }
}

/// Handle that unparks the calling task (or thread) from anywhere
pub fn current_unparker() -> Unparker {
    match current_task() {
        Some(task) => Unparker::for_task(&task, ParkAxis::User),
        None => Unparker {
            target: Target::Thread(THREAD_PARKER.with(|p| p.clone())),
        },
    }
}

/// Park the current task on `axis`
pub(crate) fn park_task(task: &Arc<Task>, axis: ParkAxis, timeout: Option<Duration>) {
    park_inner(task, axis, timeout, true);
}

fn park_inner(task: &Arc<Task>, axis: ParkAxis, timeout: Option<Duration>, clear_io: bool) {
    debug_assert!(
        current_task().map_or(false, |t| Arc::ptr_eq(&t, task)),
        "park from a context other than the task's own"
    );
    let Some(shared) = task.shared() else {
        task.parker(axis).park_native(timeout);
        return;
    };
    task.checkpoint();

    if let Some(t) = timeout {
        if t.as_nanos() < u128::from(shared.config.min_park_nanos) {
            yield_now();
            return;
        }
    }

    let carrier = shared.carrier(task.carrier_index()).clone();
    if clear_io {
        carrier.unregister_event(&shared, task);
    }
    if carrier.in_critical_section() {
        park_native_in_task(&shared, &carrier, task, axis, timeout);
        return;
    }

    let parker = task.parker(axis);
    if !parker.begin_park(false) {
        task.checkpoint();
        return;
    }
    if let Some(t) = timeout {
        let deadline = deadline_after(nano_time(), t);
        carrier.arm_timeout(&shared, task, deadline, TimeoutAction::WakeCooperative(axis), true);
    }
    match carrier.schedule(&shared, task) {
        Resumed::Continue => {}
        Resumed::Terminal | Resumed::Discarded => panic::resume_unwind(Box::new(ContextDiscarded)),
    }
    parker.end_park();
    if timeout.is_some() {
        shared.cancel_task_timeout(task);
    }
    task.checkpoint();
}

/// Park inside a critical section: block the task's OS thread instead of
/// switching out.
fn park_native_in_task(
    shared: &Arc<Shared>,
    carrier: &Carrier,
    task: &Arc<Task>,
    axis: ParkAxis,
    timeout: Option<Duration>,
) {
    let parker = task.parker(axis);
    if !parker.begin_park(true) {
        task.checkpoint();
        return;
    }
    let deadline = timeout.map(|t| deadline_after(nano_time(), t));
    match deadline {
        Some(deadline) if shared.precise_timer().is_some() => {
            carrier.arm_timeout(shared, task, deadline, TimeoutAction::WakeNative(axis), true);
            parker.wait_native(None);
            shared.cancel_task_timeout(task);
        }
        _ => parker.wait_native(deadline),
    }
    parker.end_park();
    task.checkpoint();
}

/// Run `f` without giving up the carrier: parks inside it block natively.
pub fn critical_section<R>(f: impl FnOnce() -> R) -> R {
    let Some((shared, task)) = engine_task() else {
        return f();
    };
    let carrier = shared.carrier(task.carrier_index()).clone();
    carrier.enter_critical();

    struct Exit(Arc<Carrier>);
    impl Drop for Exit {
        fn drop(&mut self) {
            self.0.exit_critical();
        }
    }
    let _exit = Exit(carrier);
    f()
}

/// Wait until `channel` is ready for `interest`, or `timeout` elapses.
///
/// Returns the readiness observed; empty on timeout or a spurious wakeup.
pub fn wait_io(channel: Channel, interest: Interest, timeout: Option<Duration>) -> SchedResult<Interest> {
    let (shared, task) = engine_task().ok_or(SchedError::NotInTask)?;
    let carrier = shared.carrier(task.carrier_index()).clone();
    task.take_io_ready();
    carrier.register_event(&shared, &task, channel, interest)?;

    park_inner(&task, ParkAxis::Internal, timeout, false);

    let ready = Interest::from_bits(task.take_io_ready());
    // The task may have been stolen while it waited
    shared
        .carrier(task.carrier_index())
        .unregister_event(&shared, &task);
    Ok(ready)
}

/// Handle that wakes a parked task or thread
#[derive(Clone)]
pub struct Unparker {
    target: Target,
}

#[derive(Clone)]
enum Target {
    Task {
        task: Arc<Task>,
        generation: u64,
        axis: ParkAxis,
    },
    Thread(Arc<Parker>),
}

impl Unparker {
    pub(crate) fn for_task(task: &Arc<Task>, axis: ParkAxis) -> Self {
        Self {
            target: Target::Task {
                task: task.clone(),
                generation: task.generation(),
                axis,
            },
        }
    }

    /// Wake the target, or leave a permit if it is not parked yet. A no-op
    /// once the task has moved on to other work.
    pub fn unpark(&self) {
        match &self.target {
            Target::Task {
                task,
                generation,
                axis,
            } => {
                if task.generation() == *generation {
                    task.unpark(*axis);
                }
            }
            Target::Thread(parker) => parker.unpark_native(),
        }
    }

    /// Id of the target task; `None` for a bare thread
    pub fn task_id(&self) -> Option<TaskId> {
        match &self.target {
            Target::Task { task, .. } => Some(task.id()),
            Target::Thread(_) => None,
        }
    }
}

impl fmt::Debug for Unparker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Task {
                task,
                generation,
                axis,
            } => f
                .debug_struct("Unparker")
                .field("task", &task.id())
                .field("generation", generation)
                .field("axis", axis)
                .finish(),
            Target::Thread(_) => f.debug_struct("Unparker").field("thread", &true).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_bare_thread_fallbacks() {
        assert!(!in_task());
        assert!(current_task_id().is_none());
        yield_now();

        let start = Instant::now();
        sleep(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_thread_unparker_permit() {
        let unparker = current_unparker();
        assert!(unparker.task_id().is_none());
        unparker.unpark();
        let start = Instant::now();
        park_timeout(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_thread_unparker_cross_thread() {
        let unparker = current_unparker();
        let remote = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            unparker.unpark();
        });
        park();
        remote.join().unwrap();
    }

    #[test]
    fn test_wait_io_requires_task() {
        assert!(matches!(
            wait_io(1, Interest::READABLE, None),
            Err(SchedError::NotInTask)
        ));
    }

    #[test]
    fn test_critical_section_outside_task() {
        assert_eq!(critical_section(|| 5), 5);
    }
}

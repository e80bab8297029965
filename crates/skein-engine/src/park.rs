//! Park/unpark handshake
//!
//! Every blocking operation in the engine funnels through a [`Parker`]: a
//! small state word (FREE / WAITING / PERMITTED) updated only by
//! compare-and-swap. An `unpark` that lands before the matching `park`
//! leaves a permit behind, so a wakeup is never lost. No lock is held across
//! a suspend point; the mutex below only backs the native (OS-thread) wait.
//!
//! WAITING comes in two flavours, cooperative and native, so the side that
//! frees a waiter learns from the same CAS how the waiter must be woken.

use crate::timer::nano_time;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Which of the two independent blocking axes a park applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParkAxis {
    /// Driven by user code (`park` / `Unparker::unpark`)
    User,
    /// Driven by the engine itself (sleep, join, I/O wait, drain)
    Internal,
}

/// State of one parking axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParkState {
    /// Nobody is blocked and no permit is pending
    Free = 0,
    /// A task is (about to be) suspended in its carrier's scheduling loop
    Waiting = 1,
    /// An unpark arrived while nobody was waiting
    Permitted = 2,
    /// An OS thread is (about to be) blocked on the condvar
    WaitingNative = 3,
}

impl ParkState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ParkState::Free,
            1 => ParkState::Waiting,
            2 => ParkState::Permitted,
            _ => ParkState::WaitingNative,
        }
    }

    /// Whether someone is blocked on the axis
    pub fn is_waiting(self) -> bool {
        matches!(self, ParkState::Waiting | ParkState::WaitingNative)
    }
}

/// Who was freed by an unpark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// Nobody; a permit was left (or was already pending)
    Permit,
    /// A suspended task: enqueue it on its carrier
    Cooperative,
    /// A blocked OS thread: signal the condvar
    Native,
}

/// One parking axis
#[derive(Debug)]
pub struct Parker {
    status: AtomicU8,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl Parker {
    /// Create a parker in the FREE state
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(ParkState::Free as u8),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> ParkState {
        ParkState::from_u8(self.status.load(Ordering::Acquire))
    }

    fn cas(&self, from: ParkState, to: ParkState) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Consume a pending permit or enter WAITING.
    ///
    /// Returns `true` when the caller must now block.
    pub(crate) fn begin_park(&self, native: bool) -> bool {
        let waiting = if native {
            ParkState::WaitingNative
        } else {
            ParkState::Waiting
        };
        loop {
            match self.state() {
                ParkState::Permitted => {
                    if self.cas(ParkState::Permitted, ParkState::Free) {
                        return false;
                    }
                }
                ParkState::Free => {
                    if self.cas(ParkState::Free, waiting) {
                        return true;
                    }
                }
                ParkState::Waiting | ParkState::WaitingNative => {
                    panic!("park: axis is already waiting (parked from two contexts)");
                }
            }
        }
    }

    /// Leave WAITING after a wakeup that did not come through `release`.
    /// No-op when an unpark already freed us.
    pub(crate) fn end_park(&self) {
        let _ = self.cas(ParkState::Waiting, ParkState::Free)
            || self.cas(ParkState::WaitingNative, ParkState::Free);
    }

    /// The unpark half of the handshake
    pub(crate) fn release(&self) -> Wake {
        loop {
            match self.state() {
                ParkState::Waiting => {
                    if self.cas(ParkState::Waiting, ParkState::Free) {
                        return Wake::Cooperative;
                    }
                }
                ParkState::WaitingNative => {
                    if self.cas(ParkState::WaitingNative, ParkState::Free) {
                        return Wake::Native;
                    }
                }
                ParkState::Free => {
                    if self.cas(ParkState::Free, ParkState::Permitted) {
                        return Wake::Permit;
                    }
                }
                ParkState::Permitted => return Wake::Permit,
            }
        }
    }

    /// Free a blocked owner without leaving a permit behind.
    ///
    /// Used by timeouts: a deadline that fires after the owner was already
    /// woken must not poison its next park.
    pub(crate) fn wake_waiting(&self) -> Option<Wake> {
        if self.cas(ParkState::Waiting, ParkState::Free) {
            Some(Wake::Cooperative)
        } else if self.cas(ParkState::WaitingNative, ParkState::Free) {
            Some(Wake::Native)
        } else {
            None
        }
    }

    /// Drop any pending permit. The axis must not be waiting.
    pub(crate) fn clear(&self) {
        let prev = ParkState::from_u8(self.status.swap(ParkState::Free as u8, Ordering::AcqRel));
        debug_assert!(!prev.is_waiting(), "clear: axis is still waiting");
    }

    /// Block the calling OS thread until the axis leaves WAITING or the
    /// deadline (monotonic nanoseconds) passes.
    pub(crate) fn wait_native(&self, deadline: Option<i64>) {
        let mut guard = self.lock.lock();
        while self.state() == ParkState::WaitingNative {
            match deadline {
                None => self.cvar.wait(&mut guard),
                Some(deadline) => {
                    let remaining = deadline.wrapping_sub(nano_time());
                    if remaining <= 0 {
                        break;
                    }
                    self.cvar
                        .wait_for(&mut guard, Duration::from_nanos(remaining as u64));
                }
            }
        }
    }

    /// Wake a native waiter after a successful `release`/`wake_waiting`
    pub(crate) fn notify_native(&self) {
        let _guard = self.lock.lock();
        self.cvar.notify_all();
    }

    /// Park the calling OS thread (bare-thread flavour of `park`)
    pub fn park_native(&self, timeout: Option<Duration>) {
        if !self.begin_park(true) {
            return;
        }
        let deadline = timeout.map(|t| deadline_after(nano_time(), t));
        self.wait_native(deadline);
        self.end_park();
    }

    /// Unpark a thread blocked in [`Parker::park_native`]
    pub fn unpark_native(&self) {
        if self.release() == Wake::Native {
            self.notify_native();
        }
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

/// Deadline `timeout` after `now`, saturating instead of wrapping
pub(crate) fn deadline_after(now: i64, timeout: Duration) -> i64 {
    let nanos = i64::try_from(timeout.as_nanos()).unwrap_or(i64::MAX);
    now.saturating_add(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_unpark_before_park_leaves_permit() {
        let parker = Parker::new();
        assert_eq!(parker.release(), Wake::Permit);
        assert_eq!(parker.state(), ParkState::Permitted);

        // Permit is consumed without blocking
        assert!(!parker.begin_park(false));
        assert_eq!(parker.state(), ParkState::Free);
    }

    #[test]
    fn test_double_unpark_keeps_single_permit() {
        let parker = Parker::new();
        parker.release();
        parker.release();
        assert!(!parker.begin_park(false));
        // Second park must block: only one permit was stored
        assert!(parker.begin_park(false));
        assert_eq!(parker.state(), ParkState::Waiting);
    }

    #[test]
    fn test_release_reports_waiter_kind() {
        let parker = Parker::new();
        assert!(parker.begin_park(false));
        assert_eq!(parker.release(), Wake::Cooperative);
        assert_eq!(parker.state(), ParkState::Free);

        assert!(parker.begin_park(true));
        assert!(parker.state().is_waiting());
        assert_eq!(parker.release(), Wake::Native);
        assert_eq!(parker.state(), ParkState::Free);
    }

    #[test]
    fn test_wake_waiting_never_leaves_permit() {
        let parker = Parker::new();
        assert_eq!(parker.wake_waiting(), None);
        assert_eq!(parker.state(), ParkState::Free);

        assert!(parker.begin_park(false));
        assert_eq!(parker.wake_waiting(), Some(Wake::Cooperative));
        assert_eq!(parker.state(), ParkState::Free);
    }

    #[test]
    fn test_end_park_after_release_is_noop() {
        let parker = Parker::new();
        assert!(parker.begin_park(true));
        parker.release();
        parker.end_park();
        assert_eq!(parker.state(), ParkState::Free);
        // A later unpark still leaves its permit
        parker.release();
        parker.end_park();
        assert_eq!(parker.state(), ParkState::Permitted);
    }

    #[test]
    fn test_clear_drops_permit() {
        let parker = Parker::new();
        parker.release();
        parker.clear();
        assert_eq!(parker.state(), ParkState::Free);
        assert!(parker.begin_park(false));
    }

    #[test]
    #[should_panic(expected = "already waiting")]
    fn test_double_park_is_protocol_violation() {
        let parker = Parker::new();
        assert!(parker.begin_park(false));
        parker.begin_park(true);
    }

    #[test]
    fn test_native_park_timeout() {
        let parker = Parker::new();
        let start = Instant::now();
        parker.park_native(Some(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(parker.state(), ParkState::Free);
    }

    #[test]
    fn test_native_unpark_from_other_thread() {
        let parker = Arc::new(Parker::new());
        let remote = parker.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.unpark_native();
        });

        let start = Instant::now();
        parker.park_native(None);
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_no_lost_wakeup_under_races() {
        // Each round races one unpark against one park; the park must
        // always return (either by permit or by wakeup).
        for _ in 0..200 {
            let parker = Arc::new(Parker::new());
            let remote = parker.clone();
            let handle = thread::spawn(move || remote.unpark_native());
            let start = Instant::now();
            parker.park_native(Some(Duration::from_secs(5)));
            assert!(start.elapsed() < Duration::from_secs(4));
            handle.join().unwrap();
            assert!(!parker.state().is_waiting());
        }
    }

    #[test]
    fn test_deadline_after_saturates() {
        assert_eq!(deadline_after(i64::MAX - 1, Duration::from_secs(10)), i64::MAX);
        assert_eq!(deadline_after(5, Duration::from_nanos(10)), 15);
    }
}

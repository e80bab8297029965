//! Resumable execution contexts
//!
//! The scheduler only needs three things from a context: create it with an
//! entry point and a stack size, switch to it (optionally terminally), and
//! ask whether it has exited. This implementation backs each task context
//! with a dedicated OS thread and passes a baton between contexts: a context
//! runs only while it holds the baton, and `switch_to` hands the baton over
//! and blocks until it comes back. Within one carrier exactly one context
//! holds the baton at a time, which gives the same cooperative semantics as
//! a register/stack switch.

use crate::registry;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Outcome of a suspension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumed {
    /// Baton handed back; continue running
    Continue,
    /// The switch was terminal; the caller must unwind and return
    Terminal,
    /// The context was discarded while suspended; unwind and return
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Closed,
    Open,
    Discarded,
}

#[derive(Debug)]
struct Gate {
    state: Mutex<GateState>,
    cvar: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Closed),
            cvar: Condvar::new(),
        }
    }

    fn open(&self) {
        let mut state = self.state.lock();
        if *state != GateState::Discarded {
            *state = GateState::Open;
        }
        self.cvar.notify_one();
    }

    fn discard(&self) {
        *self.state.lock() = GateState::Discarded;
        self.cvar.notify_one();
    }

    /// Block until the baton arrives
    fn pass(&self) -> Resumed {
        let mut state = self.state.lock();
        loop {
            match *state {
                GateState::Open => {
                    *state = GateState::Closed;
                    return Resumed::Continue;
                }
                GateState::Discarded => return Resumed::Discarded,
                GateState::Closed => self.cvar.wait(&mut state),
            }
        }
    }
}

/// A lightweight execution context
#[derive(Debug)]
pub struct Context {
    gate: Arc<Gate>,
    exited: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Native contexts wrap an existing thread (a carrier's thread task)
    native: bool,
}

impl Context {
    /// Context of the calling OS thread
    pub fn for_current_thread() -> Self {
        Self {
            gate: Arc::new(Gate::new()),
            exited: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            native: true,
        }
    }

    /// Create a suspended context that runs `entry` on its first resume
    pub fn spawn<F>(name: String, stack_size: usize, entry: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let gate = Arc::new(Gate::new());
        let exited = Arc::new(AtomicBool::new(false));

        let thread_gate = gate.clone();
        let thread_exited = exited.clone();
        let handle = thread::Builder::new()
            .name(name)
            .stack_size(stack_size)
            .spawn(move || {
                registry::register_worker_thread();
                if thread_gate.pass() == Resumed::Continue {
                    if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
                        tracing::error!("task context body escaped with a panic");
                    }
                }
                registry::unregister_worker_thread();
                thread_exited.store(true, Ordering::Release);
            })?;

        Ok(Self {
            gate,
            exited,
            thread: Mutex::new(Some(handle)),
            native: false,
        })
    }

    /// Hand the baton to `target`.
    ///
    /// Non-terminal switches block until some context hands the baton back.
    /// A terminal switch returns [`Resumed::Terminal`] immediately and the
    /// caller must not touch shared scheduler state afterwards.
    pub fn switch_to(&self, target: &Context, terminal: bool) -> Resumed {
        target.gate.open();
        if terminal {
            return Resumed::Terminal;
        }
        self.gate.pass()
    }

    /// Whether the context's entry has returned
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Discard a suspended context: its pending suspension returns
    /// [`Resumed::Discarded`] and the backing thread unwinds and exits.
    pub fn discard(&self) {
        self.gate.discard();
        // Detach: the thread is on its way out and may be the caller itself.
        drop(self.thread.lock().take());
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.native && !self.is_exited() {
            self.gate.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    const STACK: usize = 128 * 1024;

    fn wait_exited(ctx: &Context) {
        let start = Instant::now();
        while !ctx.is_exited() {
            assert!(start.elapsed() < Duration::from_secs(5), "context never exited");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_entry_runs_only_after_first_switch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let main = Arc::new(Context::for_current_thread());

        let c = counter.clone();
        let back = main.clone();
        let slot: Arc<Mutex<Option<Arc<Context>>>> = Arc::new(Mutex::new(None));
        let me = slot.clone();
        let ctx = Arc::new(
            Context::spawn("ctx-test".into(), STACK, move || {
                c.fetch_add(1, Ordering::SeqCst);
                let me = me.lock().clone().unwrap();
                me.switch_to(&back, true);
            })
            .unwrap(),
        );
        *slot.lock() = Some(ctx.clone());

        thread::sleep(Duration::from_millis(10));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert_eq!(main.switch_to(&ctx, false), Resumed::Continue);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        wait_exited(&ctx);
    }

    #[test]
    fn test_ping_pong_is_strictly_alternating() {
        let main = Arc::new(Context::for_current_thread());
        let trace = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<Arc<Context>>>> = Arc::new(Mutex::new(None));

        let (back, me, t) = (main.clone(), slot.clone(), trace.clone());
        let ctx = Arc::new(
            Context::spawn("ctx-pingpong".into(), STACK, move || {
                let me = me.lock().clone().unwrap();
                for i in 0..3 {
                    t.lock().push(format!("task-{}", i));
                    me.switch_to(&back, false);
                }
                me.switch_to(&back, true);
            })
            .unwrap(),
        );
        *slot.lock() = Some(ctx.clone());

        for i in 0..4 {
            trace.lock().push(format!("main-{}", i));
            main.switch_to(&ctx, false);
        }
        wait_exited(&ctx);

        let trace = trace.lock().clone();
        assert_eq!(
            trace,
            vec!["main-0", "task-0", "main-1", "task-1", "main-2", "task-2", "main-3"]
        );
    }

    #[test]
    fn test_discard_suspended_context() {
        let main = Arc::new(Context::for_current_thread());
        let slot: Arc<Mutex<Option<Arc<Context>>>> = Arc::new(Mutex::new(None));
        let outcome = Arc::new(Mutex::new(None));

        let (back, me, out) = (main.clone(), slot.clone(), outcome.clone());
        let ctx = Arc::new(
            Context::spawn("ctx-discard".into(), STACK, move || {
                let me = me.lock().clone().unwrap();
                let resumed = me.switch_to(&back, false);
                *out.lock() = Some(resumed);
            })
            .unwrap(),
        );
        *slot.lock() = Some(ctx.clone());

        main.switch_to(&ctx, false);
        ctx.discard();
        wait_exited(&ctx);
        assert_eq!(*outcome.lock(), Some(Resumed::Discarded));
    }

    #[test]
    fn test_discard_before_first_resume_skips_entry() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let ctx = Context::spawn("ctx-never".into(), STACK, move || {
            r.store(true, Ordering::SeqCst);
        })
        .unwrap();
        ctx.discard();
        wait_exited(&ctx);
        assert!(!ran.load(Ordering::SeqCst));
    }
}

//! Event-pump interface for I/O readiness
//!
//! The engine does not multiplex sockets itself. It talks to an
//! [`EventPump`] that records which task waits on which channel and reports
//! readiness when asked. Carriers poll the pump only while idle and only
//! when some task is actually waiting on I/O.

use crate::task::TaskId;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::ops::BitOr;
use std::time::Duration;

/// Opaque I/O channel identifier (a file descriptor, a socket token, ...)
pub type Channel = u64;

/// Readiness interest mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// No readiness
    pub const NONE: Interest = Interest(0);
    /// Channel can be read
    pub const READABLE: Interest = Interest(0b01);
    /// Channel can be written
    pub const WRITABLE: Interest = Interest(0b10);

    /// Raw bit mask
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Build from a raw bit mask, ignoring unknown bits
    pub fn from_bits(bits: u8) -> Self {
        Interest(bits & 0b11)
    }

    /// Whether READABLE is set
    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Whether WRITABLE is set
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Whether no bit is set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bits set in both masks
    pub fn intersect(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// One readiness report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Task that registered interest
    pub task: TaskId,
    /// Channel that became ready
    pub channel: Channel,
    /// What it became ready for
    pub ready: Interest,
}

/// External I/O readiness multiplexer
pub trait EventPump: Send + Sync {
    /// Record that `task` waits for `interest` on `channel`
    fn register_interest(&self, task: TaskId, channel: Channel, interest: Interest) -> io::Result<()>;

    /// Forget whatever `task` registered
    fn unregister_interest(&self, task: TaskId) -> io::Result<()>;

    /// Block up to `timeout` (forever on `None`) for readiness events
    fn wait_for_events(&self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>>;

    /// Interrupt a blocked `wait_for_events`
    fn wakeup(&self) {}
}

/// Pump for engines that never wait on I/O
#[derive(Debug, Default)]
pub struct NoopEventPump;

impl EventPump for NoopEventPump {
    fn register_interest(&self, _task: TaskId, _channel: Channel, _interest: Interest) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no event pump configured",
        ))
    }

    fn unregister_interest(&self, _task: TaskId) -> io::Result<()> {
        Ok(())
    }

    fn wait_for_events(&self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        if let Some(timeout) = timeout {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        Ok(Vec::new())
    }
}

/// In-memory pump driven by explicit [`ManualEventPump::signal`] calls.
///
/// Useful for simulations and tests, and as a reference for wiring a real
/// multiplexer: a signal is delivered to every task whose registered
/// interest overlaps it, and is dropped if nobody is interested.
#[derive(Debug, Default)]
pub struct ManualEventPump {
    registrations: DashMap<TaskId, (Channel, Interest)>,
    pending: Mutex<Vec<(Channel, Interest)>>,
    cvar: Condvar,
}

impl ManualEventPump {
    /// Create an empty pump
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `channel` ready for `ready`
    pub fn signal(&self, channel: Channel, ready: Interest) {
        self.pending.lock().push((channel, ready));
        self.cvar.notify_all();
    }

    /// Number of tasks with registered interest
    pub fn registered(&self) -> usize {
        self.registrations.len()
    }
}

impl EventPump for ManualEventPump {
    fn register_interest(&self, task: TaskId, channel: Channel, interest: Interest) -> io::Result<()> {
        self.registrations.insert(task, (channel, interest));
        Ok(())
    }

    fn unregister_interest(&self, task: TaskId) -> io::Result<()> {
        self.registrations.remove(&task);
        Ok(())
    }

    fn wait_for_events(&self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            match timeout {
                Some(timeout) => {
                    self.cvar.wait_for(&mut pending, timeout);
                }
                None => self.cvar.wait(&mut pending),
            }
        }
        let signals = std::mem::take(&mut *pending);
        drop(pending);

        let mut events = Vec::new();
        for (channel, ready) in signals {
            for entry in self.registrations.iter() {
                let (registered, interest) = *entry.value();
                let overlap = interest.intersect(ready);
                if registered == channel && !overlap.is_empty() {
                    events.push(Readiness {
                        task: *entry.key(),
                        channel,
                        ready: overlap,
                    });
                }
            }
        }
        Ok(events)
    }

    fn wakeup(&self) {
        self.cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_bits() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(Interest::NONE.is_empty());
        assert_eq!(both.intersect(Interest::WRITABLE), Interest::WRITABLE);
        assert_eq!(Interest::from_bits(0xff), both);
    }

    #[test]
    fn test_noop_pump_rejects_registration() {
        let pump = NoopEventPump;
        assert!(pump
            .register_interest(TaskId::from_u64(1), 3, Interest::READABLE)
            .is_err());
        assert!(pump
            .wait_for_events(Some(Duration::from_millis(5)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_manual_pump_matches_interest() {
        let pump = ManualEventPump::new();
        let reader = TaskId::from_u64(10);
        let writer = TaskId::from_u64(11);
        pump.register_interest(reader, 7, Interest::READABLE).unwrap();
        pump.register_interest(writer, 7, Interest::WRITABLE).unwrap();

        pump.signal(7, Interest::READABLE);
        let events = pump.wait_for_events(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(
            events,
            vec![Readiness {
                task: reader,
                channel: 7,
                ready: Interest::READABLE
            }]
        );
    }

    #[test]
    fn test_manual_pump_unregister() {
        let pump = ManualEventPump::new();
        let task = TaskId::from_u64(12);
        pump.register_interest(task, 1, Interest::READABLE).unwrap();
        assert_eq!(pump.registered(), 1);
        pump.unregister_interest(task).unwrap();
        assert_eq!(pump.registered(), 0);

        pump.signal(1, Interest::READABLE);
        assert!(pump.wait_for_events(Some(Duration::ZERO)).unwrap().is_empty());
    }

    #[test]
    fn test_manual_pump_times_out() {
        let pump = ManualEventPump::new();
        let start = std::time::Instant::now();
        assert!(pump
            .wait_for_events(Some(Duration::from_millis(10)))
            .unwrap()
            .is_empty());
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}

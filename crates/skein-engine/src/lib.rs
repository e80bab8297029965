//! Skein Task Engine
//!
//! A user-space M:N scheduler. Units of work run as tasks multiplexed over a
//! fixed set of carrier threads:
//! - Per-carrier run queues with push or pull (work-stealing) placement
//! - Reusable task contexts cached per carrier and globally
//! - Park/unpark on independent axes with timeouts
//! - Per-carrier timer heaps, or one high-precision timer thread
//! - CPU quota control groups
//! - Readiness waits through a pluggable event pump
//!
//! # Usage
//!
//! ```rust,ignore
//! use skein_engine::{Engine, SchedulerConfig};
//! use std::time::Duration;
//!
//! let engine = Engine::new(SchedulerConfig::default().with_workers(4))?;
//! let handle = engine.submit("worker", || {
//!     skein_engine::sleep(Duration::from_millis(5));
//!     42
//! })?;
//! assert_eq!(handle.join()?, 42);
//! engine.shutdown();
//! engine.await_termination(Duration::from_secs(1));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub(crate) mod carrier;
pub mod cgroup;
pub mod config;
mod context;
pub mod current;
pub mod error;
pub mod event;
pub mod park;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod timer;

pub use cgroup::{ControlGroup, DEFAULT_PERIOD};
pub use config::{SchedulerConfig, SchedulingPolicy};
pub use current::{
    critical_section, current_task_id, current_unparker, in_task, park, park_timeout, sleep,
    wait_io, yield_now, Unparker,
};
pub use error::{JoinError, SchedError, SchedResult};
pub use event::{Channel, EventPump, Interest, ManualEventPump, NoopEventPump, Readiness};
pub use park::{ParkAxis, ParkState, Parker};
pub use registry::{is_worker_thread, worker_thread_count, ThreadAsTaskPolicy, ThreadRule};
pub use scheduler::Engine;
pub use stats::SchedulerStats;
pub use task::{current_task, JoinHandle, Task, TaskId, TaskStatus};
pub use timer::{nano_time, TimerManager};

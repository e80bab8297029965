//! Engine configuration (skein.toml)
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::error::{SchedError, SchedResult};
use crate::registry::ThreadAsTaskPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Smallest accepted task context stack
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Upper bound on configured carriers
pub const MAX_WORKER_THREADS: usize = 1024;

/// Where submissions are placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingPolicy {
    /// Submit to the least-loaded of a few sampled carriers; no queue stealing
    Push,
    /// Submit to a global queue that idle carriers drain and steal around
    #[default]
    Pull,
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingPolicy::Push => write!(f, "push"),
            SchedulingPolicy::Pull => write!(f, "pull"),
        }
    }
}

impl FromStr for SchedulingPolicy {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(SchedulingPolicy::Push),
            "pull" => Ok(SchedulingPolicy::Pull),
            other => Err(SchedError::InvalidConfig(format!(
                "Unknown scheduling policy '{}', expected push or pull",
                other
            ))),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of carriers (0 = one per CPU)
    pub worker_threads: usize,

    /// Capacity of each carrier's task cache (0 disables it)
    pub carrier_cache_size: usize,

    /// Capacity of the engine-wide task cache (0 disables it)
    pub global_cache_size: usize,

    /// Backoff rounds spent on a steal-locked task before giving up
    pub steal_retry: usize,

    /// Carriers sampled per submission under the push policy
    pub push_retry: usize,

    /// Placement policy
    pub policy: SchedulingPolicy,

    /// Run deadlines on a dedicated timer thread instead of carrier heaps
    pub high_precision_timer: bool,

    /// Timed parks shorter than this yield instead of arming a timer
    pub min_park_nanos: u64,

    /// Stack size for each task context, in bytes
    pub stack_size: usize,

    /// Thread-as-task conversion policy
    pub thread_as_task: ThreadAsTaskPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            carrier_cache_size: 64,
            global_cache_size: 1024,
            steal_retry: 4,
            push_retry: 4,
            policy: SchedulingPolicy::Pull,
            high_precision_timer: false,
            min_park_nanos: 0,
            stack_size: 256 * 1024,
            thread_as_task: ThreadAsTaskPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> SchedResult<Self> {
        let content = std::fs::read_to_string(path).map_err(SchedError::ConfigRead)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration from TOML text
    pub fn from_toml_str(content: &str) -> SchedResult<Self> {
        let config: SchedulerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> SchedResult<String> {
        toml::to_string_pretty(self).map_err(|e| SchedError::InvalidConfig(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> SchedResult<()> {
        if self.worker_threads > MAX_WORKER_THREADS {
            return Err(SchedError::InvalidConfig(format!(
                "worker_threads must be at most {}, got {}",
                MAX_WORKER_THREADS, self.worker_threads
            )));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(SchedError::InvalidConfig(format!(
                "stack_size must be at least {} bytes, got {}",
                MIN_STACK_SIZE, self.stack_size
            )));
        }
        if self.steal_retry == 0 {
            return Err(SchedError::InvalidConfig(
                "steal_retry must be at least 1".to_string(),
            ));
        }
        if self.push_retry == 0 {
            return Err(SchedError::InvalidConfig(
                "push_retry must be at least 1".to_string(),
            ));
        }
        self.thread_as_task.validate()
    }

    /// Number of carriers to start
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_threads
        }
    }

    /// Set the number of carriers
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Set the placement policy
    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set both cache capacities
    pub fn with_cache_sizes(mut self, carrier: usize, global: usize) -> Self {
        self.carrier_cache_size = carrier;
        self.global_cache_size = global;
        self
    }

    /// Enable or disable the dedicated timer thread
    pub fn with_high_precision_timer(mut self, enabled: bool) -> Self {
        self.high_precision_timer = enabled;
        self
    }

    /// Set the minimum timed-park duration
    pub fn with_min_park_nanos(mut self, nanos: u64) -> Self {
        self.min_park_nanos = nanos;
        self
    }

    /// Set the task context stack size
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Set the thread-as-task policy
    pub fn with_thread_as_task(mut self, policy: ThreadAsTaskPolicy) -> Self {
        self.thread_as_task = policy;
        self
    }
}

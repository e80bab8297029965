//! Worker-thread registry and thread-as-task policy
//!
//! Scheduler-owned OS threads (carriers, task contexts, the precise timer)
//! register themselves here so the rest of the process can tell them apart
//! from user threads. The [`ThreadAsTaskPolicy`] decides whether a named
//! unit of blocking code should run as a task or on a dedicated OS thread.

use crate::error::{SchedError, SchedResult};
use glob::Pattern;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::thread::{self, ThreadId};

static WORKER_THREADS: Lazy<RwLock<FxHashSet<ThreadId>>> =
    Lazy::new(|| RwLock::new(FxHashSet::default()));

/// Mark the calling thread as scheduler-owned
pub(crate) fn register_worker_thread() {
    WORKER_THREADS.write().insert(thread::current().id());
}

/// Remove the calling thread from the registry
pub(crate) fn unregister_worker_thread() {
    WORKER_THREADS.write().remove(&thread::current().id());
}

/// Whether the calling thread is owned by some engine
pub fn is_worker_thread() -> bool {
    WORKER_THREADS.read().contains(&thread::current().id())
}

/// Number of registered scheduler-owned threads across all engines
pub fn worker_thread_count() -> usize {
    WORKER_THREADS.read().len()
}

/// One name-matching rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRule {
    /// Glob over the thread name (`*`, `?` and `[..]` classes)
    pub pattern: String,
    /// Run matching threads as tasks (`true`) or natively (`false`)
    pub as_task: bool,
}

impl ThreadRule {
    /// Rule running `pattern` matches as tasks
    pub fn task(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            as_task: true,
        }
    }

    /// Rule keeping `pattern` matches on native threads
    pub fn native(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            as_task: false,
        }
    }

    /// Number of literal (non-wildcard) characters
    fn specificity(&self) -> usize {
        self.pattern.chars().filter(|c| *c != '*').count()
    }

    /// Whether the rule's pattern matches `name`; invalid patterns never match
    fn matches(&self, name: &str) -> bool {
        Pattern::new(&self.pattern).map_or(false, |p| p.matches(name))
    }
}

/// Policy for converting named threads into tasks.
///
/// The most specific matching rule wins, measured by literal characters in
/// the pattern. Equally specific rules that disagree resolve to a native
/// thread. When no rule matches, `enabled` decides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadAsTaskPolicy {
    /// Fallback decision
    pub enabled: bool,
    /// Name-matching rules
    pub rules: Vec<ThreadRule>,
}

impl ThreadAsTaskPolicy {
    /// Whether a thread called `name` should run as a task
    pub fn decide(&self, name: &str) -> bool {
        let mut best: Option<(usize, bool)> = None;
        for rule in self.rules.iter().filter(|r| r.matches(name)) {
            let specificity = rule.specificity();
            best = match best {
                None => Some((specificity, rule.as_task)),
                Some((s, _)) if specificity > s => Some((specificity, rule.as_task)),
                Some((s, decision)) if specificity == s => Some((s, decision && rule.as_task)),
                keep => keep,
            };
        }
        best.map_or(self.enabled, |(_, decision)| decision)
    }

    /// Reject rules whose pattern is not a valid glob
    pub fn validate(&self) -> SchedResult<()> {
        for rule in &self.rules {
            Pattern::new(&rule.pattern).map_err(|e| {
                SchedError::InvalidConfig(format!(
                    "thread_as_task pattern {:?}: {}",
                    rule.pattern, e
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_matching() {
        assert!(ThreadRule::task("*").matches(""));
        assert!(ThreadRule::task("*").matches("anything"));
        assert!(ThreadRule::task("db-*").matches("db-pool-3"));
        assert!(ThreadRule::task("*-worker").matches("io-worker"));
        assert!(ThreadRule::task("a*b*c").matches("axxbyyc"));
        assert!(ThreadRule::task("io-?").matches("io-7"));
        assert!(ThreadRule::task("exact").matches("exact"));
        assert!(!ThreadRule::task("exact").matches("exactly"));
        assert!(!ThreadRule::task("db-*").matches("cache-1"));
        assert!(!ThreadRule::task("a*b").matches("ac"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let policy = ThreadAsTaskPolicy {
            enabled: true,
            rules: vec![ThreadRule::native("pool-[")],
        };
        assert!(matches!(policy.validate(), Err(SchedError::InvalidConfig(_))));
        // Never matches, so the fallback decides
        assert!(policy.decide("pool-["));

        let valid = ThreadAsTaskPolicy {
            enabled: false,
            rules: vec![ThreadRule::task("pool-[0-9]")],
        };
        assert!(valid.validate().is_ok());
        assert!(valid.decide("pool-4"));
    }

    #[test]
    fn test_no_match_falls_back_to_enabled() {
        let mut policy = ThreadAsTaskPolicy::default();
        assert!(!policy.decide("anything"));
        policy.enabled = true;
        assert!(policy.decide("anything"));
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let policy = ThreadAsTaskPolicy {
            enabled: false,
            rules: vec![ThreadRule::task("http-*"), ThreadRule::native("http-admin-*")],
        };
        assert!(policy.decide("http-1"));
        assert!(!policy.decide("http-admin-1"));
    }

    #[test]
    fn test_specific_rule_overrides_global_enable() {
        let policy = ThreadAsTaskPolicy {
            enabled: true,
            rules: vec![ThreadRule::native("blocking-*")],
        };
        assert!(!policy.decide("blocking-io"));
        assert!(policy.decide("compute"));
    }

    #[test]
    fn test_tie_resolves_to_native() {
        let policy = ThreadAsTaskPolicy {
            enabled: true,
            rules: vec![ThreadRule::task("job-*"), ThreadRule::native("*-job")],
        };
        // Both match with four literal characters each
        assert!(!policy.decide("job-job"));
        assert!(policy.decide("job-1"));
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: ThreadAsTaskPolicy = toml::from_str(
            r#"
enabled = true

[[rules]]
pattern = "legacy-*"
as_task = false
"#,
        )
        .unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.rules, vec![ThreadRule::native("legacy-*")]);
    }

    #[test]
    fn test_worker_registry() {
        std::thread::spawn(|| {
            assert!(!is_worker_thread());
            register_worker_thread();
            assert!(is_worker_thread());
            unregister_worker_thread();
            assert!(!is_worker_thread());
        })
        .join()
        .unwrap();
    }
}

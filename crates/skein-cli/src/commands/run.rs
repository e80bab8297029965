//! `skein run`: Drive a synthetic workload.
//!
//! Every task spins for a while, yields a few times and sleeps, so the run
//! exercises placement, stealing, the timers and (optionally) a quota group.

use super::config::load;
use anyhow::Context;
use skein_engine::{
    sleep, yield_now, ControlGroup, Engine, JoinError, SchedulerConfig, SchedulerStats,
    SchedulingPolicy,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Options for [`execute`]
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub workers: Option<usize>,
    pub policy: Option<SchedulingPolicy>,
    pub precise: bool,
    pub tasks: usize,
    pub sleep_ms: u64,
    pub spin_us: u64,
    pub yields: usize,
    pub quota_percent: Option<f64>,
}

/// Outcome counts of one workload run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub completed: usize,
    pub cancelled: usize,
    pub panicked: usize,
}

pub fn execute(options: RunOptions) -> anyhow::Result<()> {
    let config = build_config(&options)?;
    let engine = Engine::new(config).context("failed to start engine")?;
    tracing::info!(workers = engine.worker_count(), tasks = options.tasks, "starting workload");

    let start = Instant::now();
    let report = run_workload(&engine, &options)?;
    let elapsed = start.elapsed();

    engine.shutdown();
    if !engine.await_termination(Duration::from_secs(30)) {
        anyhow::bail!("engine did not terminate within 30s");
    }

    print_report(&report, &engine.stats(), elapsed);
    Ok(())
}

fn build_config(options: &RunOptions) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &options.config {
        Some(path) => load(path)?,
        None => SchedulerConfig::default(),
    };
    if let Some(workers) = options.workers {
        config = config.with_workers(workers);
    }
    if let Some(policy) = options.policy {
        config = config.with_policy(policy);
    }
    if options.precise {
        config = config.with_high_precision_timer(true);
    }
    config.validate()?;
    Ok(config)
}

/// Submit the workload and wait for every task
pub fn run_workload(engine: &Engine, options: &RunOptions) -> anyhow::Result<RunReport> {
    let group = options
        .quota_percent
        .map(ControlGroup::with_cpu_percent)
        .transpose()
        .context("invalid quota")?;

    let spin = Duration::from_micros(options.spin_us);
    let nap = Duration::from_millis(options.sleep_ms);
    let yields = options.yields;

    let mut handles = Vec::with_capacity(options.tasks);
    for i in 0..options.tasks {
        let name = format!("load-{}", i);
        let work = move || {
            for _ in 0..yields {
                busy(spin);
                yield_now();
            }
            busy(spin);
            if !nap.is_zero() {
                sleep(nap);
            }
        };
        let handle = match &group {
            Some(group) => engine.submit_in(group, name, work)?,
            None => engine.submit(name, work)?,
        };
        handles.push(handle);
    }

    let mut report = RunReport::default();
    for handle in handles {
        match handle.join() {
            Ok(()) => report.completed += 1,
            Err(JoinError::Cancelled) => report.cancelled += 1,
            Err(JoinError::Panicked(msg)) => {
                tracing::warn!(message = %msg, "task panicked");
                report.panicked += 1;
            }
        }
    }
    if let Some(group) = &group {
        tracing::info!(
            consumed_ms = group.consumed().as_millis() as u64,
            throttles = group.throttle_count(),
            "quota group finished"
        );
    }
    Ok(report)
}

fn busy(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

fn print_report(report: &RunReport, stats: &SchedulerStats, elapsed: Duration) {
    println!("Finished in {:.2?}", elapsed);
    println!(
        "  tasks:    {} completed, {} cancelled, {} panicked",
        report.completed, report.cancelled, report.panicked
    );
    println!(
        "  contexts: {} created, {} reused ({} local, {} global, {} stolen), {} discarded",
        stats.contexts_created,
        stats.cache_hits(),
        stats.local_cache_hits,
        stats.global_cache_hits,
        stats.stolen_cache_hits,
        stats.cache_discards
    );
    println!(
        "  steals:   {} ok, {} failed, {} switch retries",
        stats.steal_successes, stats.steal_failures, stats.switch_failures
    );
    println!(
        "  timers:   {} armed, {} fired, {} cancelled",
        stats.timers_armed, stats.timers_fired, stats.timers_cancelled
    );
    println!(
        "  quota:    {} throttles, {:.2?} free-running",
        stats.quota_throttles,
        Duration::from_nanos(stats.free_running_nanos)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(tasks: usize) -> RunOptions {
        RunOptions {
            config: None,
            workers: Some(2),
            policy: None,
            precise: false,
            tasks,
            sleep_ms: 1,
            spin_us: 10,
            yields: 2,
            quota_percent: None,
        }
    }

    #[test]
    fn test_build_config_overrides() {
        let mut opts = options(1);
        opts.policy = Some(SchedulingPolicy::Push);
        opts.precise = true;
        let config = build_config(&opts).unwrap();
        assert_eq!(config.effective_workers(), 2);
        assert_eq!(config.policy, SchedulingPolicy::Push);
        assert!(config.high_precision_timer);
    }

    #[test]
    fn test_workload_completes() {
        let opts = options(50);
        let engine = Engine::new(build_config(&opts).unwrap()).unwrap();
        let report = run_workload(&engine, &opts).unwrap();
        assert_eq!(report.completed, 50);
        assert_eq!(engine.stats().tasks_submitted, 50);
    }

    #[test]
    fn test_workload_under_quota() {
        let mut opts = options(20);
        opts.quota_percent = Some(80.0);
        let engine = Engine::new(build_config(&opts).unwrap()).unwrap();
        let report = run_workload(&engine, &opts).unwrap();
        assert_eq!(report.completed, 20);
    }

    #[test]
    fn test_invalid_quota_rejected() {
        let mut opts = options(1);
        opts.quota_percent = Some(0.0);
        let engine = Engine::new(build_config(&opts).unwrap()).unwrap();
        assert!(run_workload(&engine, &opts).is_err());
    }
}

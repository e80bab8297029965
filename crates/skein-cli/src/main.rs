//! Skein command-line driver
//!
//! Runs synthetic workloads on the task engine and inspects engine
//! configuration files. Log output is controlled by `SKEIN_LOG` or
//! `RUST_LOG` (e.g. `SKEIN_LOG=skein_engine=debug`).

mod commands;

use clap::{Parser, Subcommand};
use skein_engine::SchedulingPolicy;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skein")]
#[command(about = "M:N task engine driver", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic workload and print engine statistics
    Run {
        /// Engine configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of carriers (overrides the config file)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Placement policy (overrides the config file)
        #[arg(short, long)]
        policy: Option<SchedulingPolicy>,
        /// Use the dedicated timer thread
        #[arg(long)]
        precise: bool,
        /// Number of tasks to submit
        #[arg(short, long, default_value_t = 1000)]
        tasks: usize,
        /// Sleep per task, in milliseconds
        #[arg(long, default_value_t = 1)]
        sleep_ms: u64,
        /// Busy work per task, in microseconds
        #[arg(long, default_value_t = 100)]
        spin_us: u64,
        /// Yields per task
        #[arg(long, default_value_t = 4)]
        yields: usize,
        /// Run every task in one control group limited to this CPU percentage
        #[arg(long)]
        quota_percent: Option<f64>,
    },

    /// Inspect engine configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the default configuration as TOML
    Show,
    /// Validate a configuration file and print the effective settings
    Check {
        /// Configuration file
        file: PathBuf,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("SKEIN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            workers,
            policy,
            precise,
            tasks,
            sleep_ms,
            spin_us,
            yields,
            quota_percent,
        } => commands::run::execute(commands::run::RunOptions {
            config,
            workers,
            policy,
            precise,
            tasks,
            sleep_ms,
            spin_us,
            yields,
            quota_percent,
        }),

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config::show(),
            ConfigAction::Check { file } => commands::config::check(&file),
        },
    }
}

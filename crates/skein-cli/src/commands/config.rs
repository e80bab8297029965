//! `skein config`: Show and validate engine configuration.

use anyhow::Context;
use skein_engine::SchedulerConfig;
use std::path::Path;

/// Print the default configuration
pub fn show() -> anyhow::Result<()> {
    print!("{}", SchedulerConfig::default().to_toml_string()?);
    Ok(())
}

/// Load `file`, validate it and print the effective settings
pub fn check(file: &Path) -> anyhow::Result<()> {
    let config = load(file)?;
    println!("{}: ok", file.display());
    println!("  carriers:     {}", config.effective_workers());
    println!("  policy:       {}", config.policy);
    println!("  precise:      {}", config.high_precision_timer);
    println!("  stack size:   {} KiB", config.stack_size / 1024);
    println!(
        "  caches:       {} per carrier, {} global",
        config.carrier_cache_size, config.global_cache_size
    );
    Ok(())
}

/// Load and validate a configuration file
pub fn load(file: &Path) -> anyhow::Result<SchedulerConfig> {
    SchedulerConfig::from_file(file).with_context(|| format!("invalid config {}", file.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_threads = 3\npolicy = \"push\"").unwrap();
        let config = load(file.path()).unwrap();
        assert_eq!(config.effective_workers(), 3);
        assert!(check(file.path()).is_ok());
    }

    #[test]
    fn test_load_rejects_bad_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "stack_size = 1").unwrap();
        let err = load(file.path()).unwrap_err();
        assert!(err.to_string().contains("invalid config"));
    }
}

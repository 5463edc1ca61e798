//! CLI argument parsing and command dispatch

mod master;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use loadhive_core::RunConfig;

pub use master::run_master;

#[derive(Parser)]
#[command(name = "loadhive")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a headless master and coordinate connecting workers
    Master(MasterArgs),
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct MasterArgs {
    /// Address workers connect to
    #[arg(long, default_value = "0.0.0.0:5557", env = "LOADHIVE_BIND")]
    pub bind: String,

    /// Workers to wait for before starting
    #[arg(long, default_value_t = 1)]
    pub expect_workers: usize,

    /// Seconds to wait for the expected workers
    #[arg(long, default_value_t = 60)]
    pub worker_timeout: u64,

    /// Total users across all workers
    #[arg(short, long)]
    pub users: usize,

    /// Users spawned per second across all workers
    #[arg(short = 'r', long, default_value_t = 1.0)]
    pub spawn_rate: f64,

    /// Stop after this many seconds
    #[arg(short = 't', long)]
    pub run_time: Option<u64>,

    /// Quit once the fail ratio exceeds this value
    #[arg(long)]
    pub fail_ratio: Option<f64>,

    /// Path to a TOML run configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Write CSV stats to files with this prefix
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Write the final report as JSON to this path
    #[arg(long)]
    pub json: Option<PathBuf>,
}

impl MasterArgs {
    /// Config file (or defaults) with command-line overrides applied
    pub fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => RunConfig::default(),
        };
        if let Some(secs) = self.run_time {
            config = config.with_run_time(std::time::Duration::from_secs(secs));
        }
        if let Some(ratio) = self.fail_ratio {
            config = config.with_fail_ratio_threshold(ratio);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Load and validate a config file, then print the effective values
pub fn validate(path: &Path) -> Result<()> {
    let config =
        RunConfig::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    tracing::info!(path = %path.display(), "Configuration is valid");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_args_parse() {
        let cli = Cli::parse_from([
            "loadhive",
            "master",
            "--bind",
            "127.0.0.1:6000",
            "--expect-workers",
            "4",
            "--users",
            "100",
            "--spawn-rate",
            "10",
            "--run-time",
            "60",
            "--fail-ratio",
            "0.05",
        ]);
        let Commands::Master(args) = cli.command else {
            panic!("expected master command");
        };
        assert_eq!(args.bind, "127.0.0.1:6000");
        assert_eq!(args.expect_workers, 4);
        assert_eq!(args.users, 100);

        let config = args.run_config().unwrap();
        assert_eq!(config.run_time(), Some(std::time::Duration::from_secs(60)));
        assert_eq!(config.fail_ratio_threshold, Some(0.05));
    }

    #[test]
    fn test_invalid_fail_ratio_rejected() {
        let cli = Cli::parse_from(["loadhive", "master", "-u", "5", "--fail-ratio", "2.0"]);
        let Commands::Master(args) = cli.command else {
            panic!("expected master command");
        };
        assert!(args.run_config().is_err());
    }
}

//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Volume priority accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
}

/// iodriver - concurrent, QoS-measured workloads against a storage endpoint
///
/// Runs every workload of a TOML run file in order, or a single QoS fairness
/// workload built from the quick-run flags when no file is given.
#[derive(Parser, Debug)]
#[command(name = "iodriver")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML run file with [run], [endpoint] and [[workloads]] tables
    #[arg(short = 'c', long, value_name = "FILE", env = "IODRIVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Validate the configuration and print the plan without running it
    #[arg(long)]
    pub dry_run: bool,

    /// Write the run summaries to this JSON file
    #[arg(long, value_name = "FILE")]
    pub json: Option<PathBuf>,

    /// Print a progress line at this interval (e.g., 1s, 500ms)
    #[arg(long, value_name = "DUR")]
    pub report_interval: Option<String>,

    /// How long a lane waits for the others before giving up (e.g., 30s)
    #[arg(long, value_name = "DUR")]
    pub barrier_timeout: Option<String>,

    /// Skip the validators workloads suggest
    #[arg(long)]
    pub no_validate: bool,

    /// Keep running later workloads after one fails
    #[arg(long)]
    pub keep_going: bool,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long)]
    pub debug: bool,

    // === Quick-run Options ===
    /// Number of volumes, each with one bucket and one lane
    #[arg(long)]
    pub buckets: Option<usize>,

    /// Assured IOPS of every volume
    #[arg(long)]
    pub assured_iops: Option<u64>,

    /// Throttle IOPS of every volume (0 = unlimited)
    #[arg(long)]
    pub throttle_iops: Option<u64>,

    /// Volume priority
    #[arg(long, value_enum)]
    pub priority: Option<PriorityArg>,

    /// Measurement window of each lane (e.g., 30s, 5m)
    #[arg(short = 'd', long)]
    pub duration: Option<String>,

    /// Size of every put (e.g., 4k, 1M)
    #[arg(short = 's', long)]
    pub object_size: Option<String>,

    /// Put rate each lane offers (defaults to the throttle)
    #[arg(long)]
    pub offered_iops: Option<u64>,

    /// Simulated latency of every object operation (e.g., 200us)
    #[arg(long, value_name = "DUR")]
    pub latency: Option<String>,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// True when any quick-run flag was given
    pub fn has_quick_run_options(&self) -> bool {
        self.buckets.is_some()
            || self.assured_iops.is_some()
            || self.throttle_iops.is_some()
            || self.priority.is_some()
            || self.duration.is_some()
            || self.object_size.is_some()
            || self.offered_iops.is_some()
    }

    /// Validate CLI arguments that do not depend on the run file
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buckets == Some(0) {
            anyhow::bail!("--buckets must be at least 1");
        }
        if self.offered_iops == Some(0) {
            anyhow::bail!("--offered-iops must be positive");
        }
        if let (Some(assured), Some(throttle)) = (self.assured_iops, self.throttle_iops) {
            if throttle != 0 && throttle < assured {
                anyhow::bail!(
                    "--throttle-iops ({}) must be 0 or at least --assured-iops ({})",
                    throttle,
                    assured
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_run_flags() {
        let cli = Cli::try_parse_from([
            "iodriver",
            "--buckets",
            "4",
            "--assured-iops",
            "100",
            "--throttle-iops",
            "200",
            "--duration",
            "10s",
            "--priority",
            "high",
        ])
        .unwrap();

        assert_eq!(cli.buckets, Some(4));
        assert_eq!(cli.priority, Some(PriorityArg::High));
        assert!(cli.has_quick_run_options());
        cli.validate().unwrap();
    }

    #[test]
    fn test_run_file_flags() {
        let cli = Cli::try_parse_from([
            "iodriver",
            "--config",
            "run.toml",
            "--dry-run",
            "--json",
            "out.json",
            "--report-interval",
            "1s",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("run.toml")));
        assert!(cli.dry_run);
        assert!(!cli.has_quick_run_options());
    }

    #[test]
    fn test_validate_rejects_inverted_qos() {
        let cli = Cli::try_parse_from(["iodriver", "--assured-iops", "500", "--throttle-iops", "100"]).unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["iodriver", "--buckets", "0"]).unwrap();
        assert!(cli.validate().is_err());
    }
}

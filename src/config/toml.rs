//! TOML run file parsing and CLI merging

use super::*;
use crate::config::cli::Cli;
use crate::config::cli_convert::{convert_priority, parse_duration, parse_size};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML run file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML run configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Render a configuration back to TOML (dry runs print this)
pub fn to_toml_string(config: &Config) -> Result<String> {
    ::toml::to_string_pretty(config).context("Failed to render TOML configuration")
}

/// Build the configuration for this invocation
///
/// Reads the run file when one is given, otherwise starts from a single
/// default QoS fairness workload. CLI values are merged on top either way.
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => Config {
            workloads: vec![WorkloadConfig::QosFairness(QosFairnessConfig::default())],
            ..Config::default()
        },
    };
    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with the run file (CLI takes precedence)
///
/// Quick-run flags apply to every `qos_fairness` workload.
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    if let Some(interval) = &cli.report_interval {
        let interval = parse_duration(interval).context("Invalid --report-interval")?;
        config.run.report_interval = Some(HumanDuration(interval));
    }
    if let Some(timeout) = &cli.barrier_timeout {
        let timeout = parse_duration(timeout).context("Invalid --barrier-timeout")?;
        config.run.barrier_timeout = HumanDuration(timeout);
    }
    if cli.no_validate {
        config.run.validate = false;
    }
    if cli.keep_going {
        config.run.keep_going = true;
    }
    if let Some(path) = &cli.json {
        config.run.json_output = Some(path.clone());
    }
    if let Some(latency) = &cli.latency {
        let latency = parse_duration(latency).context("Invalid --latency")?;
        config.endpoint.latency = Some(HumanDuration(latency));
    }

    let duration = cli
        .duration
        .as_deref()
        .map(parse_duration)
        .transpose()
        .context("Invalid --duration")?;
    let object_size = cli
        .object_size
        .as_deref()
        .map(parse_size)
        .transpose()
        .context("Invalid --object-size")?;

    for workload in &mut config.workloads {
        if let WorkloadConfig::QosFairness(qos) = workload {
            if let Some(buckets) = cli.buckets {
                qos.volumes = buckets;
            }
            if let Some(assured) = cli.assured_iops {
                qos.assured_iops = assured;
            }
            if let Some(throttle) = cli.throttle_iops {
                qos.throttle_iops = throttle;
            }
            if let Some(priority) = cli.priority {
                qos.priority = convert_priority(priority);
            }
            if let Some(duration) = duration {
                qos.duration = HumanDuration(duration);
            }
            if let Some(size) = object_size {
                qos.object_size = ByteSize(size);
            }
            if let Some(rate) = cli.offered_iops {
                qos.offered_iops = Some(rate);
            }
        }
    }

    Ok(config)
}

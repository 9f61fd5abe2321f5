//! Configuration validation
//!
//! Runs before any workload is constructed so a bad run file fails with the
//! offending entry named, instead of halfway through a run.

use super::*;
use anyhow::{Context, Result};
use std::time::Duration;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_run(&config.run)?;
    validate_endpoint(&config.endpoint)?;

    if config.workloads.is_empty() {
        anyhow::bail!("At least one workload must be specified");
    }
    for (i, workload) in config.workloads.iter().enumerate() {
        validate_workload(workload).with_context(|| format!("Workload {} ({})", i, workload.kind()))?;
    }

    Ok(())
}

/// Validate run settings
pub fn validate_run(run: &RunConfig) -> Result<()> {
    if run.barrier_timeout.duration().is_zero() {
        anyhow::bail!("barrier_timeout must be greater than 0");
    }
    if let Some(interval) = run.report_interval {
        if interval.duration() < Duration::from_millis(10) {
            anyhow::bail!("report_interval must be at least 10ms, got {}", interval);
        }
    }
    Ok(())
}

/// Validate endpoint settings
pub fn validate_endpoint(endpoint: &EndpointConfig) -> Result<()> {
    if endpoint.name.trim().is_empty() {
        anyhow::bail!("endpoint name must not be empty");
    }
    if let Some(latency) = endpoint.latency {
        if latency.duration() > Duration::from_secs(10) {
            anyhow::bail!("endpoint latency must be at most 10s, got {}", latency);
        }
    }
    Ok(())
}

/// Validate one workload entry
pub fn validate_workload(workload: &WorkloadConfig) -> Result<()> {
    match workload {
        WorkloadConfig::QosFairness(qos) => validate_qos_fairness(qos),
        WorkloadConfig::Churn(churn) => validate_churn(churn),
    }
}

fn validate_qos_fairness(qos: &QosFairnessConfig) -> Result<()> {
    validate_prefix(&qos.prefix)?;
    if qos.volumes == 0 {
        anyhow::bail!("volumes must be at least 1");
    }
    if qos.throttle_iops != 0 && qos.throttle_iops < qos.assured_iops {
        anyhow::bail!(
            "throttle_iops ({}) must be 0 or at least assured_iops ({})",
            qos.throttle_iops,
            qos.assured_iops
        );
    }
    if qos.duration.duration().is_zero() {
        anyhow::bail!("duration must be greater than 0");
    }
    if qos.object_size.bytes() == 0 {
        anyhow::bail!("object_size must be greater than 0");
    }
    if qos.offered_iops == Some(0) {
        anyhow::bail!("offered_iops must be greater than 0 if specified");
    }
    if !(0.0..1.0).contains(&qos.tolerance) {
        anyhow::bail!("tolerance must be in [0, 1), got {}", qos.tolerance);
    }

    if qos.volumes > 256 {
        tracing::warn!(volumes = qos.volumes, "very high volume count, one thread per volume");
    }
    if qos.throttle_iops > 0 && qos.offered_rate() < qos.assured_iops {
        tracing::warn!(
            offered = qos.offered_rate(),
            assured = qos.assured_iops,
            "offered rate is below the assured rate, validation will fail"
        );
    }
    Ok(())
}

fn validate_churn(churn: &ChurnConfig) -> Result<()> {
    validate_prefix(&churn.prefix)?;
    if churn.lanes == 0 {
        anyhow::bail!("lanes must be at least 1");
    }
    if churn.objects_per_lane == 0 {
        anyhow::bail!("objects_per_lane must be at least 1");
    }
    if churn.p50_size.bytes() == 0 {
        anyhow::bail!("p50_size must be greater than 0");
    }
    if churn.p99_size.bytes() < churn.p50_size.bytes() {
        anyhow::bail!(
            "p99_size ({}) must be at least p50_size ({})",
            churn.p99_size,
            churn.p50_size
        );
    }
    Ok(())
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        anyhow::bail!("prefix must not be empty");
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!("prefix '{}' may only contain letters, digits, '-' and '_'", prefix);
    }
    Ok(())
}

//! Configuration module
//!
//! Handles CLI argument parsing, TOML run files, and validation. A run file
//! looks like:
//!
//! ```toml
//! [run]
//! report_interval = "1s"
//! barrier_timeout = "30s"
//!
//! [endpoint]
//! latency = "200us"
//!
//! [[workloads]]
//! kind = "qos_fairness"
//! volumes = 4
//! assured_iops = 100
//! throttle_iops = 200
//! duration = "10s"
//!
//! [[workloads]]
//! kind = "churn"
//! lanes = 8
//! p50_size = "16k"
//! p99_size = "1M"
//! ```

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use crate::endpoint::memory::MemoryEndpoint;
use crate::volume::{Priority, QosSettings};
use crate::workload::churn::{ObjectChurnParams, ObjectChurnWorkload};
use crate::workload::qos::{QosFairnessParams, QosFairnessWorkload};
use crate::workload::Workload;
use anyhow::Context;
use cli_convert::{ByteSize, HumanDuration};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Complete run configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub workloads: Vec<WorkloadConfig>,
}

/// Settings shared by every workload of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Progress line interval; no progress lines when unset
    #[serde(default)]
    pub report_interval: Option<HumanDuration>,
    /// Rendezvous timeout of every workload's lanes
    #[serde(default = "default_barrier_timeout")]
    pub barrier_timeout: HumanDuration,
    /// Run the validators workloads suggest
    #[serde(default = "default_true")]
    pub validate: bool,
    /// Keep running later workloads after one fails
    #[serde(default)]
    pub keep_going: bool,
    /// JSON summary file
    #[serde(default)]
    pub json_output: Option<PathBuf>,
}

fn default_barrier_timeout() -> HumanDuration {
    HumanDuration::secs(60)
}

fn default_true() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            report_interval: None,
            barrier_timeout: default_barrier_timeout(),
            validate: true,
            keep_going: false,
            json_output: None,
        }
    }
}

/// In-memory endpoint the workloads run against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_endpoint_name")]
    pub name: String,
    /// Simulated latency of every object operation
    #[serde(default)]
    pub latency: Option<HumanDuration>,
    /// Hold each volume to its throttle rate
    #[serde(default = "default_true")]
    pub enforce_throttle: bool,
}

fn default_endpoint_name() -> String {
    "memory".to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: default_endpoint_name(),
            latency: None,
            enforce_throttle: true,
        }
    }
}

impl EndpointConfig {
    pub fn build(&self) -> MemoryEndpoint {
        let endpoint = MemoryEndpoint::new()
            .named(&self.name)
            .enforcing_throttle(self.enforce_throttle);
        if let Some(latency) = self.latency {
            endpoint.set_latency(latency.duration());
        }
        endpoint
    }
}

/// One workload of the run, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadConfig {
    QosFairness(QosFairnessConfig),
    Churn(ChurnConfig),
}

impl WorkloadConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkloadConfig::QosFairness(_) => "qos_fairness",
            WorkloadConfig::Churn(_) => "churn",
        }
    }

    /// Construct the workload this entry describes
    pub fn build(&self, barrier_timeout: std::time::Duration) -> anyhow::Result<Workload> {
        let workload = match self {
            WorkloadConfig::QosFairness(config) => Workload::new(
                QosFairnessWorkload::new(config.params()?).context("Invalid qos_fairness workload")?,
            ),
            WorkloadConfig::Churn(config) => Workload::new(
                ObjectChurnWorkload::new(config.params()).context("Invalid churn workload")?,
            ),
        };
        Ok(workload.with_barrier_timeout(barrier_timeout))
    }
}

impl fmt::Display for WorkloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadConfig::QosFairness(c) => write!(
                f,
                "qos_fairness '{}': {} volume(s), assured {} / throttle {} IOPS ({}), {} puts/s of {} for {}",
                c.prefix,
                c.volumes,
                c.assured_iops,
                c.throttle_iops,
                c.priority,
                c.offered_rate(),
                c.object_size,
                c.duration
            ),
            WorkloadConfig::Churn(c) => write!(
                f,
                "churn '{}': {} lane(s) x {} object(s), p50 {} / p99 {}{}",
                c.prefix,
                c.lanes,
                c.objects_per_lane,
                c.p50_size,
                c.p99_size,
                c.seed.map(|seed| format!(", seed {}", seed)).unwrap_or_default()
            ),
        }
    }
}

/// Per-volume put load measured against QoS settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosFairnessConfig {
    #[serde(default = "default_qos_prefix")]
    pub prefix: String,
    #[serde(default = "default_volumes")]
    pub volumes: usize,
    #[serde(default = "default_assured_iops")]
    pub assured_iops: u64,
    #[serde(default = "default_throttle_iops")]
    pub throttle_iops: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_duration")]
    pub duration: HumanDuration,
    #[serde(default = "default_object_size")]
    pub object_size: ByteSize,
    #[serde(default)]
    pub offered_iops: Option<u64>,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_qos_prefix() -> String {
    "qos".to_string()
}

fn default_volumes() -> usize {
    2
}

fn default_assured_iops() -> u64 {
    100
}

fn default_throttle_iops() -> u64 {
    200
}

fn default_duration() -> HumanDuration {
    HumanDuration::secs(5)
}

fn default_object_size() -> ByteSize {
    ByteSize::kib(4)
}

fn default_tolerance() -> f64 {
    crate::validator::QosValidator::DEFAULT_TOLERANCE
}

impl Default for QosFairnessConfig {
    fn default() -> Self {
        Self {
            prefix: default_qos_prefix(),
            volumes: default_volumes(),
            assured_iops: default_assured_iops(),
            throttle_iops: default_throttle_iops(),
            priority: Priority::default(),
            duration: default_duration(),
            object_size: default_object_size(),
            offered_iops: None,
            tolerance: default_tolerance(),
        }
    }
}

impl QosFairnessConfig {
    /// Put rate each lane offers once defaults are applied
    pub fn offered_rate(&self) -> u64 {
        match self.offered_iops {
            Some(rate) => rate,
            None if self.throttle_iops > 0 => self.throttle_iops,
            None if self.assured_iops > 0 => self.assured_iops,
            None => 1000,
        }
    }

    pub fn params(&self) -> anyhow::Result<QosFairnessParams> {
        let qos = QosSettings::new(self.assured_iops, self.throttle_iops, self.priority)
            .context("Invalid QoS settings")?;
        Ok(QosFairnessParams {
            prefix: self.prefix.clone(),
            volumes: self.volumes,
            qos,
            duration: self.duration.duration(),
            object_size: self.object_size.bytes(),
            offered_iops: self.offered_iops,
            tolerance: self.tolerance,
        })
    }
}

/// Write, read back and delete objects of log-normal sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnConfig {
    #[serde(default = "default_churn_prefix")]
    pub prefix: String,
    #[serde(default = "default_lanes")]
    pub lanes: usize,
    #[serde(default = "default_objects_per_lane")]
    pub objects_per_lane: usize,
    #[serde(default = "default_p50_size")]
    pub p50_size: ByteSize,
    #[serde(default = "default_p99_size")]
    pub p99_size: ByteSize,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_churn_prefix() -> String {
    "objects".to_string()
}

fn default_lanes() -> usize {
    4
}

fn default_objects_per_lane() -> usize {
    100
}

fn default_p50_size() -> ByteSize {
    ByteSize::kib(16)
}

fn default_p99_size() -> ByteSize {
    ByteSize::kib(1024)
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            prefix: default_churn_prefix(),
            lanes: default_lanes(),
            objects_per_lane: default_objects_per_lane(),
            p50_size: default_p50_size(),
            p99_size: default_p99_size(),
            seed: None,
        }
    }
}

impl ChurnConfig {
    pub fn params(&self) -> ObjectChurnParams {
        ObjectChurnParams {
            prefix: self.prefix.clone(),
            lanes: self.lanes,
            objects_per_lane: self.objects_per_lane,
            p50_size: self.p50_size.bytes(),
            p99_size: self.p99_size.bytes(),
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_workload_build() {
        let qos = WorkloadConfig::QosFairness(QosFairnessConfig {
            volumes: 3,
            ..QosFairnessConfig::default()
        });
        let workload = qos.build(Duration::from_secs(7)).unwrap();
        assert_eq!(workload.name(), "qos-fairness");
        assert_eq!(workload.barrier_timeout(), Duration::from_secs(7));
        assert_eq!(workload.ensure_initialized().unwrap().lanes.len(), 3);

        let churn = WorkloadConfig::Churn(ChurnConfig {
            seed: Some(1),
            ..ChurnConfig::default()
        });
        assert_eq!(churn.build(Duration::from_secs(1)).unwrap().name(), "objects-churn");
    }

    #[test]
    fn test_invalid_workload_does_not_build() {
        let inverted = WorkloadConfig::QosFairness(QosFairnessConfig {
            assured_iops: 300,
            throttle_iops: 100,
            ..QosFairnessConfig::default()
        });
        assert!(inverted.build(Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_display() {
        let config = WorkloadConfig::QosFairness(QosFairnessConfig::default());
        assert_eq!(
            config.to_string(),
            "qos_fairness 'qos': 2 volume(s), assured 100 / throttle 200 IOPS (normal), 200 puts/s of 4k for 5s"
        );
    }

    #[test]
    fn test_endpoint_build() {
        let endpoint = EndpointConfig {
            name: "lab".to_string(),
            ..EndpointConfig::default()
        }
        .build();
        let endpoint: &dyn crate::endpoint::Endpoint = &endpoint;
        assert_eq!(endpoint.name(), "lab");
    }
}

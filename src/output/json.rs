//! JSON run summary
//!
//! Mirrors the text summary in a machine-readable form. Durations carry both
//! microseconds and a human-readable rendering.

use crate::context::qos::{MeasurementWindow, VolumeStats};
use crate::driver::RunSummary;
use crate::stats::histogram::LatencySummary;
use crate::util::time::{calculate_iops, calculate_throughput, format_duration, format_throughput};
use crate::validator::Violation;
use crate::volume::QosSettings;
use crate::Result;
use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

/// Duration with both microseconds and human-readable format
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonDuration {
    pub micros: u64,
    pub human: String,
}

impl JsonDuration {
    pub fn from_duration(d: Duration) -> Self {
        Self {
            micros: u64::try_from(d.as_micros()).unwrap_or(u64::MAX),
            human: format_duration(d),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonPhase {
    pub phase: String,
    pub elapsed: JsonDuration,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonVolume {
    pub qos: QosSettings,
    /// `not_started`, `open` or `closed`
    pub window: &'static str,
    pub measured: JsonDuration,
    pub io_cost: u64,
    pub operations: u64,
    pub observed_iops: f64,
    pub latency: LatencySummary,
}

impl JsonVolume {
    fn from_stats(stats: &VolumeStats) -> Self {
        let performance = &stats.performance;
        Self {
            qos: stats.settings,
            window: match performance.window() {
                MeasurementWindow::NotStarted => "not_started",
                MeasurementWindow::Open { .. } => "open",
                MeasurementWindow::Closed { .. } => "closed",
            },
            measured: JsonDuration::from_duration(performance.elapsed()),
            io_cost: performance.io_cost(),
            operations: performance.operations(),
            observed_iops: performance.observed_iops(),
            latency: performance.latency().summary(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonValidation {
    pub validator: String,
    pub passed: bool,
    pub violations: Vec<Violation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Top-level JSON document for one run
#[derive(Debug, Clone, Serialize)]
pub struct JsonRunSummary {
    pub workload: String,
    pub endpoint: String,
    /// RFC 3339 start time
    pub started_at: String,
    pub elapsed: JsonDuration,
    pub phases: Vec<JsonPhase>,
    pub operations: u64,
    pub iops: f64,
    pub bytes_written: u64,
    pub write_throughput: String,
    pub volumes: BTreeMap<String, JsonVolume>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<JsonValidation>,
    /// Set when the run failed before or during validation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JsonRunSummary {
    pub fn new(summary: &RunSummary) -> Self {
        Self {
            workload: summary.workload.clone(),
            endpoint: summary.endpoint.clone(),
            started_at: summary.started_at.to_rfc3339(),
            elapsed: JsonDuration::from_duration(summary.elapsed),
            phases: summary
                .phases
                .iter()
                .map(|timing| JsonPhase {
                    phase: timing.phase.to_string(),
                    elapsed: JsonDuration::from_duration(timing.elapsed),
                    succeeded: timing.succeeded,
                })
                .collect(),
            operations: summary.operations,
            iops: calculate_iops(summary.operations, summary.elapsed),
            bytes_written: summary.bytes_written,
            write_throughput: format_throughput(calculate_throughput(summary.bytes_written, summary.elapsed)),
            volumes: summary
                .volumes
                .iter()
                .map(|(name, stats)| (name.clone(), JsonVolume::from_stats(stats)))
                .collect(),
            validation: summary.validation.as_ref().map(|outcome| JsonValidation {
                validator: outcome.validator.clone(),
                passed: outcome.passed,
                violations: outcome.violations.clone(),
                error: outcome.error.clone(),
            }),
            error: None,
        }
    }

    /// Record the error a failed run ended with
    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Write run summaries to `output_path` as a JSON array
pub fn write_json_output(output_path: &Path, runs: &[JsonRunSummary], pretty: bool) -> Result<()> {
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create JSON output file: {}", output_path.display()))?;
    let writer = BufWriter::new(file);

    if pretty {
        serde_json::to_writer_pretty(writer, runs)?;
    } else {
        serde_json::to_writer(writer, runs)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, DriverOptions};
    use crate::endpoint::memory::MemoryEndpoint;
    use crate::event::events::{VolumeStarted, VolumeStopped};
    use crate::operation::{ObjectOp, Operation};
    use crate::workload::sequence::SequenceWorkload;
    use crate::workload::Workload;

    fn run() -> RunSummary {
        let endpoint = MemoryEndpoint::new();
        let workload = Workload::new(
            SequenceWorkload::builder("json")
                .setup(vec![ObjectOp::create_bucket("b", "vol").into()])
                .lane(vec![
                    Operation::fire(VolumeStarted::new("vol")),
                    ObjectOp::put("b", "k", 512).charged_to("vol", 2).into(),
                    Operation::fire(VolumeStopped::new("vol")),
                ])
                .build(),
        );
        Driver::new(&endpoint, DriverOptions::default())
            .run(&workload)
            .unwrap()
    }

    #[test]
    fn test_json_document_shape() {
        let document = JsonRunSummary::new(&run()).with_error("boom");
        let value = serde_json::to_value(&document).unwrap();

        assert_eq!(value["workload"], "json");
        assert_eq!(value["operations"], 2);
        assert_eq!(value["bytes_written"], 512);
        assert_eq!(value["phases"].as_array().unwrap().len(), 3);
        assert_eq!(value["volumes"]["vol"]["io_cost"], 2);
        assert_eq!(value["volumes"]["vol"]["window"], "closed");
        assert_eq!(value["volumes"]["vol"]["latency"]["count"], 1);
        assert_eq!(value["error"], "boom");
        assert!(value.get("validation").is_none());
    }

    #[test]
    fn test_write_json_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let runs = vec![JsonRunSummary::new(&run())];

        write_json_output(&path, &runs, true).unwrap();

        let written: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(written.as_array().unwrap().len(), 1);
        assert_eq!(written[0]["endpoint"], "memory");
    }

    #[test]
    fn test_write_json_output_bad_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("summary.json");
        assert!(write_json_output(&path, &[], false).is_err());
    }
}

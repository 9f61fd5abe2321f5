//! Human-readable run summary

use crate::context::qos::VolumeStats;
use crate::driver::RunSummary;
use crate::stats::histogram::{LatencyHistogram, LatencySummary};
use crate::util::time::{
    calculate_iops, calculate_throughput, format_bytes, format_count, format_duration, format_rate,
    format_throughput,
};
use std::fmt::Write;
use std::time::Duration;

const RULE: &str = "═══════════════════════════════════════════════════════════";

/// Print a run summary to stdout
pub fn print_summary(summary: &RunSummary) {
    print!("{}", render_summary(summary));
}

/// Render a run summary as the text [`print_summary`] prints
pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    // writing into a String cannot fail
    let _ = write_summary(&mut out, summary);
    out
}

fn write_summary(out: &mut String, summary: &RunSummary) -> std::fmt::Result {
    writeln!(out, "{}", RULE)?;
    writeln!(out, "  {} on {}", summary.workload, summary.endpoint)?;
    writeln!(out, "{}", RULE)?;
    writeln!(out)?;

    writeln!(out, "Started:      {}", summary.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
    writeln!(out, "Elapsed Time: {:.3}s", summary.elapsed.as_secs_f64())?;
    writeln!(out)?;

    if !summary.phases.is_empty() {
        writeln!(out, "Phases:")?;
        for timing in &summary.phases {
            writeln!(
                out,
                "  {:<9} {:>10}  {}",
                timing.phase.to_string(),
                format_duration(timing.elapsed),
                if timing.succeeded { "ok" } else { "FAILED" }
            )?;
        }
        writeln!(out)?;
    }

    writeln!(out, "Operations:")?;
    writeln!(
        out,
        "  Total: {} ops - {} IOPS",
        format_count(summary.operations),
        format_rate(calculate_iops(summary.operations, summary.elapsed))
    )?;
    writeln!(
        out,
        "  Written: {} ({})",
        format_bytes(summary.bytes_written),
        format_throughput(calculate_throughput(summary.bytes_written, summary.elapsed))
    )?;
    if let Some(latency) = run_latency(summary) {
        writeln!(
            out,
            "  Latency: min {} / mean {} / p99 {} / max {}",
            format_micros(latency.min_us),
            format_micros(latency.mean_us),
            format_micros(latency.p99_us),
            format_micros(latency.max_us)
        )?;
    }
    writeln!(out)?;

    if !summary.volumes.is_empty() {
        writeln!(out, "Volumes:")?;
        writeln!(
            out,
            "  {:<20} {:>9} {:>9} {:>10} {:>10} {:>10} {:>10}",
            "volume", "assured", "throttle", "io cost", "IOPS", "p50", "p99"
        )?;
        for (name, stats) in &summary.volumes {
            write_volume(out, name, stats)?;
        }
        writeln!(out)?;
    }

    if let Some(validation) = &summary.validation {
        let verdict = if validation.passed { "passed" } else { "FAILED" };
        writeln!(out, "Validation ({}): {}", validation.validator, verdict)?;
        for violation in &validation.violations {
            writeln!(out, "  {}", violation)?;
        }
        if let Some(error) = &validation.error {
            writeln!(out, "  {}", error)?;
        }
        writeln!(out)?;
    }

    writeln!(out, "{}", RULE)
}

/// Latency across every measured volume
fn run_latency(summary: &RunSummary) -> Option<LatencySummary> {
    let mut merged = LatencyHistogram::new();
    for stats in summary.volumes.values() {
        if let Err(err) = merged.merge(stats.performance.latency()) {
            tracing::debug!(error = %err, "skipping volume latency");
        }
    }
    (!merged.is_empty()).then(|| merged.summary())
}

fn format_micros(micros: f64) -> String {
    format_duration(Duration::from_nanos((micros * 1_000.0) as u64))
}

fn write_volume(out: &mut String, name: &str, stats: &VolumeStats) -> std::fmt::Result {
    let limit = |iops: u64| if iops == 0 { "-".to_string() } else { iops.to_string() };
    let latency = stats.performance.latency();
    let percentile = |p: f64| {
        latency
            .percentile(p)
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string())
    };

    writeln!(
        out,
        "  {:<20} {:>9} {:>9} {:>10} {:>10.1} {:>10} {:>10}",
        name,
        limit(stats.settings.assured_iops),
        limit(stats.settings.throttle_iops),
        format_count(stats.performance.io_cost()),
        stats.performance.observed_iops(),
        percentile(50.0),
        percentile(99.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{PhaseTiming, ValidationOutcome};
    use crate::error::Phase;
    use crate::validator::{Violation, ViolationKind};
    use crate::volume::{Priority, QosSettings};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn summary() -> RunSummary {
        let mut volumes = BTreeMap::new();
        volumes.insert(
            "vol-0".to_string(),
            VolumeStats::new(QosSettings::new(100, 0, Priority::High).unwrap()),
        );
        RunSummary {
            workload: "demo".to_string(),
            endpoint: "memory".to_string(),
            started_at: Utc::now(),
            elapsed: Duration::from_secs(2),
            phases: vec![
                PhaseTiming {
                    phase: Phase::Setup,
                    elapsed: Duration::from_millis(3),
                    succeeded: true,
                },
                PhaseTiming {
                    phase: Phase::Body,
                    elapsed: Duration::from_secs(2),
                    succeeded: false,
                },
            ],
            operations: 2000,
            bytes_written: 2 * 1024 * 1024,
            volumes,
            validation: Some(ValidationOutcome {
                validator: "qos".to_string(),
                passed: false,
                violations: vec![Violation {
                    volume: "vol-0".to_string(),
                    kind: ViolationKind::NotMeasured,
                    observed_iops: 0.0,
                    limit: 0,
                }],
                error: None,
            }),
        }
    }

    #[test]
    fn test_render_summary() {
        let text = render_summary(&summary());

        assert!(text.contains("demo on memory"));
        assert!(text.contains("Total: 2,000 ops - 1.00K IOPS"));
        assert!(text.contains("Written: 2.00 MB (1.00 MB/s)"));
        assert!(text.contains("body"));
        assert!(text.contains("FAILED"));
        assert!(text.contains("vol-0"));
        assert!(text.contains("Validation (qos): FAILED"));
        assert!(text.contains("vol-0: never measured"));
        assert!(!text.contains("Latency:"));
    }

    #[test]
    fn test_run_latency_spans_volumes() {
        use crate::context::WorkloadContext;
        use crate::event::events::{OperationExecuted, VolumeStarted};
        use crate::operation::ObjectOp;

        let context = WorkloadContext::with_qos();
        context.set_up().unwrap();
        for (volume, micros) in [("vol-0", 100), ("vol-1", 300)] {
            context.send(VolumeStarted::new(volume));
            context.send(OperationExecuted {
                operation: ObjectOp::put("b", "k", 1).charged_to(volume, 1).into(),
                latency: Duration::from_micros(micros),
            });
        }

        let mut summary = summary();
        summary.volumes = context.all_stats();
        let text = render_summary(&summary);
        context.close().unwrap();

        assert!(text.contains("vol-1"));
        let latency = text.lines().find(|line| line.contains("Latency:")).unwrap();
        assert!(latency.contains("us / max "), "{}", latency);
    }

    #[test]
    fn test_render_without_volumes_or_validation() {
        let mut summary = summary();
        summary.volumes.clear();
        summary.validation = None;

        let text = render_summary(&summary);
        assert!(!text.contains("Volumes:"));
        assert!(!text.contains("Validation"));
    }
}

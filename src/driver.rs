//! End-to-end workload runs
//!
//! The [`Driver`] owns the order of a run:
//!
//! 1. set up a fresh context
//! 2. workload setup
//! 3. workload body
//! 4. workload teardown, attempted whenever setup succeeded
//! 5. stop the progress reporter and close the context
//! 6. run the workload's suggested validator
//!
//! The first failure wins; any later ones are logged. Every outcome carries a
//! [`RunSummary`] so callers can print what was measured even for a failed
//! run.

use crate::context::qos::VolumeStats;
use crate::context::WorkloadContext;
use crate::endpoint::Endpoint;
use crate::error::{ExecutionError, ExecutionResult, Phase};
use crate::output::reporter::ProgressReporter;
use crate::validator::{ValidationError, Violation};
use crate::workload::Workload;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Knobs of a driver run
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Print progress lines at this interval; `None` runs quietly
    pub report_interval: Option<Duration>,
    /// Run the workload's suggested validator after a successful run
    pub validate: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            report_interval: None,
            validate: true,
        }
    }
}

/// How long one phase of the top-level workload took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub elapsed: Duration,
    pub succeeded: bool,
}

/// Result of the validation step
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub validator: String,
    pub passed: bool,
    pub violations: Vec<Violation>,
    /// Reason validation could not run at all
    pub error: Option<String>,
}

/// Everything measured during one run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub workload: String,
    pub endpoint: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub phases: Vec<PhaseTiming>,
    /// Successful object operations
    pub operations: u64,
    /// Bytes written by successful puts
    pub bytes_written: u64,
    pub volumes: BTreeMap<String, VolumeStats>,
    pub validation: Option<ValidationOutcome>,
}

impl RunSummary {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseTiming> {
        self.phases.iter().find(|timing| timing.phase == phase)
    }
}

/// A run that did not succeed
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("workload '{}' failed: {source}", .summary.workload)]
    Execution {
        #[source]
        source: ExecutionError,
        summary: Box<RunSummary>,
    },

    #[error("workload '{}' failed validation: {source}", .summary.workload)]
    Validation {
        #[source]
        source: ValidationError,
        summary: Box<RunSummary>,
    },
}

impl DriverError {
    /// What was measured before the run failed
    pub fn summary(&self) -> &RunSummary {
        match self {
            DriverError::Execution { summary, .. } | DriverError::Validation { summary, .. } => summary,
        }
    }
}

/// Runs workloads against one endpoint
pub struct Driver<'a> {
    endpoint: &'a dyn Endpoint,
    options: DriverOptions,
}

impl<'a> Driver<'a> {
    pub fn new(endpoint: &'a dyn Endpoint, options: DriverOptions) -> Self {
        Self { endpoint, options }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Run `workload` in a fresh QoS-tracking context
    pub fn run(&self, workload: &Workload) -> Result<RunSummary, DriverError> {
        self.run_in(workload, WorkloadContext::with_qos())
    }

    /// Run `workload` in a caller-built context
    ///
    /// The context must not have been set up yet; it is closed before this
    /// returns.
    pub fn run_in(&self, workload: &Workload, context: WorkloadContext) -> Result<RunSummary, DriverError> {
        let started_at = Utc::now();
        let started = Instant::now();
        info!(workload = workload.name(), endpoint = self.endpoint.name(), "run starting");

        let mut errors: Vec<ExecutionError> = Vec::new();
        let mut phases = Vec::with_capacity(3);

        if let Err(err) = context.set_up() {
            errors.push(err);
        }

        let reporter = match self.options.report_interval {
            Some(interval) => ProgressReporter::start(context.bus(), interval),
            None => ProgressReporter::silent(context.bus()),
        };

        if errors.is_empty() {
            let setup = timed(Phase::Setup, &mut phases, || workload.set_up(self.endpoint, &context));
            match setup {
                Ok(()) => {
                    let body = timed(Phase::Body, &mut phases, || workload.run_on(self.endpoint, &context));
                    let teardown = timed(Phase::Teardown, &mut phases, || {
                        workload.tear_down(self.endpoint, &context)
                    });
                    errors.extend(body.err());
                    errors.extend(teardown.err());
                }
                Err(err) => {
                    errors.push(err);
                    // remove whatever setup created before it failed
                    let cleanup = timed(Phase::Teardown, &mut phases, || {
                        workload.clean_up(self.endpoint, &context)
                    });
                    if let Err(cleanup) = cleanup {
                        warn!(workload = workload.name(), error = %cleanup, "cleanup after failed setup");
                    }
                }
            }
        }

        let (operations, bytes_written) = match reporter.close() {
            Ok(totals) => (totals.operations, totals.bytes),
            Err(err) => {
                errors.push(err);
                (0, 0)
            }
        };
        if let Err(err) = context.close() {
            errors.push(err);
        }

        let mut summary = RunSummary {
            workload: workload.name().to_string(),
            endpoint: self.endpoint.name().to_string(),
            started_at,
            elapsed: started.elapsed(),
            phases,
            operations,
            bytes_written,
            volumes: context.all_stats(),
            validation: None,
        };

        let mut errors = errors.into_iter();
        if let Some(first) = errors.next() {
            for other in errors {
                warn!(workload = %summary.workload, error = %other, "additional failure");
            }
            return Err(DriverError::Execution {
                source: first,
                summary: Box::new(summary),
            });
        }

        if self.options.validate {
            if let Some(validator) = workload.validator() {
                let result = validator.validate(&context);
                summary.validation = Some(ValidationOutcome {
                    validator: validator.name().to_string(),
                    passed: result.is_ok(),
                    violations: result
                        .as_ref()
                        .err()
                        .map(|err| err.violations().to_vec())
                        .unwrap_or_default(),
                    error: match &result {
                        Err(err @ ValidationError::MissingData { .. }) => Some(err.to_string()),
                        _ => None,
                    },
                });
                if let Err(source) = result {
                    return Err(DriverError::Validation {
                        source,
                        summary: Box::new(summary),
                    });
                }
            }
        }

        info!(workload = %summary.workload, elapsed = ?summary.elapsed, operations = summary.operations, "run finished");
        Ok(summary)
    }
}

fn timed<F>(phase: Phase, phases: &mut Vec<PhaseTiming>, run: F) -> ExecutionResult<()>
where
    F: FnOnce() -> ExecutionResult<()>,
{
    let started = Instant::now();
    let result = run();
    phases.push(PhaseTiming {
        phase,
        elapsed: started.elapsed(),
        succeeded: result.is_ok(),
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::memory::MemoryEndpoint;
    use crate::event::events::{VolumeStarted, VolumeStopped};
    use crate::event::Envelope;
    use crate::operation::{ManagementOp, ObjectOp, Operation};
    use crate::validator::QosValidator;
    use crate::volume::{Priority, QosSettings};
    use crate::workload::sequence::SequenceWorkload;

    fn smoke() -> Workload {
        Workload::new(
            SequenceWorkload::builder("smoke")
                .setup(vec![
                    ObjectOp::create_bucket("b", "vol").into(),
                    Operation::fire(VolumeStarted::new("vol")),
                ])
                .lane(vec![ObjectOp::put("b", "one", 100).charged_to("vol", 1).into()])
                .lane(vec![ObjectOp::put("b", "two", 200).charged_to("vol", 1).into()])
                .teardown(vec![
                    Operation::fire(VolumeStopped::new("vol")),
                    ObjectOp::delete("b", "one").into(),
                    ObjectOp::delete("b", "two").into(),
                    ObjectOp::delete_bucket("b").into(),
                ])
                .build(),
        )
    }

    #[test]
    fn test_successful_run_summary() {
        let endpoint = MemoryEndpoint::new();
        let summary = Driver::new(&endpoint, DriverOptions::default())
            .run(&smoke())
            .unwrap();

        assert_eq!(summary.workload, "smoke");
        assert_eq!(summary.endpoint, "memory");
        assert_eq!(summary.phases.len(), 3);
        assert!(summary.phases.iter().all(|timing| timing.succeeded));
        assert_eq!(summary.operations, 6);
        assert_eq!(summary.bytes_written, 300);
        assert_eq!(summary.volumes["vol"].performance.operations(), 2);
        assert!(summary.validation.is_none());
    }

    #[test]
    fn test_teardown_runs_after_body_failure() {
        let endpoint = MemoryEndpoint::new();
        endpoint.fail_matching("put b/two");

        let err = Driver::new(&endpoint, DriverOptions::default())
            .run(&smoke())
            .unwrap_err();

        let DriverError::Execution { source, summary } = &err else {
            panic!("expected execution error, got {err}");
        };
        assert_eq!(source.failures().len(), 1);
        assert_eq!(source.failures()[0].lane, Some(1));
        // teardown ran, but "two" was never written
        assert!(!summary.phase(Phase::Teardown).unwrap().succeeded);
        assert!(endpoint.executed().iter().any(|call| call.call == "delete b/one"));
    }

    #[test]
    fn test_setup_failure_skips_body_and_cleans_up() {
        let endpoint = MemoryEndpoint::new();
        endpoint.fail_matching("create bucket b");
        let workload = Workload::new(
            SequenceWorkload::builder("partial")
                .setup(vec![
                    ManagementOp::add_volume("vol", QosSettings::unmanaged()).into(),
                    ObjectOp::create_bucket("b", "vol").into(),
                ])
                .lane(vec![ObjectOp::put("b", "k", 1).into()])
                .teardown(vec![
                    ObjectOp::delete_bucket("b").into(),
                    ManagementOp::delete_volume("vol").into(),
                ])
                .build(),
        );

        let err = Driver::new(&endpoint, DriverOptions::default())
            .run(&workload)
            .unwrap_err();

        match &err {
            DriverError::Execution {
                source: ExecutionError::Aggregate { phase, .. },
                ..
            } => assert_eq!(*phase, Phase::Setup),
            other => panic!("expected the setup failure, got {other}"),
        }
        let phases: Vec<Phase> = err.summary().phases.iter().map(|timing| timing.phase).collect();
        assert_eq!(phases, vec![Phase::Setup, Phase::Teardown]);
        assert!(!endpoint.executed().iter().any(|call| call.call.starts_with("put")));
        // the bucket was never created, but the volume added before it is gone
        assert!(endpoint.volume("vol").is_none());
    }

    #[test]
    fn test_listener_failure_surfaces_at_close() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::with_qos();
        let _subscription = context
            .bus()
            .register(|_: &Envelope<VolumeStopped>| Err(anyhow::anyhow!("listener exploded")));

        let err = Driver::new(&endpoint, DriverOptions::default())
            .run_in(&smoke(), context)
            .unwrap_err();

        match err {
            DriverError::Execution {
                source: ExecutionError::Listeners { failures },
                ..
            } => assert!(failures[0].message.contains("listener exploded")),
            other => panic!("expected listener failure, got {other}"),
        }
    }

    #[test]
    fn test_validation_failure_keeps_summary() {
        let endpoint = MemoryEndpoint::new();
        let qos = QosSettings::new(1_000_000, 0, Priority::Normal).unwrap();
        let workload = Workload::new(
            SequenceWorkload::builder("starved")
                .setup(vec![
                    crate::operation::ManagementOp::add_volume("vol", qos).into(),
                    ObjectOp::create_bucket("b", "vol").into(),
                ])
                .lane(vec![
                    Operation::fire(VolumeStarted::new("vol")),
                    ObjectOp::put("b", "k", 1).charged_to("vol", 1).into(),
                    Operation::pause(Duration::from_millis(20)),
                    Operation::fire(VolumeStopped::new("vol")),
                ])
                .validator(|| Box::new(QosValidator::default()))
                .build(),
        );

        let err = Driver::new(&endpoint, DriverOptions::default())
            .run(&workload)
            .unwrap_err();

        assert!(matches!(err, DriverError::Validation { .. }));
        let validation = err.summary().validation.as_ref().unwrap();
        assert!(!validation.passed);
        assert_eq!(validation.violations.len(), 1);
    }

    #[test]
    fn test_validation_can_be_skipped() {
        let endpoint = MemoryEndpoint::new();
        let workload = Workload::new(
            SequenceWorkload::builder("unchecked")
                .validator(|| Box::new(QosValidator::default().for_volumes(["ghost"])))
                .build(),
        );
        let options = DriverOptions {
            validate: false,
            ..DriverOptions::default()
        };

        let summary = Driver::new(&endpoint, options).run(&workload).unwrap();
        assert!(summary.validation.is_none());
    }
}

//! Workloads: setup, a parallel body, and teardown
//!
//! A [`Workload`] wraps a [`WorkloadPlan`], the declarative part that says
//! which operations to run, and adds the orchestration that runs them:
//!
//! - `set_up` executes the setup sequence on the calling thread
//! - `run_on` executes one lane per body sequence, each on its own thread;
//!   all lanes meet at a rendezvous before their first operation so they
//!   start issuing traffic at the same instant
//! - `tear_down` executes the teardown sequence on the calling thread
//!
//! Sequences are built lazily, once, by [`Workload::ensure_initialized`]. A
//! failed build caches nothing; the next call runs the plan's factories again.
//!
//! Every phase returns an aggregate error carrying each failed step with its
//! lane, step index and operation. In setup and teardown the first failure
//! aborts the rest of the sequence; in the body every lane runs to completion
//! (or its own first failure) and all lane failures are reported together.

pub mod churn;
pub mod qos;
pub mod sequence;

use crate::context::WorkloadContext;
use crate::endpoint::Endpoint;
use crate::error::{ExecutionError, ExecutionResult, Phase, StepFailure};
use crate::event::events::{LaneArrived, LaneReleased, PhaseFinished, PhaseStarted};
use crate::event::panic_message;
use crate::operation::barrier::{Rendezvous, DEFAULT_RENDEZVOUS_TIMEOUT};
use crate::operation::Operation;
use crate::validator::Validator;
use crossbeam::channel;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Declarative part of a workload: which operations run in each phase
///
/// Factories run once per [`Workload`] (unless they fail) and may reject
/// invalid parameters with a usage error.
pub trait WorkloadPlan: Send + Sync {
    fn name(&self) -> &str;

    fn create_setup(&self) -> ExecutionResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    /// One sequence per lane
    fn create_operations(&self) -> ExecutionResult<Vec<Vec<Operation>>> {
        Ok(Vec::new())
    }

    fn create_teardown(&self) -> ExecutionResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    /// Validator the driver should run after the body
    fn validator(&self) -> Option<Box<dyn Validator>> {
        None
    }
}

/// The three operation sequences of an initialized workload
#[derive(Debug, Clone, Default)]
pub struct Sequences {
    pub setup: Vec<Operation>,
    pub lanes: Vec<Vec<Operation>>,
    pub teardown: Vec<Operation>,
}

impl Sequences {
    /// Operations across all phases, not counting repeat iterations
    pub fn len(&self) -> usize {
        self.setup.len() + self.lanes.iter().map(Vec::len).sum::<usize>() + self.teardown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A plan plus the machinery that executes it
pub struct Workload {
    plan: Box<dyn WorkloadPlan>,
    sequences: Mutex<Option<Arc<Sequences>>>,
    barrier_timeout: Duration,
}

impl Workload {
    pub fn new(plan: impl WorkloadPlan + 'static) -> Self {
        Self {
            plan: Box::new(plan),
            sequences: Mutex::new(None),
            barrier_timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
        }
    }

    /// Bound on how long a lane waits for the others before its first operation
    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        self.plan.name()
    }

    pub fn barrier_timeout(&self) -> Duration {
        self.barrier_timeout
    }

    pub fn validator(&self) -> Option<Box<dyn Validator>> {
        self.plan.validator()
    }

    /// Build the sequences once and return the cached copy afterwards
    ///
    /// # Errors
    ///
    /// Whatever the plan's factories return. Nothing is cached on failure.
    pub fn ensure_initialized(&self) -> ExecutionResult<Arc<Sequences>> {
        let mut cached = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sequences) = cached.as_ref() {
            return Ok(Arc::clone(sequences));
        }

        let sequences = Arc::new(Sequences {
            setup: self.plan.create_setup()?,
            lanes: self.plan.create_operations()?,
            teardown: self.plan.create_teardown()?,
        });
        tracing::debug!(
            workload = self.name(),
            setup = sequences.setup.len(),
            lanes = sequences.lanes.len(),
            teardown = sequences.teardown.len(),
            "sequences built"
        );
        *cached = Some(Arc::clone(&sequences));
        Ok(sequences)
    }

    /// Execute the setup sequence, stopping at the first failure
    pub fn set_up(&self, endpoint: &dyn Endpoint, context: &WorkloadContext) -> ExecutionResult<()> {
        let sequences = self.ensure_initialized()?;
        context.begin_running()?;
        self.run_serial(Phase::Setup, &sequences.setup, endpoint, context, false)
    }

    /// Execute the teardown sequence, stopping at the first failure
    pub fn tear_down(&self, endpoint: &dyn Endpoint, context: &WorkloadContext) -> ExecutionResult<()> {
        let sequences = self.ensure_initialized()?;
        context.begin_running()?;
        self.run_serial(Phase::Teardown, &sequences.teardown, endpoint, context, false)
    }

    /// Execute the whole teardown sequence after a failed setup
    ///
    /// Setup may have stopped partway, so teardown steps for fixtures that
    /// were never created are expected to fail. Every step is attempted; the
    /// failures are returned together as one aggregate.
    pub fn clean_up(&self, endpoint: &dyn Endpoint, context: &WorkloadContext) -> ExecutionResult<()> {
        let sequences = self.ensure_initialized()?;
        context.begin_running()?;
        self.run_serial(Phase::Teardown, &sequences.teardown, endpoint, context, true)
    }

    /// Execute every lane concurrently, one thread per lane
    ///
    /// Lanes wait at a shared rendezvous (bounded by the barrier timeout)
    /// before their first operation, then run their sequence strictly in
    /// order. All lanes are joined before returning.
    ///
    /// # Errors
    ///
    /// An aggregate error with one entry per failed lane, in lane order. A
    /// lane that panicked is reported as `LanePanicked`.
    pub fn run_on(&self, endpoint: &dyn Endpoint, context: &WorkloadContext) -> ExecutionResult<()> {
        let sequences = self.ensure_initialized()?;
        context.begin_running()?;

        let lanes = &sequences.lanes;
        let started = self.phase_started(Phase::Body, lanes.len(), context);
        if lanes.is_empty() {
            self.phase_finished(Phase::Body, started, true, context);
            return Ok(());
        }

        let rendezvous = Rendezvous::new(lanes.len(), self.barrier_timeout)?;
        let (results, outcomes) = channel::unbounded::<(usize, Result<(), StepFailure>)>();

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(lanes.len());
            for (lane, operations) in lanes.iter().enumerate() {
                let lane_results = results.clone();
                let rendezvous = &rendezvous;
                let spawned = thread::Builder::new()
                    .name(format!("{}-lane-{}", self.name(), lane))
                    .spawn_scoped(scope, move || {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            self.run_lane(lane, operations, rendezvous, endpoint, context)
                        }))
                        .unwrap_or_else(|panic| {
                            let message = panic_message(panic.as_ref());
                            rendezvous.break_with(format!("lane {} panicked", lane));
                            Err(StepFailure {
                                lane: Some(lane),
                                step: None,
                                operation: "lane".to_string(),
                                error: ExecutionError::LanePanicked { lane, message },
                            })
                        });
                        let _ = lane_results.send((lane, outcome));
                    });

                match spawned {
                    Ok(handle) => handles.push((lane, handle)),
                    Err(err) => {
                        rendezvous.break_with(format!("lane {} could not be started", lane));
                        let _ = results.send((
                            lane,
                            Err(StepFailure {
                                lane: Some(lane),
                                step: None,
                                operation: "lane".to_string(),
                                error: ExecutionError::with_source("failed to spawn lane thread", err),
                            }),
                        ));
                    }
                }
            }

            for (lane, handle) in handles {
                if let Err(panic) = handle.join() {
                    let _ = results.send((
                        lane,
                        Err(StepFailure {
                            lane: Some(lane),
                            step: None,
                            operation: "lane".to_string(),
                            error: ExecutionError::LanePanicked {
                                lane,
                                message: panic_message(panic.as_ref()),
                            },
                        }),
                    ));
                }
            }
        });
        drop(results);

        let mut failures: Vec<StepFailure> = outcomes
            .iter()
            .filter_map(|(_, outcome)| outcome.err())
            .collect();
        failures.sort_by_key(|failure| failure.lane);

        for failure in &failures {
            tracing::error!(workload = self.name(), "{}", failure);
        }
        self.phase_finished(Phase::Body, started, failures.is_empty(), context);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExecutionError::Aggregate {
                phase: Phase::Body,
                failures,
            })
        }
    }

    fn run_lane(
        &self,
        lane: usize,
        operations: &[Operation],
        rendezvous: &Rendezvous,
        endpoint: &dyn Endpoint,
        context: &WorkloadContext,
    ) -> Result<(), StepFailure> {
        context.send(LaneArrived {
            workload: self.name().to_string(),
            lane,
            at: Instant::now(),
        });
        let release = rendezvous.wait().map_err(|error| StepFailure {
            lane: Some(lane),
            step: None,
            operation: format!("rendezvous of {}", rendezvous.parties()),
            error,
        })?;
        context.send(LaneReleased {
            workload: self.name().to_string(),
            lane,
            at: release.released_at,
        });

        for (step, operation) in operations.iter().enumerate() {
            tracing::debug!(lane, step, operation = %operation, "executing");
            operation
                .execute(endpoint, context)
                .map_err(|error| StepFailure {
                    lane: Some(lane),
                    step: Some(step),
                    operation: operation.to_string(),
                    error,
                })?;
        }
        Ok(())
    }

    fn run_serial(
        &self,
        phase: Phase,
        operations: &[Operation],
        endpoint: &dyn Endpoint,
        context: &WorkloadContext,
        best_effort: bool,
    ) -> ExecutionResult<()> {
        let started = self.phase_started(phase, 1, context);
        let mut failures = Vec::new();

        for (step, operation) in operations.iter().enumerate() {
            tracing::debug!(%phase, step, operation = %operation, "executing");
            if let Err(error) = operation.execute(endpoint, context) {
                let failure = StepFailure {
                    lane: None,
                    step: Some(step),
                    operation: operation.to_string(),
                    error,
                };
                if best_effort {
                    tracing::debug!(workload = self.name(), %phase, "{}", failure);
                    failures.push(failure);
                    continue;
                }
                tracing::error!(workload = self.name(), %phase, "{}", failure);
                failures.push(failure);
                break;
            }
        }

        self.phase_finished(phase, started, failures.is_empty(), context);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExecutionError::Aggregate { phase, failures })
        }
    }

    fn phase_started(&self, phase: Phase, lanes: usize, context: &WorkloadContext) -> Instant {
        tracing::info!(workload = self.name(), %phase, lanes, "phase started");
        context.send(PhaseStarted {
            workload: self.name().to_string(),
            phase,
            lanes,
        });
        Instant::now()
    }

    fn phase_finished(&self, phase: Phase, started: Instant, succeeded: bool, context: &WorkloadContext) {
        let elapsed = started.elapsed();
        tracing::info!(workload = self.name(), %phase, ?elapsed, succeeded, "phase finished");
        context.send(PhaseFinished {
            workload: self.name().to_string(),
            phase,
            elapsed,
            succeeded,
        });
    }
}

impl fmt::Debug for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initialized = self
            .sequences
            .lock()
            .map(|cached| cached.is_some())
            .unwrap_or(false);
        f.debug_struct("Workload")
            .field("name", &self.name())
            .field("barrier_timeout", &self.barrier_timeout)
            .field("initialized", &initialized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::sequence::SequenceWorkload;
    use super::*;
    use crate::endpoint::memory::MemoryEndpoint;
    use crate::error::{Capability, UsageError};
    use crate::event::Envelope;
    use crate::operation::{ManagementOp, ObjectOp};
    use crate::volume::QosSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl WorkloadPlan for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn create_operations(&self) -> ExecutionResult<Vec<Vec<Operation>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(UsageError::invalid("lanes", "factory rejected its parameters").into());
            }
            Ok(vec![vec![Operation::pause(Duration::ZERO)]])
        }
    }

    fn put(key: &str) -> Operation {
        ObjectOp::put("b", key, 1).into()
    }

    #[test]
    fn test_sequences_are_memoized() {
        let workload = Workload::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let first = workload.ensure_initialized().unwrap();
        let second = workload.ensure_initialized().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let workload = Workload::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        assert!(matches!(
            workload.ensure_initialized(),
            Err(ExecutionError::Usage(_))
        ));
        assert!(workload.ensure_initialized().is_err());
        assert_eq!(workload.ensure_initialized().unwrap().lanes.len(), 1);
    }

    #[test]
    fn test_two_lanes_start_after_rendezvous() {
        let endpoint = MemoryEndpoint::new();
        endpoint.seed_bucket("b");
        let context = WorkloadContext::new();
        let releases = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let releases = Arc::clone(&releases);
            context.bus().register(move |event: &Envelope<LaneReleased>| {
                releases.lock().unwrap().push((event.lane, event.at));
                Ok(())
            })
        };

        let workload = Workload::new(
            SequenceWorkload::builder("two-lanes")
                .lane(vec![put("op1"), put("op2")])
                .lane(vec![put("op3")])
                .build(),
        );
        workload.run_on(&endpoint, &context).unwrap();

        let calls = endpoint.executed();
        let mut names: Vec<&str> = calls.iter().map(|record| record.call.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["put b/op1", "put b/op2", "put b/op3"]);

        let lane_a: Vec<&str> = calls
            .iter()
            .filter(|record| record.thread.as_deref() == Some("two-lanes-lane-0"))
            .map(|record| record.call.as_str())
            .collect();
        assert_eq!(lane_a, vec!["put b/op1", "put b/op2"]);

        let releases = releases.lock().unwrap();
        assert_eq!(releases.len(), 2);
        let latest_release = releases.iter().map(|(_, at)| *at).max().unwrap();
        assert!(calls.iter().all(|record| record.at >= latest_release));
    }

    #[test]
    fn test_lane_failures_are_aggregated_in_lane_order() {
        let endpoint = MemoryEndpoint::new();
        endpoint.seed_bucket("b");
        endpoint.fail_matching("bad");
        let context = WorkloadContext::new();

        let workload = Workload::new(
            SequenceWorkload::builder("failing")
                .lane(vec![put("ok-0")])
                .lane(vec![put("bad-1"), put("never")])
                .lane(vec![put("ok-2")])
                .lane(vec![put("ok-3"), put("bad-3")])
                .build(),
        );
        let err = workload.run_on(&endpoint, &context).unwrap_err();

        let failures = err.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!((failures[0].lane, failures[0].step), (Some(1), Some(0)));
        assert_eq!((failures[1].lane, failures[1].step), (Some(3), Some(1)));
        assert_eq!(err.suppressed().count(), 2);
        assert!(!endpoint.executed().iter().any(|record| record.call == "put b/never"));
        assert_eq!(endpoint.executed_count(), 3);
    }

    #[test]
    fn test_unsupported_operation_in_setup() {
        let endpoint = MemoryEndpoint::object_store_only();
        let context = WorkloadContext::new();
        let workload = Workload::new(
            SequenceWorkload::builder("mgmt")
                .setup(vec![
                    ManagementOp::stat_volume("vol").into(),
                    ObjectOp::create_bucket("b", "vol").into(),
                ])
                .build(),
        );

        let err = workload.set_up(&endpoint, &context).unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].step, Some(0));
        assert!(matches!(
            failures[0].error,
            ExecutionError::Unsupported {
                capability: Capability::Management,
                ..
            }
        ));
        assert!(!endpoint.bucket_exists("b"));
    }

    #[test]
    fn test_broken_rendezvous_fails_only_its_lane() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::new();
        let blocker = Arc::new(Rendezvous::new(2, Duration::from_secs(5)).unwrap());
        blocker.break_with("no partner");

        let workload = Workload::new(
            SequenceWorkload::builder("stuck")
                .lane(vec![Operation::pause(Duration::ZERO)])
                .lane(vec![Operation::barrier(Arc::clone(&blocker))])
                .build(),
        )
        .with_barrier_timeout(Duration::from_millis(500));

        let err = workload.run_on(&endpoint, &context).unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].lane, Some(1));
        assert!(matches!(
            err.failures()[0].error,
            ExecutionError::BarrierBroken { .. }
        ));
    }

    #[test]
    fn test_nested_workload_runs_all_phases() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::new();
        let inner = Arc::new(Workload::new(
            SequenceWorkload::builder("inner")
                .setup(vec![ObjectOp::create_bucket("nb", "vol").into()])
                .lane(vec![ObjectOp::put("nb", "k", 1).into()])
                .teardown(vec![
                    ObjectOp::delete("nb", "k").into(),
                    ObjectOp::delete_bucket("nb").into(),
                ])
                .build(),
        ));
        let outer = Workload::new(
            SequenceWorkload::builder("outer")
                .lane(vec![Operation::nested(inner)])
                .build(),
        );

        outer.run_on(&endpoint, &context).unwrap();
        assert_eq!(endpoint.executed_count(), 4);
        assert!(!endpoint.bucket_exists("nb"));
    }

    #[test]
    fn test_lane_barrier_timeout_surfaces_in_aggregate() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::new();
        let partnerless = Arc::new(Rendezvous::new(2, Duration::from_millis(50)).unwrap());

        let workload = Workload::new(
            SequenceWorkload::builder("alone")
                .lane(vec![Operation::barrier(partnerless)])
                .build(),
        );

        let err = workload.run_on(&endpoint, &context).unwrap_err();
        assert!(matches!(err, ExecutionError::Aggregate { phase: Phase::Body, .. }));
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].lane, Some(0));
        assert!(err.failures()[0].error.is_timeout());
        assert!(err.involves_timeout());
    }

    #[test]
    fn test_clean_up_attempts_every_step() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::new();
        let workload = Workload::new(
            SequenceWorkload::builder("cleanup")
                .setup(vec![ManagementOp::add_volume("vol", QosSettings::unmanaged()).into()])
                .teardown(vec![
                    ObjectOp::delete_bucket("missing").into(),
                    ManagementOp::delete_volume("vol").into(),
                ])
                .build(),
        );
        workload.set_up(&endpoint, &context).unwrap();

        let err = workload.clean_up(&endpoint, &context).unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].step, Some(0));
        assert!(endpoint.volume("vol").is_none());
    }

    #[test]
    fn test_nested_setup_failure_cleans_up() {
        let endpoint = MemoryEndpoint::new();
        endpoint.fail_matching("create bucket nb");
        let context = WorkloadContext::new();
        let inner = Arc::new(Workload::new(
            SequenceWorkload::builder("inner")
                .setup(vec![
                    ManagementOp::add_volume("nvol", QosSettings::unmanaged()).into(),
                    ObjectOp::create_bucket("nb", "nvol").into(),
                ])
                .lane(vec![ObjectOp::put("nb", "k", 1).into()])
                .teardown(vec![
                    ObjectOp::delete_bucket("nb").into(),
                    ManagementOp::delete_volume("nvol").into(),
                ])
                .build(),
        ));
        let outer = Workload::new(
            SequenceWorkload::builder("outer")
                .lane(vec![Operation::nested(inner)])
                .build(),
        );

        let err = outer.run_on(&endpoint, &context).unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert!(!endpoint.executed().iter().any(|record| record.call.starts_with("put")));
        assert!(endpoint.volume("nvol").is_none());
    }
}

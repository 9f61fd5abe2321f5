//! Error taxonomy for workload execution
//!
//! Every failure that can happen while a workload runs is an [`ExecutionError`].
//! Individual units of work fail with `Failed`, `Unsupported` or `Timeout`;
//! the workload phases (`set_up`, `run_on`, `tear_down`) wrap whatever went
//! wrong into a single `Aggregate` error that carries one [`StepFailure`] per
//! failed step, so the driver always sees every lane failure at once.
//!
//! Constructor validation uses the separate [`UsageError`] so invalid workload
//! parameters are rejected before anything touches an endpoint.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for operations, endpoints and workload phases
pub type ExecutionResult<T> = std::result::Result<T, ExecutionError>;

/// Boxed error used for foreign sources attached to an execution failure
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Endpoint capability required to execute an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Bucket and object I/O
    ObjectStore,
    /// Volume administration (create, stat, modify, delete)
    Management,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::ObjectStore => write!(f, "object-store"),
            Capability::Management => write!(f, "management"),
        }
    }
}

/// Workload phase an aggregate error was raised from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Setup,
    Body,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Body => write!(f, "body"),
            Phase::Teardown => write!(f, "teardown"),
        }
    }
}

/// Invalid construction parameters
///
/// Raised by workload and validator constructors (and by workload factories)
/// before any operation is executed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("invalid {parameter}: {reason}")]
    Invalid {
        parameter: &'static str,
        reason: String,
    },
}

impl UsageError {
    pub fn invalid(parameter: &'static str, reason: impl Into<String>) -> Self {
        UsageError::Invalid {
            parameter,
            reason: reason.into(),
        }
    }
}

/// One failed step of a workload phase
///
/// `lane` is set for body failures, `step` is the index of the operation in
/// its sequence (absent when the lane failed before its first operation, e.g.
/// at the rendezvous).
#[derive(Debug)]
pub struct StepFailure {
    pub lane: Option<usize>,
    pub step: Option<usize>,
    pub operation: String,
    pub error: ExecutionError,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(lane) = self.lane {
            write!(f, "lane {}, ", lane)?;
        }
        match self.step {
            Some(step) => write!(f, "step {} ({}): {}", step, self.operation, self.error),
            None => write!(f, "{}: {}", self.operation, self.error),
        }
    }
}

/// A listener callback that failed while an event was being delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    pub event: &'static str,
    pub subscription: u64,
    pub message: String,
}

impl fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listener #{} for {}: {}",
            self.subscription, self.event, self.message
        )
    }
}

/// Errors raised while executing operations and workload phases
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A unit of work failed (I/O error, malformed response, missing object)
    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The endpoint does not provide the capability the operation needs
    #[error("{operation} requires the {capability} capability, which endpoint '{endpoint}' does not provide")]
    Unsupported {
        operation: String,
        capability: Capability,
        endpoint: String,
    },

    /// A bounded wait expired
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// Another party gave up on a shared rendezvous
    #[error("rendezvous broken: {reason}")]
    BarrierBroken { reason: String },

    /// A worker lane panicked instead of returning
    #[error("lane {lane} panicked: {message}")]
    LanePanicked { lane: usize, message: String },

    /// One or more steps of a workload phase failed
    #[error("{phase} failed with {} error(s): {}", .failures.len(), join_display(.failures))]
    Aggregate {
        phase: Phase,
        failures: Vec<StepFailure>,
    },

    /// Listener callbacks failed during the run (surfaced at context close)
    #[error("{} listener callback(s) failed: {}", .failures.len(), join_display(.failures))]
    Listeners { failures: Vec<ListenerFailure> },

    /// Invalid workload parameters discovered while building sequences
    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl ExecutionError {
    /// Create a plain execution failure
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutionError::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Create an execution failure caused by a foreign error
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ExecutionError::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True when this error is a deadline expiry rather than a generic failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout { .. })
    }

    /// Step failures carried by an aggregate error (empty otherwise)
    pub fn failures(&self) -> &[StepFailure] {
        match self {
            ExecutionError::Aggregate { failures, .. } => failures,
            _ => &[],
        }
    }

    /// The errors suppressed into this aggregate, in lane/step order
    pub fn suppressed(&self) -> impl Iterator<Item = &ExecutionError> {
        self.failures().iter().map(|failure| &failure.error)
    }

    /// Leaf errors with all aggregate layers (nested workloads) peeled off
    pub fn root_causes(&self) -> Vec<&ExecutionError> {
        match self {
            ExecutionError::Aggregate { failures, .. } => failures
                .iter()
                .flat_map(|failure| failure.error.root_causes())
                .collect(),
            other => vec![other],
        }
    }

    /// True when this error or any root cause is a timeout
    ///
    /// Drivers use this to decide whether a failed run is worth retrying.
    pub fn involves_timeout(&self) -> bool {
        self.root_causes().iter().any(|cause| cause.is_timeout())
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(lane: usize, error: ExecutionError) -> StepFailure {
        StepFailure {
            lane: Some(lane),
            step: Some(0),
            operation: "put b/k".to_string(),
            error,
        }
    }

    #[test]
    fn test_aggregate_lists_every_failure() {
        let err = ExecutionError::Aggregate {
            phase: Phase::Body,
            failures: vec![
                failure(0, ExecutionError::failed("disk on fire")),
                failure(1, ExecutionError::failed("network gone")),
            ],
        };

        let message = err.to_string();
        assert!(message.starts_with("body failed with 2 error(s)"));
        assert!(message.contains("lane 0, step 0 (put b/k): disk on fire"));
        assert!(message.contains("lane 1, step 0 (put b/k): network gone"));
        assert_eq!(err.suppressed().count(), 2);
    }

    #[test]
    fn test_root_causes_flatten_nested_aggregates() {
        let inner = ExecutionError::Aggregate {
            phase: Phase::Setup,
            failures: vec![failure(
                0,
                ExecutionError::Timeout {
                    what: "rendezvous".to_string(),
                    after: Duration::from_secs(1),
                },
            )],
        };
        let outer = ExecutionError::Aggregate {
            phase: Phase::Body,
            failures: vec![failure(3, inner)],
        };

        let roots = outer.root_causes();
        assert_eq!(roots.len(), 1);
        assert!(roots[0].is_timeout());
        assert!(!outer.is_timeout());
        assert!(outer.involves_timeout());
    }

    #[test]
    fn test_usage_error_message() {
        let err: ExecutionError = UsageError::invalid("buckets", "must be at least 1").into();
        assert_eq!(err.to_string(), "invalid buckets: must be at least 1");
        assert!(err.failures().is_empty());
    }
}

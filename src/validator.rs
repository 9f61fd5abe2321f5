//! Post-run validation
//!
//! A [`Validator`] inspects the statistics a context accumulated during a run
//! and reports every violated expectation at once. Validators only read
//! copies of the tracked state, so they may run while lanes are still
//! publishing.

use crate::context::qos::VolumeStats;
use crate::context::WorkloadContext;
use crate::error::UsageError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Checks a finished run
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, context: &WorkloadContext) -> Result<(), ValidationError>;
}

/// What a volume did wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Observed IOPS fell short of the assured minimum
    BelowAssured,
    /// Observed IOPS exceeded the throttle ceiling
    AboveThrottle,
    /// The volume was expected but never measured
    NotMeasured,
}

/// One failed expectation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub volume: String,
    pub kind: ViolationKind,
    pub observed_iops: f64,
    /// Limit the observation was compared against (0 for `NotMeasured`)
    pub limit: u64,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ViolationKind::BelowAssured => write!(
                f,
                "{}: {:.1} IOPS is below the assured {}",
                self.volume, self.observed_iops, self.limit
            ),
            ViolationKind::AboveThrottle => write!(
                f,
                "{}: {:.1} IOPS exceeds the throttle {}",
                self.volume, self.observed_iops, self.limit
            ),
            ViolationKind::NotMeasured => write!(f, "{}: never measured", self.volume),
        }
    }
}

/// Validation outcome other than success
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{validator}: {} violation(s): {}", .violations.len(), list(.violations))]
    Violations {
        validator: String,
        violations: Vec<Violation>,
    },

    #[error("{validator}: cannot validate: {reason}")]
    MissingData { validator: String, reason: String },
}

impl ValidationError {
    pub fn violations(&self) -> &[Violation] {
        match self {
            ValidationError::Violations { violations, .. } => violations,
            ValidationError::MissingData { .. } => &[],
        }
    }
}

fn list(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Checks observed IOPS against each volume's assured and throttle settings
///
/// `tolerance` is a fraction: with 0.1 a volume passes when it reaches 90% of
/// its assured rate and stays under 110% of its throttle.
#[derive(Debug, Clone)]
pub struct QosValidator {
    tolerance: f64,
    volumes: Vec<String>,
}

impl QosValidator {
    pub const DEFAULT_TOLERANCE: f64 = 0.1;

    /// Validate every volume whose window was opened
    ///
    /// # Errors
    ///
    /// Returns a usage error unless `0 <= tolerance < 1`.
    pub fn new(tolerance: f64) -> Result<Self, UsageError> {
        if !(0.0..1.0).contains(&tolerance) {
            return Err(UsageError::invalid(
                "tolerance",
                format!("{} is outside [0, 1)", tolerance),
            ));
        }
        Ok(Self {
            tolerance,
            volumes: Vec::new(),
        })
    }

    /// Require these volumes to have been measured
    pub fn for_volumes<I, S>(mut self, volumes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.volumes = volumes.into_iter().map(Into::into).collect();
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    fn check(&self, name: &str, stats: &VolumeStats, violations: &mut Vec<Violation>) {
        let observed_iops = stats.performance.observed_iops();
        let qos = &stats.settings;

        if qos.assured_iops > 0 && observed_iops < qos.assured_iops as f64 * (1.0 - self.tolerance) {
            violations.push(Violation {
                volume: name.to_string(),
                kind: ViolationKind::BelowAssured,
                observed_iops,
                limit: qos.assured_iops,
            });
        }
        if qos.is_throttled() && observed_iops > qos.throttle_iops as f64 * (1.0 + self.tolerance) {
            violations.push(Violation {
                volume: name.to_string(),
                kind: ViolationKind::AboveThrottle,
                observed_iops,
                limit: qos.throttle_iops,
            });
        }
    }
}

impl Default for QosValidator {
    fn default() -> Self {
        Self {
            tolerance: Self::DEFAULT_TOLERANCE,
            volumes: Vec::new(),
        }
    }
}

impl Validator for QosValidator {
    fn name(&self) -> &str {
        "qos"
    }

    fn validate(&self, context: &WorkloadContext) -> Result<(), ValidationError> {
        if context.qos().is_none() {
            return Err(ValidationError::MissingData {
                validator: self.name().to_string(),
                reason: "the context does not track QoS".to_string(),
            });
        }

        let tracked = context.all_stats();
        let mut violations = Vec::new();

        if self.volumes.is_empty() {
            for (name, stats) in &tracked {
                if !stats.performance.elapsed().is_zero() {
                    self.check(name, stats, &mut violations);
                }
            }
        } else {
            for name in &self.volumes {
                match tracked.get(name) {
                    Some(stats) if !stats.performance.elapsed().is_zero() => {
                        self.check(name, stats, &mut violations);
                    }
                    _ => violations.push(Violation {
                        volume: name.clone(),
                        kind: ViolationKind::NotMeasured,
                        observed_iops: 0.0,
                        limit: 0,
                    }),
                }
            }
        }

        if violations.is_empty() {
            tracing::info!(validator = self.name(), volumes = tracked.len(), "validation passed");
            Ok(())
        } else {
            Err(ValidationError::Violations {
                validator: self.name().to_string(),
                violations,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::events::{OperationExecuted, VolumeAdded, VolumeStarted, VolumeStopped};
    use crate::operation::ObjectOp;
    use crate::volume::{Priority, QosSettings, Volume};
    use std::thread;
    use std::time::Duration;

    fn measured_context(volume: &str, qos: QosSettings, cost: u64) -> WorkloadContext {
        let context = WorkloadContext::with_qos();
        context.set_up().unwrap();
        context.send(VolumeAdded {
            volume: Volume::new(volume, qos),
        });
        context.send(VolumeStarted::new(volume));
        context.send(OperationExecuted {
            operation: ObjectOp::put("b", "k", 1).charged_to(volume, cost).into(),
            latency: Duration::from_micros(10),
        });
        thread::sleep(Duration::from_millis(100));
        context.send(VolumeStopped::new(volume));
        context
    }

    #[test]
    fn test_rejects_bad_tolerance() {
        assert!(QosValidator::new(1.0).is_err());
        assert!(QosValidator::new(-0.1).is_err());
        assert!(QosValidator::new(0.0).is_ok());
    }

    #[test]
    fn test_below_assured_is_reported() {
        // 1 I/O in ~100ms is ~10 IOPS, far below 1000
        let qos = QosSettings::new(1000, 0, Priority::Normal).unwrap();
        let context = measured_context("vol", qos, 1);

        let err = QosValidator::default().validate(&context).unwrap_err();
        let violations = err.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::BelowAssured);
        assert_eq!(violations[0].limit, 1000);
    }

    #[test]
    fn test_above_throttle_is_reported() {
        // 10000 I/Os in at most a few hundred ms is well above 100 IOPS
        let qos = QosSettings::new(0, 100, Priority::Normal).unwrap();
        let context = measured_context("vol", qos, 10_000);

        let err = QosValidator::default().validate(&context).unwrap_err();
        assert_eq!(err.violations()[0].kind, ViolationKind::AboveThrottle);
    }

    #[test]
    fn test_within_limits_passes() {
        let qos = QosSettings::new(1, 0, Priority::Normal).unwrap();
        let context = measured_context("vol", qos, 50);
        QosValidator::default().validate(&context).unwrap();
    }

    #[test]
    fn test_listed_volume_must_be_measured() {
        let context = measured_context("vol", QosSettings::unmanaged(), 1);
        let err = QosValidator::default()
            .for_volumes(["vol", "ghost"])
            .validate(&context)
            .unwrap_err();

        assert_eq!(err.violations().len(), 1);
        assert_eq!(err.violations()[0].volume, "ghost");
        assert_eq!(err.violations()[0].kind, ViolationKind::NotMeasured);
    }

    #[test]
    fn test_requires_qos_tracking() {
        let context = WorkloadContext::new();
        assert!(matches!(
            QosValidator::default().validate(&context),
            Err(ValidationError::MissingData { .. })
        ));
    }
}

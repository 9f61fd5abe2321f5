//! Volume and QoS descriptors
//!
//! A volume is the logical resource QoS is enforced on. Object-store buckets
//! are placed on a volume, and every charged object operation counts against
//! the volume's IOPS budget.

use crate::error::UsageError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling priority of a volume relative to its neighbours
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Quality-of-service settings of a volume
///
/// `assured_iops` is the minimum rate the cluster promises; `throttle_iops`
/// is the ceiling it enforces. A value of zero means "not set" for both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosSettings {
    #[serde(default)]
    pub assured_iops: u64,
    #[serde(default)]
    pub throttle_iops: u64,
    #[serde(default)]
    pub priority: Priority,
}

impl QosSettings {
    /// Create validated QoS settings
    pub fn new(assured_iops: u64, throttle_iops: u64, priority: Priority) -> Result<Self, UsageError> {
        let settings = Self {
            assured_iops,
            throttle_iops,
            priority,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Settings with no guarantees and no ceiling
    pub fn unmanaged() -> Self {
        Self::default()
    }

    /// Check that the ceiling (when set) does not undercut the assured rate
    pub fn validate(&self) -> Result<(), UsageError> {
        if self.throttle_iops != 0 && self.throttle_iops < self.assured_iops {
            return Err(UsageError::invalid(
                "throttle_iops",
                format!(
                    "throttle ({}) must be 0 (unlimited) or >= assured ({})",
                    self.throttle_iops, self.assured_iops
                ),
            ));
        }
        Ok(())
    }

    pub fn is_throttled(&self) -> bool {
        self.throttle_iops > 0
    }
}

impl fmt::Display for QosSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let throttle = if self.is_throttled() {
            self.throttle_iops.to_string()
        } else {
            "unlimited".to_string()
        };
        write!(
            f,
            "assured={} throttle={} priority={}",
            self.assured_iops, throttle, self.priority
        )
    }
}

/// Volume descriptor as reported by the management API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub qos: QosSettings,
}

impl Volume {
    pub fn new(name: impl Into<String>, qos: QosSettings) -> Self {
        Self {
            name: name.into(),
            qos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_below_assured_is_rejected() {
        let err = QosSettings::new(500, 100, Priority::Normal).unwrap_err();
        assert!(err.to_string().contains("throttle (100)"));
    }

    #[test]
    fn test_zero_throttle_means_unlimited() {
        let qos = QosSettings::new(500, 0, Priority::High).unwrap();
        assert!(!qos.is_throttled());
        assert_eq!(qos.to_string(), "assured=500 throttle=unlimited priority=high");
    }
}

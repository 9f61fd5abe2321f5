//! QoS fairness workload
//!
//! Creates one volume (with one bucket) per lane and has every lane hammer
//! its own bucket at the same time. Each lane opens its volume's measurement
//! window, issues charged puts for a fixed duration, and closes the window.
//! The suggested [`QosValidator`] then checks that every volume got at least
//! its assured rate and no more than its throttle.
//!
//! # Example
//!
//! ```
//! use iodriver::workload::qos::{QosFairnessParams, QosFairnessWorkload};
//! use iodriver::workload::Workload;
//! use std::time::Duration;
//!
//! let plan = QosFairnessWorkload::new(QosFairnessParams {
//!     volumes: 4,
//!     duration: Duration::from_secs(10),
//!     ..QosFairnessParams::default()
//! })
//! .unwrap();
//! let workload = Workload::new(plan);
//! assert_eq!(workload.ensure_initialized().unwrap().lanes.len(), 4);
//! ```

use super::WorkloadPlan;
use crate::error::{ExecutionResult, UsageError};
use crate::event::events::{VolumeStarted, VolumeStopped};
use crate::operation::{ManagementOp, ObjectOp, Operation};
use crate::validator::{QosValidator, Validator};
use crate::volume::QosSettings;
use std::time::Duration;

/// Key every lane overwrites in its bucket
const OBJECT_KEY: &str = "object";

/// Parameters of a [`QosFairnessWorkload`]
#[derive(Debug, Clone, PartialEq)]
pub struct QosFairnessParams {
    /// Prefix for volume and bucket names
    pub prefix: String,
    /// Number of volumes, and lanes
    pub volumes: usize,
    pub qos: QosSettings,
    /// Length of each lane's measurement window
    pub duration: Duration,
    pub object_size: u64,
    /// Put rate each lane offers; `None` picks the throttle, else the assured
    /// rate, else 1000
    pub offered_iops: Option<u64>,
    /// Fraction of slack the validator allows
    pub tolerance: f64,
}

impl Default for QosFairnessParams {
    fn default() -> Self {
        Self {
            prefix: "qos".to_string(),
            volumes: 2,
            qos: QosSettings {
                assured_iops: 100,
                throttle_iops: 200,
                ..QosSettings::default()
            },
            duration: Duration::from_secs(5),
            object_size: 4096,
            offered_iops: None,
            tolerance: QosValidator::DEFAULT_TOLERANCE,
        }
    }
}

/// Concurrent per-volume put load measured against QoS settings
#[derive(Debug, Clone)]
pub struct QosFairnessWorkload {
    name: String,
    params: QosFairnessParams,
    offered_iops: u64,
}

impl QosFairnessWorkload {
    /// # Errors
    ///
    /// Returns a usage error for zero volumes, a zero duration or object
    /// size, invalid QoS settings, a zero offered rate, or a tolerance
    /// outside `[0, 1)`.
    pub fn new(params: QosFairnessParams) -> Result<Self, UsageError> {
        if params.volumes == 0 {
            return Err(UsageError::invalid("volumes", "must be at least 1"));
        }
        if params.duration.is_zero() {
            return Err(UsageError::invalid("duration", "must be positive"));
        }
        if params.object_size == 0 {
            return Err(UsageError::invalid("object_size", "must be positive"));
        }
        if params.prefix.is_empty() {
            return Err(UsageError::invalid("prefix", "must not be empty"));
        }
        params.qos.validate()?;
        QosValidator::new(params.tolerance)?;

        let offered_iops = match params.offered_iops {
            Some(0) => return Err(UsageError::invalid("offered_iops", "must be positive")),
            Some(rate) => rate,
            None if params.qos.throttle_iops > 0 => params.qos.throttle_iops,
            None if params.qos.assured_iops > 0 => params.qos.assured_iops,
            None => 1000,
        };

        Ok(Self {
            name: format!("{}-fairness", params.prefix),
            params,
            offered_iops,
        })
    }

    pub fn volume_name(&self, index: usize) -> String {
        format!("{}-vol-{}", self.params.prefix, index)
    }

    pub fn bucket_name(&self, index: usize) -> String {
        format!("{}-bucket-{}", self.params.prefix, index)
    }

    pub fn offered_iops(&self) -> u64 {
        self.offered_iops
    }

    fn volume_names(&self) -> Vec<String> {
        (0..self.params.volumes).map(|i| self.volume_name(i)).collect()
    }
}

impl WorkloadPlan for QosFairnessWorkload {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_setup(&self) -> ExecutionResult<Vec<Operation>> {
        let mut operations = Vec::with_capacity(self.params.volumes * 4);
        for i in 0..self.params.volumes {
            let (volume, bucket) = (self.volume_name(i), self.bucket_name(i));
            operations.push(ManagementOp::add_volume(&volume, self.params.qos).into());
            operations.push(ManagementOp::stat_volume(&volume).into());
            operations.push(ObjectOp::create_bucket(&bucket, &volume).into());
            // uncharged, so teardown always has an object to delete
            operations.push(ObjectOp::put(&bucket, OBJECT_KEY, self.params.object_size).into());
        }
        Ok(operations)
    }

    fn create_operations(&self) -> ExecutionResult<Vec<Vec<Operation>>> {
        Ok((0..self.params.volumes)
            .map(|i| {
                let (volume, bucket) = (self.volume_name(i), self.bucket_name(i));
                let put = ObjectOp::put(&bucket, OBJECT_KEY, self.params.object_size)
                    .charged(&volume)
                    .into();
                vec![
                    Operation::fire(VolumeStarted::new(&volume)),
                    Operation::repeat_for(put, self.params.duration).paced(self.offered_iops),
                    Operation::fire(VolumeStopped::new(&volume)),
                ]
            })
            .collect())
    }

    fn create_teardown(&self) -> ExecutionResult<Vec<Operation>> {
        let mut operations = Vec::with_capacity(self.params.volumes * 3);
        for i in 0..self.params.volumes {
            let (volume, bucket) = (self.volume_name(i), self.bucket_name(i));
            operations.push(ObjectOp::delete(&bucket, OBJECT_KEY).into());
            operations.push(ObjectOp::delete_bucket(&bucket).into());
            operations.push(ManagementOp::delete_volume(&volume).into());
        }
        Ok(operations)
    }

    fn validator(&self) -> Option<Box<dyn Validator>> {
        let validator = QosValidator::new(self.params.tolerance).ok()?;
        Some(Box::new(validator.for_volumes(self.volume_names())))
    }
}

//! Object churn workload
//!
//! Every lane writes a batch of objects with log-normally distributed sizes,
//! reads them all back, then deletes them. Sizes are drawn from a seeded RNG
//! when the sequences are built, so a run is reproducible from its seed.
//!
//! Each object operation is charged against the workload's volume at one I/O
//! per started 4 KiB block, so churn can be measured by the QoS tracker like
//! any other load.

use super::WorkloadPlan;
use crate::error::{ExecutionResult, UsageError};
use crate::event::events::{VolumeStarted, VolumeStopped};
use crate::operation::{ObjectOp, Operation};
use rand::SeedableRng;
use rand_distr::{Distribution, LogNormal};
use rand_xoshiro::Xoshiro256PlusPlus;

/// z-score of the 99th percentile of a standard normal
const Z_P99: f64 = 2.3263;

/// Bytes covered by one charged I/O
const CHARGE_BLOCK: u64 = 4096;

/// Parameters of an [`ObjectChurnWorkload`]
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectChurnParams {
    pub prefix: String,
    pub lanes: usize,
    pub objects_per_lane: usize,
    /// Median object size in bytes
    pub p50_size: u64,
    /// 99th percentile object size in bytes
    pub p99_size: u64,
    /// RNG seed; `None` picks one at construction
    pub seed: Option<u64>,
}

impl Default for ObjectChurnParams {
    fn default() -> Self {
        Self {
            prefix: "churn".to_string(),
            lanes: 4,
            objects_per_lane: 100,
            p50_size: 16 * 1024,
            p99_size: 1024 * 1024,
            seed: None,
        }
    }
}

/// Write, read back and delete objects of realistic sizes
#[derive(Debug, Clone)]
pub struct ObjectChurnWorkload {
    name: String,
    params: ObjectChurnParams,
    seed: u64,
    sizes: LogNormal<f64>,
}

impl ObjectChurnWorkload {
    /// # Errors
    ///
    /// Returns a usage error for zero lanes or objects, a zero median size,
    /// or a p99 below the median.
    pub fn new(params: ObjectChurnParams) -> Result<Self, UsageError> {
        if params.lanes == 0 {
            return Err(UsageError::invalid("lanes", "must be at least 1"));
        }
        if params.objects_per_lane == 0 {
            return Err(UsageError::invalid("objects_per_lane", "must be at least 1"));
        }
        if params.p50_size == 0 {
            return Err(UsageError::invalid("p50_size", "must be positive"));
        }
        if params.p99_size < params.p50_size {
            return Err(UsageError::invalid(
                "p99_size",
                format!("{} is below the median {}", params.p99_size, params.p50_size),
            ));
        }

        let mu = (params.p50_size as f64).ln();
        let sigma = ((params.p99_size as f64).ln() - mu) / Z_P99;
        let sizes = LogNormal::new(mu, sigma)
            .map_err(|e| UsageError::invalid("p99_size", e.to_string()))?;

        Ok(Self {
            name: format!("{}-churn", params.prefix),
            seed: params.seed.unwrap_or_else(rand::random),
            params,
            sizes,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn bucket_name(&self) -> String {
        format!("{}-bucket", self.params.prefix)
    }

    pub fn volume_name(&self) -> String {
        format!("{}-vol", self.params.prefix)
    }
}

impl WorkloadPlan for ObjectChurnWorkload {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_setup(&self) -> ExecutionResult<Vec<Operation>> {
        Ok(vec![
            ObjectOp::create_bucket(self.bucket_name(), self.volume_name()).into(),
            Operation::fire(VolumeStarted::new(self.volume_name())),
        ])
    }

    fn create_operations(&self) -> ExecutionResult<Vec<Vec<Operation>>> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed);
        let (bucket, volume) = (self.bucket_name(), self.volume_name());

        Ok((0..self.params.lanes)
            .map(|lane| {
                let objects: Vec<(String, u64)> = (0..self.params.objects_per_lane)
                    .map(|i| {
                        let size = (self.sizes.sample(&mut rng) as u64).max(1);
                        (format!("lane{}-obj{}", lane, i), size)
                    })
                    .collect();

                let mut operations = Vec::with_capacity(objects.len() * 3);
                for (key, size) in &objects {
                    let cost = size.div_ceil(CHARGE_BLOCK);
                    operations.push(ObjectOp::put(&bucket, key, *size).charged_to(&volume, cost).into());
                }
                for (key, size) in &objects {
                    let cost = size.div_ceil(CHARGE_BLOCK);
                    operations.push(ObjectOp::get(&bucket, key).charged_to(&volume, cost).into());
                }
                for (key, _) in &objects {
                    operations.push(ObjectOp::delete(&bucket, key).charged(&volume).into());
                }
                operations
            })
            .collect())
    }

    fn create_teardown(&self) -> ExecutionResult<Vec<Operation>> {
        Ok(vec![
            Operation::fire(VolumeStopped::new(self.volume_name())),
            ObjectOp::delete_bucket(self.bucket_name()).into(),
        ])
    }
}

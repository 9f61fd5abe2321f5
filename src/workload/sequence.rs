//! Workload built from explicit operation lists

use super::WorkloadPlan;
use crate::error::ExecutionResult;
use crate::operation::Operation;
use crate::validator::Validator;
use std::sync::Arc;

type ValidatorFactory = Arc<dyn Fn() -> Box<dyn Validator> + Send + Sync>;

/// Plan whose sequences are given up front
///
/// # Example
///
/// ```
/// use iodriver::operation::ObjectOp;
/// use iodriver::workload::{sequence::SequenceWorkload, Workload};
///
/// let workload = Workload::new(
///     SequenceWorkload::builder("smoke")
///         .setup(vec![ObjectOp::create_bucket("b", "vol").into()])
///         .lane(vec![ObjectOp::put("b", "one", 1024).into()])
///         .lane(vec![ObjectOp::put("b", "two", 1024).into()])
///         .teardown(vec![ObjectOp::delete("b", "one").into()])
///         .build(),
/// );
/// assert_eq!(workload.ensure_initialized().unwrap().lanes.len(), 2);
/// ```
pub struct SequenceWorkload {
    name: String,
    setup: Vec<Operation>,
    lanes: Vec<Vec<Operation>>,
    teardown: Vec<Operation>,
    validator: Option<ValidatorFactory>,
}

impl SequenceWorkload {
    pub fn builder(name: impl Into<String>) -> SequenceWorkloadBuilder {
        SequenceWorkloadBuilder {
            workload: SequenceWorkload {
                name: name.into(),
                setup: Vec::new(),
                lanes: Vec::new(),
                teardown: Vec::new(),
                validator: None,
            },
        }
    }
}

pub struct SequenceWorkloadBuilder {
    workload: SequenceWorkload,
}

impl SequenceWorkloadBuilder {
    pub fn setup(mut self, operations: Vec<Operation>) -> Self {
        self.workload.setup.extend(operations);
        self
    }

    /// Add one body lane
    pub fn lane(mut self, operations: Vec<Operation>) -> Self {
        self.workload.lanes.push(operations);
        self
    }

    pub fn teardown(mut self, operations: Vec<Operation>) -> Self {
        self.workload.teardown.extend(operations);
        self
    }

    /// Suggest a validator; `factory` runs each time the driver asks for one
    pub fn validator<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Validator> + Send + Sync + 'static,
    {
        self.workload.validator = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> SequenceWorkload {
        self.workload
    }
}

impl WorkloadPlan for SequenceWorkload {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_setup(&self) -> ExecutionResult<Vec<Operation>> {
        Ok(self.setup.clone())
    }

    fn create_operations(&self) -> ExecutionResult<Vec<Vec<Operation>>> {
        Ok(self.lanes.clone())
    }

    fn create_teardown(&self) -> ExecutionResult<Vec<Operation>> {
        Ok(self.teardown.clone())
    }

    fn validator(&self) -> Option<Box<dyn Validator>> {
        self.validator.as_ref().map(|factory| factory())
    }
}

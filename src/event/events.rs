//! Events published during a workload run

use super::Event;
use crate::error::Phase;
use crate::operation::Operation;
use crate::volume::Volume;
use std::time::{Duration, Instant};

/// A volume was created by the management API
#[derive(Debug, Clone)]
pub struct VolumeAdded {
    pub volume: Volume,
}

/// The management API reported the current settings of a volume
#[derive(Debug, Clone)]
pub struct VolumeStatted {
    pub volume: Volume,
}

/// A volume was modified; `previous_name` differs from `volume.name` on rename
#[derive(Debug, Clone)]
pub struct VolumeModified {
    pub previous_name: String,
    pub volume: Volume,
}

/// A volume was deleted
#[derive(Debug, Clone)]
pub struct VolumeRemoved {
    pub name: String,
}

/// Opens the measurement window of a volume
#[derive(Debug, Clone)]
pub struct VolumeStarted {
    pub name: String,
}

impl VolumeStarted {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Closes the measurement window of a volume
#[derive(Debug, Clone)]
pub struct VolumeStopped {
    pub name: String,
}

impl VolumeStopped {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// An object operation completed successfully against an endpoint
#[derive(Debug, Clone)]
pub struct OperationExecuted {
    pub operation: Operation,
    pub latency: Duration,
}

/// A workload phase is about to run
#[derive(Debug, Clone)]
pub struct PhaseStarted {
    pub workload: String,
    pub phase: Phase,
    pub lanes: usize,
}

/// A workload phase finished
#[derive(Debug, Clone)]
pub struct PhaseFinished {
    pub workload: String,
    pub phase: Phase,
    pub elapsed: Duration,
    pub succeeded: bool,
}

/// A body lane reached the rendezvous
#[derive(Debug, Clone)]
pub struct LaneArrived {
    pub workload: String,
    pub lane: usize,
    pub at: Instant,
}

/// A body lane was released from the rendezvous and starts its sequence
#[derive(Debug, Clone)]
pub struct LaneReleased {
    pub workload: String,
    pub lane: usize,
    pub at: Instant,
}

impl Event for VolumeAdded {}
impl Event for VolumeStatted {}
impl Event for VolumeModified {}
impl Event for VolumeRemoved {}
impl Event for VolumeStarted {}
impl Event for VolumeStopped {}
impl Event for OperationExecuted {}
impl Event for PhaseStarted {}
impl Event for PhaseFinished {}
impl Event for LaneArrived {}
impl Event for LaneReleased {}

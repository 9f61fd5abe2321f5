//! Operations: the units of work a workload is made of
//!
//! An [`Operation`] is an immutable value built once when a workload
//! initializes its sequences and possibly executed many times afterwards
//! (repeat loops, several runs of the same workload).
//!
//! # Operation families
//!
//! - **Object store**: bucket and object I/O ([`ObjectOp`]); needs the
//!   object-store capability
//! - **Management**: volume administration ([`ManagementOp`]); needs the
//!   management capability
//! - **Control**: nested workloads, rendezvous waits, event firing, repeat
//!   loops and pauses; run by the core against any endpoint
//!
//! Endpoints dispatch on the variant (see [`crate::endpoint`]). An endpoint
//! that lacks the capability an operation needs rejects it with an
//! unsupported-operation error naming that capability.
//!
//! # Example
//!
//! ```
//! use iodriver::operation::{ObjectOp, Operation};
//! use std::time::Duration;
//!
//! let put: Operation = ObjectOp::put("bucket-0", "object-1", 4096)
//!     .charged_to("vol-0", 1)
//!     .into();
//! assert_eq!(put.charge().map(|c| c.cost), Some(1));
//!
//! let loop_for_ten_seconds = Operation::repeat_for(put, Duration::from_secs(10)).paced(200);
//! println!("{}", loop_for_ten_seconds);
//! ```

pub mod barrier;

use crate::context::WorkloadContext;
use crate::endpoint::Endpoint;
use crate::error::{Capability, ExecutionResult};
use crate::event::{Envelope, Event, EventBus};
use crate::volume::QosSettings;
use crate::workload::Workload;
use barrier::Rendezvous;
use std::any::{type_name, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cost of a charged operation unless one is given
pub const DEFAULT_IO_COST: u64 = 1;

/// Cost an object operation charges against a volume's IOPS budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCharge {
    pub volume: String,
    pub cost: u64,
}

/// Bucket/object action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectAction {
    CreateBucket { bucket: String, volume: String },
    DeleteBucket { bucket: String },
    Put { bucket: String, key: String, size: u64 },
    Get { bucket: String, key: String },
    Delete { bucket: String, key: String },
}

/// Object-store operation with an optional I/O charge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectOp {
    pub action: ObjectAction,
    pub charge: Option<IoCharge>,
}

impl ObjectOp {
    fn new(action: ObjectAction) -> Self {
        Self { action, charge: None }
    }

    pub fn create_bucket(bucket: impl Into<String>, volume: impl Into<String>) -> Self {
        Self::new(ObjectAction::CreateBucket {
            bucket: bucket.into(),
            volume: volume.into(),
        })
    }

    pub fn delete_bucket(bucket: impl Into<String>) -> Self {
        Self::new(ObjectAction::DeleteBucket { bucket: bucket.into() })
    }

    pub fn put(bucket: impl Into<String>, key: impl Into<String>, size: u64) -> Self {
        Self::new(ObjectAction::Put {
            bucket: bucket.into(),
            key: key.into(),
            size,
        })
    }

    pub fn get(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ObjectAction::Get {
            bucket: bucket.into(),
            key: key.into(),
        })
    }

    pub fn delete(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ObjectAction::Delete {
            bucket: bucket.into(),
            key: key.into(),
        })
    }

    /// Charge one I/O against `volume` whenever this operation succeeds
    ///
    /// Object operations are uncharged until a volume is named, since a
    /// bucket alone does not say which volume's budget it draws on.
    pub fn charged(self, volume: impl Into<String>) -> Self {
        self.charged_to(volume, DEFAULT_IO_COST)
    }

    /// Charge `cost` I/Os against `volume` whenever this operation succeeds
    pub fn charged_to(mut self, volume: impl Into<String>, cost: u64) -> Self {
        self.charge = Some(IoCharge {
            volume: volume.into(),
            cost,
        });
        self
    }

    pub fn bucket(&self) -> &str {
        match &self.action {
            ObjectAction::CreateBucket { bucket, .. }
            | ObjectAction::DeleteBucket { bucket }
            | ObjectAction::Put { bucket, .. }
            | ObjectAction::Get { bucket, .. }
            | ObjectAction::Delete { bucket, .. } => bucket,
        }
    }
}

impl fmt::Display for ObjectOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            ObjectAction::CreateBucket { bucket, volume } => {
                write!(f, "create bucket {} on {}", bucket, volume)
            }
            ObjectAction::DeleteBucket { bucket } => write!(f, "delete bucket {}", bucket),
            ObjectAction::Put { bucket, key, size } => {
                write!(f, "put {}/{} ({} bytes)", bucket, key, size)
            }
            ObjectAction::Get { bucket, key } => write!(f, "get {}/{}", bucket, key),
            ObjectAction::Delete { bucket, key } => write!(f, "delete {}/{}", bucket, key),
        }
    }
}

/// Volume administration operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementOp {
    AddVolume {
        name: String,
        qos: QosSettings,
    },
    StatVolume {
        name: String,
    },
    ModifyVolume {
        name: String,
        new_name: Option<String>,
        qos: Option<QosSettings>,
    },
    DeleteVolume {
        name: String,
    },
}

impl ManagementOp {
    pub fn add_volume(name: impl Into<String>, qos: QosSettings) -> Self {
        ManagementOp::AddVolume { name: name.into(), qos }
    }

    pub fn stat_volume(name: impl Into<String>) -> Self {
        ManagementOp::StatVolume { name: name.into() }
    }

    pub fn rename_volume(name: impl Into<String>, new_name: impl Into<String>) -> Self {
        ManagementOp::ModifyVolume {
            name: name.into(),
            new_name: Some(new_name.into()),
            qos: None,
        }
    }

    pub fn set_qos(name: impl Into<String>, qos: QosSettings) -> Self {
        ManagementOp::ModifyVolume {
            name: name.into(),
            new_name: None,
            qos: Some(qos),
        }
    }

    pub fn delete_volume(name: impl Into<String>) -> Self {
        ManagementOp::DeleteVolume { name: name.into() }
    }
}

impl fmt::Display for ManagementOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagementOp::AddVolume { name, qos } => write!(f, "add volume {} ({})", name, qos),
            ManagementOp::StatVolume { name } => write!(f, "stat volume {}", name),
            ManagementOp::ModifyVolume { name, new_name, qos } => {
                write!(f, "modify volume {}", name)?;
                if let Some(new_name) = new_name {
                    write!(f, " -> {}", new_name)?;
                }
                if let Some(qos) = qos {
                    write!(f, " ({})", qos)?;
                }
                Ok(())
            }
            ManagementOp::DeleteVolume { name } => write!(f, "delete volume {}", name),
        }
    }
}

/// Type-erased event carried by a fire-event operation
pub trait Publish: Send + Sync + fmt::Debug {
    fn event_type(&self) -> TypeId;
    fn event_name(&self) -> &'static str;
    /// Publish the event, returning how many listeners received it
    fn publish(&self, bus: &EventBus) -> usize;
}

#[derive(Debug)]
struct FireEvent<E>(Arc<E>);

impl<E: Event> Publish for FireEvent<E> {
    fn event_type(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn event_name(&self) -> &'static str {
        type_name::<E>()
    }

    fn publish(&self, bus: &EventBus) -> usize {
        bus.send_envelope(&Envelope::shared(Arc::clone(&self.0)))
    }
}

/// How long a repeat loop runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatLimit {
    Times(u64),
    For(Duration),
}

/// Repeatedly executes one operation, optionally at a fixed pace
#[derive(Debug, Clone)]
pub struct Repeat {
    pub operation: Box<Operation>,
    pub limit: RepeatLimit,
    /// Interval between iteration starts; `None` runs back to back
    pub pace: Option<Duration>,
}

/// A unit of work
#[derive(Debug, Clone)]
pub enum Operation {
    ObjectStore(ObjectOp),
    Management(ManagementOp),
    /// Run a nested workload (set_up, run_on, tear_down) on the same endpoint
    Nested(Arc<Workload>),
    /// Block until every party of the rendezvous arrives
    Barrier(Arc<Rendezvous>),
    /// Publish an event if anyone listens for its type
    Fire(Arc<dyn Publish>),
    Repeat(Repeat),
    Pause(Duration),
}

impl Operation {
    pub fn nested(workload: Arc<Workload>) -> Self {
        Operation::Nested(workload)
    }

    pub fn barrier(rendezvous: Arc<Rendezvous>) -> Self {
        Operation::Barrier(rendezvous)
    }

    pub fn fire<E: Event>(event: E) -> Self {
        Operation::Fire(Arc::new(FireEvent(Arc::new(event))))
    }

    pub fn repeat(operation: Operation, times: u64) -> Self {
        Operation::Repeat(Repeat {
            operation: Box::new(operation),
            limit: RepeatLimit::Times(times),
            pace: None,
        })
    }

    pub fn repeat_for(operation: Operation, duration: Duration) -> Self {
        Operation::Repeat(Repeat {
            operation: Box::new(operation),
            limit: RepeatLimit::For(duration),
            pace: None,
        })
    }

    pub fn pause(duration: Duration) -> Self {
        Operation::Pause(duration)
    }

    /// Pace a repeat loop at `per_second` iterations per second
    ///
    /// Has no effect on other variants or when `per_second` is zero.
    pub fn paced(self, per_second: u64) -> Self {
        match self {
            Operation::Repeat(mut repeat) if per_second > 0 => {
                repeat.pace = Some(Duration::from_secs(1) / per_second.min(u32::MAX as u64) as u32);
                Operation::Repeat(repeat)
            }
            other => other,
        }
    }

    /// Endpoint capability needed to execute this operation, if any
    pub fn capability(&self) -> Option<Capability> {
        match self {
            Operation::ObjectStore(_) => Some(Capability::ObjectStore),
            Operation::Management(_) => Some(Capability::Management),
            _ => None,
        }
    }

    /// I/O charge carried by an object operation
    pub fn charge(&self) -> Option<&IoCharge> {
        match self {
            Operation::ObjectStore(op) => op.charge.as_ref(),
            _ => None,
        }
    }

    /// Execute against `endpoint`, reporting through `context`
    pub fn execute(&self, endpoint: &dyn Endpoint, context: &WorkloadContext) -> ExecutionResult<()> {
        endpoint.visit(self, context)
    }

    /// Run a control operation; endpoint capabilities are not involved
    pub(crate) fn run_control(
        &self,
        endpoint: &dyn Endpoint,
        context: &WorkloadContext,
    ) -> ExecutionResult<()> {
        match self {
            Operation::Nested(workload) => {
                if let Err(err) = workload.set_up(endpoint, context) {
                    if let Err(cleanup) = workload.clean_up(endpoint, context) {
                        tracing::warn!(workload = workload.name(), error = %cleanup, "cleanup after failed setup");
                    }
                    return Err(err);
                }
                let body = workload.run_on(endpoint, context);
                let teardown = workload.tear_down(endpoint, context);
                body.and(teardown)
            }
            Operation::Barrier(rendezvous) => rendezvous.wait().map(|_| ()),
            Operation::Fire(event) => {
                if context.bus().has_listeners_for(event.event_type()) {
                    event.publish(context.bus());
                } else {
                    tracing::trace!(event = event.event_name(), "no listener registered; not firing");
                }
                Ok(())
            }
            Operation::Repeat(repeat) => repeat.run(endpoint, context),
            Operation::Pause(duration) => {
                std::thread::sleep(*duration);
                Ok(())
            }
            Operation::ObjectStore(_) | Operation::Management(_) => endpoint.visit(self, context),
        }
    }
}

impl Repeat {
    fn run(&self, endpoint: &dyn Endpoint, context: &WorkloadContext) -> ExecutionResult<()> {
        let start = Instant::now();
        let mut iteration: u64 = 0;

        loop {
            match self.limit {
                RepeatLimit::Times(times) if iteration >= times => break,
                RepeatLimit::For(duration) if start.elapsed() >= duration => break,
                _ => {}
            }

            // Absolute schedule: a slow iteration does not push back later ones.
            if let Some(pace) = self.pace {
                let due = start + pace.saturating_mul(iteration.min(u32::MAX as u64) as u32);
                let now = Instant::now();
                if due > now {
                    std::thread::sleep(due - now);
                }
            }

            endpoint.visit(&self.operation, context)?;
            iteration += 1;
        }

        tracing::debug!(iterations = iteration, operation = %self.operation, "repeat finished");
        Ok(())
    }
}

impl From<ObjectOp> for Operation {
    fn from(op: ObjectOp) -> Self {
        Operation::ObjectStore(op)
    }
}

impl From<ManagementOp> for Operation {
    fn from(op: ManagementOp) -> Self {
        Operation::Management(op)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::ObjectStore(op) => write!(f, "{}", op),
            Operation::Management(op) => write!(f, "{}", op),
            Operation::Nested(workload) => write!(f, "workload '{}'", workload.name()),
            Operation::Barrier(rendezvous) => write!(f, "rendezvous of {}", rendezvous.parties()),
            Operation::Fire(event) => write!(f, "fire {}", short_type_name(event.event_name())),
            Operation::Repeat(repeat) => {
                match repeat.limit {
                    RepeatLimit::Times(times) => write!(f, "repeat x{} [{}]", times, repeat.operation)?,
                    RepeatLimit::For(duration) => {
                        write!(f, "repeat for {:?} [{}]", duration, repeat.operation)?
                    }
                }
                if let Some(pace) = repeat.pace {
                    write!(f, " every {:?}", pace)?;
                }
                Ok(())
            }
            Operation::Pause(duration) => write!(f, "pause {:?}", duration),
        }
    }
}

fn short_type_name(name: &str) -> &str {
    name.rsplit("::").next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::memory::MemoryEndpoint;
    use crate::event::events::VolumeStarted;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_display_names_the_work() {
        let put: Operation = ObjectOp::put("b", "k", 10).into();
        assert_eq!(put.to_string(), "put b/k (10 bytes)");

        let rename: Operation = ManagementOp::rename_volume("a", "b").into();
        assert_eq!(rename.to_string(), "modify volume a -> b");

        let fire = Operation::fire(VolumeStarted::new("vol"));
        assert_eq!(fire.to_string(), "fire VolumeStarted");

        let repeat = Operation::repeat(put, 3);
        assert_eq!(repeat.to_string(), "repeat x3 [put b/k (10 bytes)]");
    }

    #[test]
    fn test_capability_and_charge() {
        let get: Operation = ObjectOp::get("b", "k").charged_to("vol", 2).into();
        assert_eq!(get.capability(), Some(Capability::ObjectStore));
        assert_eq!(
            get.charge(),
            Some(&IoCharge {
                volume: "vol".to_string(),
                cost: 2
            })
        );

        let put: Operation = ObjectOp::put("b", "k", 1).into();
        assert!(put.charge().is_none());
        let put: Operation = ObjectOp::put("b", "k", 1).charged("vol").into();
        assert_eq!(put.charge().map(|charge| charge.cost), Some(DEFAULT_IO_COST));

        let stat: Operation = ManagementOp::stat_volume("vol").into();
        assert_eq!(stat.capability(), Some(Capability::Management));
        assert!(stat.charge().is_none());
        assert!(Operation::pause(Duration::ZERO).capability().is_none());
    }

    #[test]
    fn test_fire_without_listener_is_noop() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::new();
        let fire = Operation::fire(VolumeStarted::new("vol"));
        fire.execute(&endpoint, &context).unwrap();
    }

    #[test]
    fn test_fire_with_listener_publishes() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let seen = Arc::clone(&seen);
            context.bus().register(move |event: &Envelope<VolumeStarted>| {
                assert_eq!(event.name, "vol");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        let fire = Operation::fire(VolumeStarted::new("vol"));
        fire.execute(&endpoint, &context).unwrap();
        fire.execute(&endpoint, &context).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_repeat_times_executes_exactly_n() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::new();
        endpoint.seed_bucket("b");

        let repeat = Operation::repeat(ObjectOp::put("b", "k", 1).into(), 5);
        repeat.execute(&endpoint, &context).unwrap();
        assert_eq!(endpoint.executed_count(), 5);
    }

    #[test]
    fn test_paced_repeat_respects_duration() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::new();
        endpoint.seed_bucket("b");

        let repeat = Operation::repeat_for(ObjectOp::put("b", "k", 1).into(), Duration::from_millis(100))
            .paced(100);
        let start = Instant::now();
        repeat.execute(&endpoint, &context).unwrap();

        assert!(start.elapsed() >= Duration::from_millis(100));
        let executed = endpoint.executed_count();
        assert!((5..=12).contains(&executed), "executed {}", executed);
    }

    #[test]
    fn test_repeat_stops_at_first_failure() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::new();

        let repeat = Operation::repeat(ObjectOp::get("missing", "k").into(), 5);
        assert!(repeat.execute(&endpoint, &context).is_err());
        assert_eq!(endpoint.executed_count(), 0);
    }
}

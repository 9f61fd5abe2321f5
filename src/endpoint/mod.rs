//! Endpoint abstraction
//!
//! An endpoint is the execution target of a workload: a long-lived session
//! with a storage cluster, injected by the driver and shared by all lanes.
//! It exposes its capabilities as an explicit table; each capability is a
//! trait object the dispatcher calls into.
//!
//! # Capabilities
//!
//! - [`ObjectStore`]: bucket and object I/O
//! - [`ManagementApi`]: volume administration
//!
//! # Dispatch
//!
//! [`visit`](trait.Endpoint.html#method.visit) matches on the operation
//! variant. Object and management operations go to the matching capability;
//! if the endpoint does not provide it the operation fails with
//! [`ExecutionError::Unsupported`]. Control operations (nested workloads,
//! rendezvous, events, loops) are run by the core itself.
//!
//! Every call completes synchronously on the calling thread, and every
//! endpoint failure is returned to the caller. After a successful call the
//! dispatcher reports the outcome on the context's event bus:
//!
//! - object operations publish `OperationExecuted` (with latency)
//! - management operations publish `VolumeAdded`, `VolumeStatted`,
//!   `VolumeModified` or `VolumeRemoved`

pub mod memory;

use crate::context::WorkloadContext;
use crate::error::{Capability, ExecutionError, ExecutionResult};
use crate::event::events::{
    OperationExecuted, VolumeAdded, VolumeModified, VolumeRemoved, VolumeStatted,
};
use crate::operation::{ManagementOp, ObjectAction, ObjectOp, Operation};
use crate::volume::{QosSettings, Volume};
use std::time::Instant;

/// Bucket and object I/O
pub trait ObjectStore: Send + Sync {
    fn create_bucket(&self, bucket: &str, volume: &str) -> ExecutionResult<()>;
    fn delete_bucket(&self, bucket: &str) -> ExecutionResult<()>;
    fn put_object(&self, bucket: &str, key: &str, size: u64) -> ExecutionResult<()>;
    /// Read an object, returning its size
    fn get_object(&self, bucket: &str, key: &str) -> ExecutionResult<u64>;
    fn delete_object(&self, bucket: &str, key: &str) -> ExecutionResult<()>;
}

/// Volume administration
pub trait ManagementApi: Send + Sync {
    fn add_volume(&self, name: &str, qos: &QosSettings) -> ExecutionResult<Volume>;
    fn stat_volume(&self, name: &str) -> ExecutionResult<Volume>;
    fn modify_volume(
        &self,
        name: &str,
        new_name: Option<&str>,
        qos: Option<&QosSettings>,
    ) -> ExecutionResult<Volume>;
    fn delete_volume(&self, name: &str) -> ExecutionResult<()>;
}

/// Execution target for operations
///
/// Implementations only declare their identity and capabilities; dispatch is
/// provided by the core.
pub trait Endpoint: Send + Sync {
    /// Name used in logs and error messages
    fn name(&self) -> &str;

    fn object_store(&self) -> Option<&dyn ObjectStore> {
        None
    }

    fn management(&self) -> Option<&dyn ManagementApi> {
        None
    }
}

impl<'a> dyn Endpoint + 'a {
    /// Capabilities this endpoint provides
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut capabilities = Vec::new();
        if self.object_store().is_some() {
            capabilities.push(Capability::ObjectStore);
        }
        if self.management().is_some() {
            capabilities.push(Capability::Management);
        }
        capabilities
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::ObjectStore => self.object_store().is_some(),
            Capability::Management => self.management().is_some(),
        }
    }

    /// Execute `operation`, reporting outcomes to `context`
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` if the operation needs a capability this endpoint
    /// lacks, or whatever error the capability (or control operation) raised.
    pub fn visit(&self, operation: &Operation, context: &WorkloadContext) -> ExecutionResult<()> {
        match operation {
            Operation::ObjectStore(op) => {
                let store = self
                    .object_store()
                    .ok_or_else(|| self.unsupported(operation, Capability::ObjectStore))?;

                let started = Instant::now();
                execute_object(store, op)?;
                let latency = started.elapsed();
                tracing::trace!(endpoint = self.name(), operation = %op, ?latency, "executed");

                if context.bus().has_listeners::<OperationExecuted>() {
                    context.send(OperationExecuted {
                        operation: operation.clone(),
                        latency,
                    });
                }
                Ok(())
            }
            Operation::Management(op) => {
                let api = self
                    .management()
                    .ok_or_else(|| self.unsupported(operation, Capability::Management))?;
                tracing::debug!(endpoint = self.name(), operation = %op, "management call");
                execute_management(api, op, context)
            }
            _ => operation.run_control(self, context),
        }
    }

    fn unsupported(&self, operation: &Operation, capability: Capability) -> ExecutionError {
        ExecutionError::Unsupported {
            operation: operation.to_string(),
            capability,
            endpoint: self.name().to_string(),
        }
    }
}

fn execute_object(store: &dyn ObjectStore, op: &ObjectOp) -> ExecutionResult<()> {
    match &op.action {
        ObjectAction::CreateBucket { bucket, volume } => store.create_bucket(bucket, volume),
        ObjectAction::DeleteBucket { bucket } => store.delete_bucket(bucket),
        ObjectAction::Put { bucket, key, size } => store.put_object(bucket, key, *size),
        ObjectAction::Get { bucket, key } => store.get_object(bucket, key).map(|_| ()),
        ObjectAction::Delete { bucket, key } => store.delete_object(bucket, key),
    }
}

fn execute_management(
    api: &dyn ManagementApi,
    op: &ManagementOp,
    context: &WorkloadContext,
) -> ExecutionResult<()> {
    match op {
        ManagementOp::AddVolume { name, qos } => {
            qos.validate()?;
            let volume = api.add_volume(name, qos)?;
            context.send(VolumeAdded { volume });
        }
        ManagementOp::StatVolume { name } => {
            let volume = api.stat_volume(name)?;
            context.send(VolumeStatted { volume });
        }
        ManagementOp::ModifyVolume { name, new_name, qos } => {
            if let Some(qos) = qos {
                qos.validate()?;
            }
            let volume = api.modify_volume(name, new_name.as_deref(), qos.as_ref())?;
            context.send(VolumeModified {
                previous_name: name.clone(),
                volume,
            });
        }
        ManagementOp::DeleteVolume { name } => {
            api.delete_volume(name)?;
            context.send(VolumeRemoved { name: name.clone() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::memory::{EndpointCapabilities, MemoryEndpoint};
    use super::*;
    use crate::event::Envelope;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_missing_capability_is_rejected() {
        let endpoint = MemoryEndpoint::with_capabilities(EndpointCapabilities {
            object_store: true,
            management: false,
        });
        let context = WorkloadContext::new();
        let op: Operation = ManagementOp::stat_volume("vol").into();

        let err = op.execute(&endpoint, &context).unwrap_err();
        match &err {
            ExecutionError::Unsupported {
                capability,
                operation,
                endpoint: name,
            } => {
                assert_eq!(*capability, Capability::Management);
                assert_eq!(operation, "stat volume vol");
                assert_eq!(name, "memory");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("requires the management capability"));
    }

    #[test]
    fn test_capability_table() {
        let both = MemoryEndpoint::new();
        let both: &dyn Endpoint = &both;
        assert_eq!(
            both.capabilities(),
            vec![Capability::ObjectStore, Capability::Management]
        );

        let mgmt = MemoryEndpoint::with_capabilities(EndpointCapabilities {
            object_store: false,
            management: true,
        });
        let mgmt: &dyn Endpoint = &mgmt;
        assert!(!mgmt.supports(Capability::ObjectStore));
        assert!(mgmt.supports(Capability::Management));
    }

    #[test]
    fn test_management_calls_publish_volume_events() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::new();
        let names = Arc::new(Mutex::new(Vec::new()));

        let _added = {
            let names = Arc::clone(&names);
            context.bus().register(move |event: &Envelope<VolumeAdded>| {
                names.lock().unwrap().push(format!("added {}", event.volume.name));
                Ok(())
            })
        };
        let _modified = {
            let names = Arc::clone(&names);
            context.bus().register(move |event: &Envelope<VolumeModified>| {
                names
                    .lock()
                    .unwrap()
                    .push(format!("renamed {} -> {}", event.previous_name, event.volume.name));
                Ok(())
            })
        };

        let add: Operation = ManagementOp::add_volume("vol-a", QosSettings::unmanaged()).into();
        let rename: Operation = ManagementOp::rename_volume("vol-a", "vol-b").into();
        add.execute(&endpoint, &context).unwrap();
        rename.execute(&endpoint, &context).unwrap();

        assert_eq!(
            *names.lock().unwrap(),
            vec!["added vol-a".to_string(), "renamed vol-a -> vol-b".to_string()]
        );
        assert!(endpoint.volume("vol-b").is_some());
    }

    #[test]
    fn test_object_call_publishes_operation_executed() {
        let endpoint = MemoryEndpoint::new();
        endpoint.seed_bucket("b");
        let context = WorkloadContext::new();
        let costs = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let costs = Arc::clone(&costs);
            context.bus().register(move |event: &Envelope<OperationExecuted>| {
                costs
                    .lock()
                    .unwrap()
                    .push(event.operation.charge().map(|charge| charge.cost));
                Ok(())
            })
        };

        let put: Operation = ObjectOp::put("b", "k", 8).charged_to("vol", 3).into();
        put.execute(&endpoint, &context).unwrap();

        assert_eq!(*costs.lock().unwrap(), vec![Some(3)]);
    }

    #[test]
    fn test_endpoint_failure_is_surfaced() {
        let endpoint = MemoryEndpoint::new();
        endpoint.set_should_fail(true);
        endpoint.set_error_message("connection reset".to_string());
        let context = WorkloadContext::new();

        let put: Operation = ObjectOp::put("b", "k", 8).into();
        let err = put.execute(&endpoint, &context).unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
    }

    #[test]
    fn test_invalid_qos_is_rejected_before_the_call() {
        let endpoint = MemoryEndpoint::new();
        let context = WorkloadContext::new();
        let qos = QosSettings {
            assured_iops: 100,
            throttle_iops: 10,
            ..QosSettings::default()
        };
        let add: Operation = ManagementOp::add_volume("vol", qos).into();

        assert!(matches!(
            add.execute(&endpoint, &context),
            Err(ExecutionError::Usage(_))
        ));
        assert!(endpoint.volume("vol").is_none());
    }
}

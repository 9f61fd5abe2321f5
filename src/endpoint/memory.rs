//! In-memory endpoint
//!
//! Keeps buckets, objects and volumes in process memory so workloads can be
//! run without a cluster: for dry runs, for demos, and in tests.
//!
//! # Features
//!
//! - Both capabilities, each of which can be switched off
//! - Configurable failure, for every call or for calls matching a pattern
//! - Records every successful call in order, with the calling thread
//! - Simulated per-call latency
//! - Optional enforcement of volume throttle limits
//!
//! # Example
//!
//! ```
//! use iodriver::context::WorkloadContext;
//! use iodriver::endpoint::memory::MemoryEndpoint;
//! use iodriver::operation::{ObjectOp, Operation};
//!
//! let endpoint = MemoryEndpoint::new();
//! let context = WorkloadContext::new();
//!
//! let create: Operation = ObjectOp::create_bucket("bucket-0", "vol-0").into();
//! let put: Operation = ObjectOp::put("bucket-0", "object-1", 4096).into();
//! create.execute(&endpoint, &context).unwrap();
//! put.execute(&endpoint, &context).unwrap();
//!
//! assert_eq!(endpoint.object_count("bucket-0"), Some(1));
//! assert_eq!(endpoint.executed_count(), 2);
//! ```

use super::{Endpoint, ManagementApi, ObjectStore};
use crate::error::{ExecutionError, ExecutionResult};
use crate::volume::{QosSettings, Volume};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Capabilities a [`MemoryEndpoint`] exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointCapabilities {
    pub object_store: bool,
    pub management: bool,
}

impl Default for EndpointCapabilities {
    fn default() -> Self {
        Self {
            object_store: true,
            management: true,
        }
    }
}

/// Record of a successful call, for verification
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Short description, e.g. `put bucket/key`
    pub call: String,
    /// Name of the thread that made the call
    pub thread: Option<String>,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct Bucket {
    volume: String,
    objects: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Store {
    buckets: HashMap<String, Bucket>,
    volumes: HashMap<String, QosSettings>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_all: bool,
    pattern: Option<String>,
    message: String,
}

/// Endpoint backed by process memory
///
/// Clones share state, so a test can keep a handle for inspection while the
/// driver owns another.
#[derive(Debug, Clone)]
pub struct MemoryEndpoint {
    name: String,
    capabilities: EndpointCapabilities,
    store: Arc<Mutex<Store>>,
    faults: Arc<Mutex<Faults>>,
    latency: Arc<Mutex<Duration>>,
    enforce_throttle: bool,
    /// Next free I/O slot per throttled volume
    throttle_slots: Arc<Mutex<HashMap<String, Instant>>>,
    executed: Arc<Mutex<Vec<CallRecord>>>,
    failed: Arc<Mutex<u64>>,
}

impl MemoryEndpoint {
    /// Create an endpoint with both capabilities
    ///
    /// By default, the endpoint:
    /// - Succeeds every valid call
    /// - Adds no latency
    /// - Does not enforce volume throttles
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            capabilities: EndpointCapabilities::default(),
            store: Arc::new(Mutex::new(Store::default())),
            faults: Arc::new(Mutex::new(Faults {
                message: "injected endpoint failure".to_string(),
                ..Faults::default()
            })),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
            enforce_throttle: false,
            throttle_slots: Arc::new(Mutex::new(HashMap::new())),
            executed: Arc::new(Mutex::new(Vec::new())),
            failed: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_capabilities(capabilities: EndpointCapabilities) -> Self {
        Self {
            capabilities,
            ..Self::new()
        }
    }

    pub fn object_store_only() -> Self {
        Self::with_capabilities(EndpointCapabilities {
            object_store: true,
            management: false,
        })
    }

    pub fn management_only() -> Self {
        Self::with_capabilities(EndpointCapabilities {
            object_store: false,
            management: true,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Delay object I/O until the owning volume's throttle allows it
    pub fn enforcing_throttle(mut self, enforce: bool) -> Self {
        self.enforce_throttle = enforce;
        self
    }

    /// Fail every call
    pub fn set_should_fail(&self, should_fail: bool) {
        lock(&self.faults).fail_all = should_fail;
    }

    /// Fail calls whose description contains `pattern`
    pub fn fail_matching(&self, pattern: impl Into<String>) {
        lock(&self.faults).pattern = Some(pattern.into());
    }

    pub fn clear_failures(&self) {
        let mut faults = lock(&self.faults);
        faults.fail_all = false;
        faults.pattern = None;
    }

    /// Set the error message returned by injected failures
    pub fn set_error_message(&self, message: String) {
        lock(&self.faults).message = message;
    }

    /// Sleep this long in every object I/O call
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Pre-create a bucket without recording a call
    pub fn seed_bucket(&self, bucket: &str) {
        lock(&self.store)
            .buckets
            .entry(bucket.to_string())
            .or_default();
    }

    /// Get a copy of all successful calls, in completion order
    pub fn executed(&self) -> Vec<CallRecord> {
        lock(&self.executed).clone()
    }

    pub fn executed_count(&self) -> usize {
        lock(&self.executed).len()
    }

    pub fn clear_executed(&self) {
        lock(&self.executed).clear();
    }

    /// Number of calls that returned an error
    pub fn failed_count(&self) -> u64 {
        *lock(&self.failed)
    }

    pub fn bucket_exists(&self, bucket: &str) -> bool {
        lock(&self.store).buckets.contains_key(bucket)
    }

    pub fn object_count(&self, bucket: &str) -> Option<usize> {
        lock(&self.store)
            .buckets
            .get(bucket)
            .map(|bucket| bucket.objects.len())
    }

    pub fn volume(&self, name: &str) -> Option<Volume> {
        lock(&self.store)
            .volumes
            .get(name)
            .map(|qos| Volume::new(name, *qos))
    }

    /// Run `call`, applying fault injection and recording the outcome
    fn perform<T>(
        &self,
        description: String,
        call: impl FnOnce(&mut Store) -> ExecutionResult<T>,
    ) -> ExecutionResult<T> {
        let result = self.inject(&description).and_then(|()| call(&mut lock(&self.store)));
        match &result {
            Ok(_) => lock(&self.executed).push(CallRecord {
                call: description,
                thread: thread::current().name().map(str::to_string),
                at: Instant::now(),
            }),
            Err(_) => *lock(&self.failed) += 1,
        }
        result
    }

    /// Object I/O: latency and throttling happen outside the store lock
    fn perform_io<T>(
        &self,
        bucket: &str,
        description: String,
        call: impl FnOnce(&mut Bucket) -> ExecutionResult<T>,
    ) -> ExecutionResult<T> {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        if self.enforce_throttle {
            self.wait_for_throttle(bucket);
        }

        self.perform(description, |store| {
            let bucket = store
                .buckets
                .get_mut(bucket)
                .ok_or_else(|| no_such("bucket", bucket))?;
            call(bucket)
        })
    }

    fn inject(&self, description: &str) -> ExecutionResult<()> {
        let faults = lock(&self.faults);
        let matched = faults
            .pattern
            .as_deref()
            .is_some_and(|pattern| description.contains(pattern));
        if faults.fail_all || matched {
            return Err(ExecutionError::failed(faults.message.clone()));
        }
        Ok(())
    }

    fn wait_for_throttle(&self, bucket: &str) {
        let limit = {
            let store = lock(&self.store);
            store
                .buckets
                .get(bucket)
                .and_then(|bucket| {
                    store
                        .volumes
                        .get(&bucket.volume)
                        .map(|qos| (bucket.volume.clone(), qos.throttle_iops))
                })
        };
        let Some((volume, throttle_iops)) = limit else {
            return;
        };
        if throttle_iops == 0 {
            return;
        }

        let interval = Duration::from_secs(1) / throttle_iops.min(u32::MAX as u64) as u32;
        let wait = {
            let mut slots = lock(&self.throttle_slots);
            let now = Instant::now();
            let slot = slots.entry(volume).or_insert(now);
            let start = (*slot).max(now);
            *slot = start + interval;
            start - now
        };
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }
}

impl Default for MemoryEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint for MemoryEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn object_store(&self) -> Option<&dyn ObjectStore> {
        if self.capabilities.object_store {
            Some(self)
        } else {
            None
        }
    }

    fn management(&self) -> Option<&dyn ManagementApi> {
        if self.capabilities.management {
            Some(self)
        } else {
            None
        }
    }
}

impl ObjectStore for MemoryEndpoint {
    fn create_bucket(&self, bucket: &str, volume: &str) -> ExecutionResult<()> {
        self.perform(format!("create bucket {}", bucket), |store| {
            if store.buckets.contains_key(bucket) {
                return Err(ExecutionError::failed(format!("bucket {} already exists", bucket)));
            }
            store.buckets.insert(
                bucket.to_string(),
                Bucket {
                    volume: volume.to_string(),
                    objects: HashMap::new(),
                },
            );
            Ok(())
        })
    }

    fn delete_bucket(&self, bucket: &str) -> ExecutionResult<()> {
        self.perform(format!("delete bucket {}", bucket), |store| {
            match store.buckets.get(bucket) {
                None => Err(no_such("bucket", bucket)),
                Some(existing) if !existing.objects.is_empty() => Err(ExecutionError::failed(
                    format!("bucket {} is not empty", bucket),
                )),
                Some(_) => {
                    store.buckets.remove(bucket);
                    Ok(())
                }
            }
        })
    }

    fn put_object(&self, bucket: &str, key: &str, size: u64) -> ExecutionResult<()> {
        self.perform_io(bucket, format!("put {}/{}", bucket, key), |bucket| {
            bucket.objects.insert(key.to_string(), size);
            Ok(())
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> ExecutionResult<u64> {
        self.perform_io(bucket, format!("get {}/{}", bucket, key), |bucket| {
            bucket
                .objects
                .get(key)
                .copied()
                .ok_or_else(|| no_such("object", key))
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> ExecutionResult<()> {
        self.perform_io(bucket, format!("delete {}/{}", bucket, key), |bucket| {
            bucket
                .objects
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| no_such("object", key))
        })
    }
}

impl ManagementApi for MemoryEndpoint {
    fn add_volume(&self, name: &str, qos: &QosSettings) -> ExecutionResult<Volume> {
        self.perform(format!("add volume {}", name), |store| {
            if store.volumes.contains_key(name) {
                return Err(ExecutionError::failed(format!("volume {} already exists", name)));
            }
            store.volumes.insert(name.to_string(), *qos);
            Ok(Volume::new(name, *qos))
        })
    }

    fn stat_volume(&self, name: &str) -> ExecutionResult<Volume> {
        self.perform(format!("stat volume {}", name), |store| {
            store
                .volumes
                .get(name)
                .map(|qos| Volume::new(name, *qos))
                .ok_or_else(|| no_such("volume", name))
        })
    }

    fn modify_volume(
        &self,
        name: &str,
        new_name: Option<&str>,
        qos: Option<&QosSettings>,
    ) -> ExecutionResult<Volume> {
        self.perform(format!("modify volume {}", name), |store| {
            if !store.volumes.contains_key(name) {
                return Err(no_such("volume", name));
            }
            if let Some(new_name) = new_name {
                if new_name != name && store.volumes.contains_key(new_name) {
                    return Err(ExecutionError::failed(format!(
                        "volume {} already exists",
                        new_name
                    )));
                }
            }

            let mut settings = store.volumes.remove(name).unwrap_or_default();
            if let Some(qos) = qos {
                settings = *qos;
            }
            let target = new_name.unwrap_or(name);
            store.volumes.insert(target.to_string(), settings);
            if target != name {
                for bucket in store.buckets.values_mut() {
                    if bucket.volume == name {
                        bucket.volume = target.to_string();
                    }
                }
            }
            Ok(Volume::new(target, settings))
        })
    }

    fn delete_volume(&self, name: &str) -> ExecutionResult<()> {
        self.perform(format!("delete volume {}", name), |store| {
            if store.buckets.values().any(|bucket| bucket.volume == name) {
                return Err(ExecutionError::failed(format!("volume {} still has buckets", name)));
            }
            store
                .volumes
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| no_such("volume", name))
        })
    }
}

fn no_such(kind: &str, name: &str) -> ExecutionError {
    ExecutionError::failed(format!("no such {}: {}", kind, name))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

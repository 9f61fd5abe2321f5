//! Per-run workload context
//!
//! A [`WorkloadContext`] owns the event bus for exactly one run together with
//! the instruments observing it (the QoS tracker, custom listeners). Its
//! lifecycle is `Created -> SetUp -> Running -> Closed`:
//!
//! - `set_up` registers every instrument's listeners; it may be called once
//! - the first phase that executes operations moves the context to `Running`
//!   (setting it up first if needed)
//! - `close` releases every subscription, even when an earlier release fails,
//!   removes any listener still registered on the bus, and reports listener
//!   failures recorded during the run. A closed context delivers no events.
//!
//! Accessors for derived state return copies, never live references, so a
//! validator can read while lanes are still publishing.

pub mod qos;

use crate::error::{ExecutionError, ExecutionResult, ListenerFailure, UsageError};
use crate::event::{Event, EventBus, Subscription};
use qos::{QosTracker, VolumeStats};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lifecycle of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    SetUp,
    Running,
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::SetUp => write!(f, "set up"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Closed => write!(f, "closed"),
        }
    }
}

/// Something that observes a run through the event bus
pub trait Instrument: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Subscribe to the events this instrument needs
    fn register(self: Arc<Self>, bus: &EventBus) -> Vec<Subscription>;
}

struct Installed {
    instrument: Arc<dyn Instrument>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Builds a context with its instruments
#[derive(Default)]
pub struct ContextBuilder {
    instruments: Vec<Installed>,
    qos: Option<Arc<QosTracker>>,
}

impl ContextBuilder {
    /// Track per-volume QoS settings and performance
    pub fn qos(mut self) -> Self {
        let tracker = Arc::new(QosTracker::new());
        self.qos = Some(Arc::clone(&tracker));
        self.instrument(tracker)
    }

    pub fn instrument<T: Instrument>(mut self, instrument: Arc<T>) -> Self {
        self.instruments.push(Installed {
            any: Arc::clone(&instrument) as Arc<dyn Any + Send + Sync>,
            instrument,
        });
        self
    }

    pub fn build(self) -> WorkloadContext {
        WorkloadContext {
            bus: EventBus::new(),
            state: Mutex::new(LifecycleState::Created),
            closed: AtomicBool::new(false),
            instruments: self.instruments,
            subscriptions: Mutex::new(Vec::new()),
            qos: self.qos,
        }
    }
}

/// Mutable state of one workload run
pub struct WorkloadContext {
    bus: EventBus,
    state: Mutex<LifecycleState>,
    closed: AtomicBool,
    instruments: Vec<Installed>,
    subscriptions: Mutex<Vec<Subscription>>,
    qos: Option<Arc<QosTracker>>,
}

impl WorkloadContext {
    /// Context without instruments
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Context tracking per-volume QoS
    pub fn with_qos() -> Self {
        Self::builder().qos().build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Publish an event on this context's bus
    ///
    /// Returns the number of listeners that received it; always 0 once the
    /// context is closed.
    pub fn send<E: Event>(&self, event: E) -> usize {
        if self.closed.load(Ordering::Acquire) {
            tracing::trace!(event = std::any::type_name::<E>(), "context closed; event dropped");
            return 0;
        }
        self.bus.send(event)
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock_state()
    }

    /// Register every instrument's listeners
    ///
    /// # Errors
    ///
    /// Returns a usage error unless the context is freshly created.
    pub fn set_up(&self) -> ExecutionResult<()> {
        let mut state = self.lock_state();
        if *state != LifecycleState::Created {
            return Err(UsageError::invalid(
                "context",
                format!("set_up called on a context that is {}", *state),
            )
            .into());
        }
        self.register_instruments();
        *state = LifecycleState::SetUp;
        Ok(())
    }

    /// Set up the context unless that already happened
    pub fn ensure_set_up(&self) -> ExecutionResult<()> {
        let mut state = self.lock_state();
        match *state {
            LifecycleState::Created => {
                self.register_instruments();
                *state = LifecycleState::SetUp;
                Ok(())
            }
            LifecycleState::SetUp | LifecycleState::Running => Ok(()),
            LifecycleState::Closed => Err(closed()),
        }
    }

    /// Enter `Running`, setting up first if needed
    pub(crate) fn begin_running(&self) -> ExecutionResult<()> {
        let mut state = self.lock_state();
        match *state {
            LifecycleState::Created => {
                self.register_instruments();
                *state = LifecycleState::Running;
                Ok(())
            }
            LifecycleState::SetUp => {
                *state = LifecycleState::Running;
                Ok(())
            }
            LifecycleState::Running => Ok(()),
            LifecycleState::Closed => Err(closed()),
        }
    }

    /// Release every subscription and report listener failures
    ///
    /// Closing twice is a no-op. Every subscription is released even when an
    /// earlier release fails; release failures and the listener failures
    /// recorded during the run come back together as one error.
    pub fn close(&self) -> ExecutionResult<()> {
        {
            let mut state = self.lock_state();
            if *state == LifecycleState::Closed {
                return Ok(());
            }
            *state = LifecycleState::Closed;
            self.closed.store(true, Ordering::Release);
        }

        let subscriptions = std::mem::take(&mut *self.lock_subscriptions());
        let released = subscriptions.len();
        let mut failures: Vec<ListenerFailure> = subscriptions
            .into_iter()
            .filter_map(|subscription| {
                let (id, event) = (subscription.id(), subscription.event());
                subscription.close().err().map(|err| ListenerFailure {
                    event,
                    subscription: id,
                    message: err.to_string(),
                })
            })
            .collect();

        // listeners registered straight on the bus have no subscription here
        let stray = self.bus.clear();

        let mut recorded = self.bus.take_failures();
        recorded.append(&mut failures);
        tracing::debug!(released, stray, failures = recorded.len(), "context closed");

        if recorded.is_empty() {
            Ok(())
        } else {
            Err(ExecutionError::Listeners { failures: recorded })
        }
    }

    /// Installed instrument of type `T`
    pub fn instrument<T: Instrument>(&self) -> Option<Arc<T>> {
        self.instruments
            .iter()
            .find_map(|installed| Arc::clone(&installed.any).downcast::<T>().ok())
    }

    pub fn qos(&self) -> Option<&QosTracker> {
        self.qos.as_deref()
    }

    /// Copy of the tracked state of `volume`
    pub fn stats(&self, volume: &str) -> Option<VolumeStats> {
        self.qos.as_ref().and_then(|qos| qos.stats(volume))
    }

    /// Copy of every tracked volume (empty without QoS tracking)
    pub fn all_stats(&self) -> BTreeMap<String, VolumeStats> {
        self.qos
            .as_ref()
            .map(|qos| qos.snapshot())
            .unwrap_or_default()
    }

    fn register_instruments(&self) {
        let mut subscriptions = self.lock_subscriptions();
        for installed in &self.instruments {
            let registered = Arc::clone(&installed.instrument).register(&self.bus);
            tracing::debug!(
                instrument = installed.instrument.name(),
                listeners = registered.len(),
                "instrument registered"
            );
            subscriptions.extend(registered);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for WorkloadContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkloadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadContext")
            .field("state", &self.state())
            .field(
                "instruments",
                &self
                    .instruments
                    .iter()
                    .map(|installed| installed.instrument.name())
                    .collect::<Vec<_>>(),
            )
            .field("bus", &self.bus)
            .finish()
    }
}

fn closed() -> ExecutionError {
    UsageError::invalid("context", "context is already closed").into()
}

//! Typed publish/subscribe bus
//!
//! The bus carries lifecycle and measurement events from operations to the
//! instruments observing a run (QoS tracker, progress reporter, tests).
//!
//! # Delivery
//!
//! - Listeners are keyed by event type; `send` reaches only listeners of that type
//! - Delivery is synchronous, on the publishing thread, in registration order
//! - Each listener sees each event exactly once
//! - A failing (or panicking) listener is logged and recorded, and delivery
//!   continues with the next listener. Recorded failures are drained by the
//!   owning context when it closes.
//!
//! Listeners may be called from several worker lanes at once and must guard
//! their own mutable state.
//!
//! # Example
//!
//! ```
//! use iodriver::event::{EventBus, events::VolumeStarted};
//!
//! let bus = EventBus::new();
//! let subscription = bus.register(|event: &iodriver::event::Envelope<VolumeStarted>| {
//!     println!("{} started at {}", event.name, event.timestamp());
//!     Ok(())
//! });
//!
//! assert_eq!(bus.send(VolumeStarted::new("vol-0")), 1);
//! subscription.close().unwrap();
//! assert_eq!(bus.send(VolumeStarted::new("vol-0")), 0);
//! ```

pub mod events;

use crate::error::{ExecutionError, ExecutionResult, ListenerFailure};
use chrono::{DateTime, Utc};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

/// Marker for types that can travel on the bus
pub trait Event: Any + Send + Sync + fmt::Debug {}

/// Timestamped, shared event payload
///
/// The payload sits behind an `Arc` so every listener of one `send` observes
/// the same instance.
pub struct Envelope<E> {
    timestamp: DateTime<Utc>,
    payload: Arc<E>,
}

impl<E> Envelope<E> {
    pub fn new(payload: E) -> Self {
        Self::shared(Arc::new(payload))
    }

    /// Wrap an already shared payload, stamping it with the current time
    pub fn shared(payload: Arc<E>) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Arc<E> {
        &self.payload
    }
}

impl<E> Clone for Envelope<E> {
    fn clone(&self) -> Self {
        Self {
            timestamp: self.timestamp,
            payload: Arc::clone(&self.payload),
        }
    }
}

impl<E> Deref for Envelope<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.payload
    }
}

impl<E: fmt::Debug> fmt::Debug for Envelope<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("timestamp", &self.timestamp)
            .field("payload", &self.payload)
            .finish()
    }
}

type ErasedListener = Arc<dyn Fn(&dyn Any) -> crate::Result<()> + Send + Sync>;

struct Registration {
    id: u64,
    callback: ErasedListener,
}

struct BusInner {
    listeners: RwLock<HashMap<TypeId, Vec<Registration>>>,
    next_id: AtomicU64,
    failures: Mutex<Vec<ListenerFailure>>,
}

impl BusInner {
    fn remove(&self, type_id: TypeId, id: u64) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(registrations) = listeners.get_mut(&type_id) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|registration| registration.id != id);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            listeners.remove(&type_id);
        }
        removed
    }
}

/// Event bus owned by one workload context
///
/// Cloning the bus yields another handle to the same listener table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                failures: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener for events of type `E`
    ///
    /// The returned subscription unregisters the listener when closed or
    /// dropped.
    pub fn register<E, F>(&self, listener: F) -> Subscription
    where
        E: Event,
        F: Fn(&Envelope<E>) -> crate::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: ErasedListener = Arc::new(move |event: &dyn Any| {
            match event.downcast_ref::<Envelope<E>>() {
                Some(envelope) => listener(envelope),
                None => Err(anyhow::anyhow!(
                    "event routed to listener of the wrong type (expected {})",
                    type_name::<E>()
                )),
            }
        });

        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Registration { id, callback });

        tracing::trace!(subscription = id, event = type_name::<E>(), "listener registered");

        Subscription {
            id,
            type_id: TypeId::of::<E>(),
            event: type_name::<E>(),
            bus: Arc::downgrade(&self.inner),
            released: false,
        }
    }

    /// Publish an event to every listener registered for its type
    ///
    /// Returns the number of listeners the event was handed to.
    pub fn send<E: Event>(&self, event: E) -> usize {
        self.send_envelope(&Envelope::new(event))
    }

    /// Publish an already built envelope
    pub fn send_envelope<E: Event>(&self, envelope: &Envelope<E>) -> usize {
        // Snapshot the callbacks so listeners may (un)register without deadlocking.
        let callbacks: Vec<(u64, ErasedListener)> = {
            let listeners = self
                .inner
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match listeners.get(&TypeId::of::<E>()) {
                Some(registrations) => registrations
                    .iter()
                    .map(|registration| (registration.id, Arc::clone(&registration.callback)))
                    .collect(),
                None => return 0,
            }
        };

        for (id, callback) in &callbacks {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(envelope as &dyn Any)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{:#}", err),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            tracing::warn!(
                subscription = id,
                event = type_name::<E>(),
                error = %message,
                "listener failed; continuing delivery"
            );
            self.inner
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(ListenerFailure {
                    event: type_name::<E>(),
                    subscription: *id,
                    message,
                });
        }

        callbacks.len()
    }

    /// Whether anyone listens for events of type `E`
    pub fn has_listeners<E: Event>(&self) -> bool {
        self.has_listeners_for(TypeId::of::<E>())
    }

    pub fn has_listeners_for(&self, type_id: TypeId) -> bool {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .is_some_and(|registrations| !registrations.is_empty())
    }

    /// Total number of registered listeners across all event types
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Remove a listener
    pub fn unregister(&self, subscription: Subscription) -> ExecutionResult<()> {
        subscription.close()
    }

    /// Remove every listener, returning how many were registered
    ///
    /// Subscriptions still held for removed listeners release quietly when
    /// dropped; closing one explicitly reports it as no longer registered.
    pub fn clear(&self) -> usize {
        let removed = std::mem::take(
            &mut *self
                .inner
                .listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        removed.values().map(Vec::len).sum()
    }

    /// Drain the listener failures recorded so far
    pub fn take_failures(&self) -> Vec<ListenerFailure> {
        std::mem::take(
            &mut *self
                .inner
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle to a registered listener
///
/// Releasing is guaranteed: `close` reports whether the listener was still
/// registered, and dropping an unclosed subscription unregisters it silently.
#[must_use = "dropping a subscription unregisters its listener"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    type_id: TypeId,
    event: &'static str,
    bus: Weak<BusInner>,
    released: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the event type this subscription listens to
    pub fn event(&self) -> &'static str {
        self.event
    }

    /// Unregister the listener
    ///
    /// Fails when the bus is gone or the listener was already removed.
    pub fn close(mut self) -> ExecutionResult<()> {
        self.release()
    }

    fn release(&mut self) -> ExecutionResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let bus = self.bus.upgrade().ok_or_else(|| {
            ExecutionError::failed(format!(
                "subscription #{} for {}: event bus already dropped",
                self.id, self.event
            ))
        })?;

        if bus.remove(self.type_id, self.id) {
            tracing::trace!(subscription = self.id, event = self.event, "listener unregistered");
            Ok(())
        } else {
            Err(ExecutionError::failed(format!(
                "subscription #{} for {} was not registered",
                self.id, self.event
            )))
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

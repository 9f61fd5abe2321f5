//! QoS tracking
//!
//! [`QosTracker`] listens to volume and operation events and keeps, per
//! volume, the volume's current QoS settings and the performance accumulated
//! inside its measurement window.
//!
//! # Transitions
//!
//! - `VolumeAdded` / `VolumeStatted`: create or replace the entry's settings;
//!   accumulated performance is kept
//! - `VolumeModified`: re-key the entry under the new name, keeping its
//!   performance; the old key is removed when the name changed
//! - `VolumeStarted`: open the window (a start on an untracked volume starts
//!   tracking it with unmanaged settings; a start while open is ignored; a
//!   start after a stop reopens the window and keeps the counters)
//! - `VolumeStopped`: close the window
//! - `OperationExecuted` with an I/O charge: add the cost if the charged
//!   volume's window is open, otherwise ignore it
//!
//! Entries are not dropped on `VolumeRemoved`: validators read them after
//! teardown has deleted the volumes.

use super::Instrument;
use crate::event::events::{
    OperationExecuted, VolumeAdded, VolumeModified, VolumeStarted, VolumeStatted, VolumeStopped,
};
use crate::event::{Envelope, EventBus, Subscription};
use crate::stats::histogram::LatencyHistogram;
use crate::volume::{QosSettings, Volume};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Measurement window of one volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeasurementWindow {
    #[default]
    NotStarted,
    Open {
        since: Instant,
    },
    Closed {
        since: Instant,
        until: Instant,
    },
}

impl MeasurementWindow {
    pub fn is_open(&self) -> bool {
        matches!(self, MeasurementWindow::Open { .. })
    }
}

/// Performance accumulated while a volume's window was open
#[derive(Debug, Clone, Default)]
pub struct PerformanceStats {
    window: MeasurementWindow,
    /// Length of every window closed so far
    measured: Duration,
    io_cost: u64,
    operations: u64,
    latency: LatencyHistogram,
}

impl PerformanceStats {
    pub fn window(&self) -> MeasurementWindow {
        self.window
    }

    /// Sum of I/O charges recorded inside the window
    pub fn io_cost(&self) -> u64 {
        self.io_cost
    }

    /// Number of charged operations recorded inside the window
    pub fn operations(&self) -> u64 {
        self.operations
    }

    pub fn latency(&self) -> &LatencyHistogram {
        &self.latency
    }

    /// Total time the window has been open, including a window still open
    pub fn elapsed(&self) -> Duration {
        match self.window {
            MeasurementWindow::Open { since } => self.measured + since.elapsed(),
            _ => self.measured,
        }
    }

    /// I/O cost per second of open window
    pub fn observed_iops(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.io_cost as f64 / secs
    }

    fn start(&mut self, at: Instant) -> bool {
        match self.window {
            MeasurementWindow::Open { .. } => false,
            MeasurementWindow::NotStarted | MeasurementWindow::Closed { .. } => {
                self.window = MeasurementWindow::Open { since: at };
                true
            }
        }
    }

    fn stop(&mut self, at: Instant) -> bool {
        match self.window {
            MeasurementWindow::Open { since } => {
                let until = at.max(since);
                self.measured += until - since;
                self.window = MeasurementWindow::Closed { since, until };
                true
            }
            _ => false,
        }
    }

    fn record(&mut self, cost: u64, latency: Duration) -> bool {
        if !self.window.is_open() {
            return false;
        }
        self.io_cost += cost;
        self.operations += 1;
        self.latency.record(latency);
        true
    }
}

/// Tracked state of one volume
#[derive(Debug, Clone, Default)]
pub struct VolumeStats {
    pub settings: QosSettings,
    pub performance: PerformanceStats,
}

impl VolumeStats {
    pub fn new(settings: QosSettings) -> Self {
        Self {
            settings,
            performance: PerformanceStats::default(),
        }
    }
}

/// Per-volume QoS and performance tracker
///
/// Callbacks run on the publishing lane's thread; the map is guarded by the
/// tracker's own lock.
#[derive(Debug, Default)]
pub struct QosTracker {
    volumes: Mutex<HashMap<String, VolumeStats>>,
}

impl QosTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the tracked state of `volume`
    pub fn stats(&self, volume: &str) -> Option<VolumeStats> {
        self.lock().get(volume).cloned()
    }

    /// Copy of every tracked volume, ordered by name
    pub fn snapshot(&self) -> BTreeMap<String, VolumeStats> {
        self.lock()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect()
    }

    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    fn on_settings(&self, volume: &Volume) {
        let mut volumes = self.lock();
        volumes
            .entry(volume.name.clone())
            .or_insert_with(|| VolumeStats::new(volume.qos))
            .settings = volume.qos;
    }

    fn on_modified(&self, previous_name: &str, volume: &Volume) {
        let mut volumes = self.lock();
        let mut stats = volumes
            .remove(previous_name)
            .unwrap_or_else(|| VolumeStats::new(volume.qos));
        stats.settings = volume.qos;
        volumes.insert(volume.name.clone(), stats);
    }

    fn on_started(&self, name: &str) {
        let mut volumes = self.lock();
        let stats = volumes.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(volume = name, "tracking volume on start");
            VolumeStats::new(QosSettings::unmanaged())
        });
        if stats.performance.start(Instant::now()) {
            tracing::debug!(volume = name, "measurement window opened");
        }
    }

    fn on_stopped(&self, name: &str) {
        if let Some(stats) = self.lock().get_mut(name) {
            if stats.performance.stop(Instant::now()) {
                tracing::debug!(volume = name, io_cost = stats.performance.io_cost, "measurement window closed");
            }
        }
    }

    fn on_executed(&self, event: &OperationExecuted) {
        let Some(charge) = event.operation.charge() else {
            return;
        };
        if let Some(stats) = self.lock().get_mut(&charge.volume) {
            stats.performance.record(charge.cost, event.latency);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VolumeStats>> {
        self.volumes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Instrument for QosTracker {
    fn name(&self) -> &str {
        "qos"
    }

    fn register(self: Arc<Self>, bus: &EventBus) -> Vec<Subscription> {
        let added = Arc::clone(&self);
        let statted = Arc::clone(&self);
        let modified = Arc::clone(&self);
        let started = Arc::clone(&self);
        let stopped = Arc::clone(&self);
        let executed = self;

        vec![
            bus.register(move |event: &Envelope<VolumeAdded>| {
                added.on_settings(&event.volume);
                Ok(())
            }),
            bus.register(move |event: &Envelope<VolumeStatted>| {
                statted.on_settings(&event.volume);
                Ok(())
            }),
            bus.register(move |event: &Envelope<VolumeModified>| {
                modified.on_modified(&event.previous_name, &event.volume);
                Ok(())
            }),
            bus.register(move |event: &Envelope<VolumeStarted>| {
                started.on_started(&event.name);
                Ok(())
            }),
            bus.register(move |event: &Envelope<VolumeStopped>| {
                stopped.on_stopped(&event.name);
                Ok(())
            }),
            bus.register(move |event: &Envelope<OperationExecuted>| {
                executed.on_executed(event);
                Ok(())
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ObjectOp, Operation};
    use crate::volume::Priority;

    fn tracker_on(bus: &EventBus) -> (Arc<QosTracker>, Vec<Subscription>) {
        let tracker = Arc::new(QosTracker::new());
        let subscriptions = Arc::clone(&tracker).register(bus);
        (tracker, subscriptions)
    }

    fn executed(volume: &str, cost: u64) -> OperationExecuted {
        let operation: Operation = ObjectOp::put("b", "k", 1).charged_to(volume, cost).into();
        OperationExecuted {
            operation,
            latency: Duration::from_micros(250),
        }
    }

    fn volume(name: &str, assured: u64) -> Volume {
        Volume::new(name, QosSettings::new(assured, 0, Priority::Normal).unwrap())
    }

    #[test]
    fn test_cost_accumulates_inside_window() {
        let bus = EventBus::new();
        let (tracker, _subs) = tracker_on(&bus);

        bus.send(VolumeAdded { volume: volume("vol", 100) });
        bus.send(VolumeStarted::new("vol"));
        for _ in 0..7 {
            bus.send(executed("vol", 3));
        }

        let stats = tracker.stats("vol").unwrap();
        assert_eq!(stats.performance.io_cost(), 21);
        assert_eq!(stats.performance.operations(), 7);
        assert_eq!(stats.performance.latency().len(), 7);
    }

    #[test]
    fn test_events_outside_window_are_ignored() {
        let bus = EventBus::new();
        let (tracker, _subs) = tracker_on(&bus);

        bus.send(VolumeAdded { volume: volume("vol", 100) });
        bus.send(executed("vol", 5));
        bus.send(VolumeStarted::new("vol"));
        bus.send(executed("vol", 2));
        bus.send(VolumeStopped::new("vol"));
        bus.send(executed("vol", 5));

        let stats = tracker.stats("vol").unwrap();
        assert_eq!(stats.performance.io_cost(), 2);
        assert!(matches!(
            stats.performance.window(),
            MeasurementWindow::Closed { .. }
        ));
    }

    #[test]
    fn test_restart_keeps_counters() {
        let bus = EventBus::new();
        let (tracker, _subs) = tracker_on(&bus);

        bus.send(VolumeStarted::new("vol"));
        bus.send(VolumeStarted::new("vol"));
        bus.send(executed("vol", 1));
        bus.send(VolumeStopped::new("vol"));
        bus.send(VolumeStarted::new("vol"));
        bus.send(executed("vol", 1));

        let stats = tracker.stats("vol").unwrap();
        assert_eq!(stats.settings, QosSettings::unmanaged());
        assert_eq!(stats.performance.io_cost(), 2);
        assert!(stats.performance.window().is_open());
    }

    #[test]
    fn test_settings_replaced_counters_preserved() {
        let bus = EventBus::new();
        let (tracker, _subs) = tracker_on(&bus);

        bus.send(VolumeAdded { volume: volume("vol", 100) });
        bus.send(VolumeStarted::new("vol"));
        bus.send(executed("vol", 4));
        bus.send(VolumeStatted { volume: volume("vol", 300) });

        let stats = tracker.stats("vol").unwrap();
        assert_eq!(stats.settings.assured_iops, 300);
        assert_eq!(stats.performance.io_cost(), 4);
    }

    #[test]
    fn test_rename_rekeys_entry() {
        let bus = EventBus::new();
        let (tracker, _subs) = tracker_on(&bus);

        bus.send(VolumeAdded { volume: volume("old", 100) });
        bus.send(VolumeStarted::new("old"));
        bus.send(executed("old", 6));
        bus.send(VolumeModified {
            previous_name: "old".to_string(),
            volume: volume("new", 100),
        });

        assert!(tracker.stats("old").is_none());
        let stats = tracker.stats("new").unwrap();
        assert_eq!(stats.performance.io_cost(), 6);
        assert!(stats.performance.window().is_open());
        assert_eq!(tracker.tracked(), 1);
    }

    #[test]
    fn test_stats_are_copies() {
        let bus = EventBus::new();
        let (tracker, _subs) = tracker_on(&bus);

        bus.send(VolumeStarted::new("vol"));
        let before = tracker.stats("vol").unwrap();
        bus.send(executed("vol", 9));

        assert_eq!(before.performance.io_cost(), 0);
        assert_eq!(tracker.snapshot()["vol"].performance.io_cost(), 9);
    }

    #[test]
    fn test_uncharged_and_untracked_operations_are_ignored() {
        let bus = EventBus::new();
        let (tracker, _subs) = tracker_on(&bus);

        bus.send(VolumeStarted::new("vol"));
        bus.send(OperationExecuted {
            operation: ObjectOp::get("b", "k").into(),
            latency: Duration::ZERO,
        });
        bus.send(executed("elsewhere", 1));

        assert_eq!(tracker.stats("vol").unwrap().performance.io_cost(), 0);
        assert!(tracker.stats("elsewhere").is_none());
    }

    #[test]
    fn test_observed_iops() {
        let mut performance = PerformanceStats::default();
        let start = Instant::now();
        performance.start(start);
        performance.record(500, Duration::ZERO);
        performance.stop(start + Duration::from_secs(2));

        assert_eq!(performance.elapsed(), Duration::from_secs(2));
        assert!((performance.observed_iops() - 250.0).abs() < f64::EPSILON);
        assert!(!performance.record(1, Duration::ZERO));
    }
}

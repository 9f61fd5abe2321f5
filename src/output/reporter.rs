//! Live progress reporting
//!
//! A [`ProgressReporter`] subscribes to `OperationExecuted` on a context's
//! bus, counts operations and bytes, and prints one line per interval from a
//! background thread:
//!
//! ```text
//! [  3s] ops: 1.52K/s (5.94 MB/s) lat: 112us total: 4,560
//! ```
//!
//! The reporter is a scoped resource: [`ProgressReporter::close`] (or drop)
//! stops the thread and unregisters the listener.

use crate::error::ExecutionResult;
use crate::event::events::OperationExecuted;
use crate::event::{Envelope, EventBus, Subscription};
use crate::operation::{ObjectAction, Operation};
use crate::util::time::{calculate_iops, calculate_throughput, format_count, format_rate, format_throughput};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Counters {
    operations: AtomicU64,
    bytes: AtomicU64,
    latency_nanos: AtomicU64,
}

/// Totals at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub at: Instant,
    pub operations: u64,
    pub bytes: u64,
    latency_nanos: u64,
}

impl ProgressSnapshot {
    /// Progress line for the interval from `previous` to `self`
    pub fn line_since(&self, previous: &ProgressSnapshot, run_started: Instant) -> String {
        let elapsed = self.at.duration_since(previous.at);
        let operations = self.operations - previous.operations;
        let bytes = self.bytes - previous.bytes;

        let mut line = format!(
            "[{:3}s] ops: {}/s ({})",
            self.at.duration_since(run_started).as_secs(),
            format_rate(calculate_iops(operations, elapsed)),
            format_throughput(calculate_throughput(bytes, elapsed)),
        );
        if operations > 0 {
            let mean_us = (self.latency_nanos - previous.latency_nanos) / operations / 1_000;
            line.push_str(&format!(" lat: {}us", mean_us));
        }
        line.push_str(&format!(" total: {}", format_count(self.operations)));
        line
    }
}

impl Counters {
    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            at: Instant::now(),
            operations: self.operations.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            latency_nanos: self.latency_nanos.load(Ordering::Relaxed),
        }
    }

    fn record(&self, event: &OperationExecuted) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        if let Operation::ObjectStore(op) = &event.operation {
            if let ObjectAction::Put { size, .. } = op.action {
                self.bytes.fetch_add(size, Ordering::Relaxed);
            }
        }
        let nanos = u64::try_from(event.latency.as_nanos()).unwrap_or(u64::MAX);
        self.latency_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

/// Prints per-interval operation rates while a run is in progress
pub struct ProgressReporter {
    counters: Arc<Counters>,
    subscription: Option<Subscription>,
    stop: Option<Sender<()>>,
    printer: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Subscribe to `bus` and print a line every `interval`
    pub fn start(bus: &EventBus, interval: Duration) -> Self {
        let mut reporter = Self::silent(bus);
        let counters = Arc::clone(&reporter.counters);
        let (stop, stopped) = channel::bounded::<()>(1);

        let printer = thread::Builder::new()
            .name("progress".to_string())
            .spawn(move || {
                let run_started = Instant::now();
                let mut previous = counters.snapshot();
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let current = counters.snapshot();
                            println!("{}", current.line_since(&previous, run_started));
                            previous = current;
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

        match printer {
            Ok(handle) => {
                reporter.stop = Some(stop);
                reporter.printer = Some(handle);
            }
            Err(err) => tracing::warn!(error = %err, "progress reporter thread not started"),
        }
        reporter
    }

    /// Count operations without printing
    pub fn silent(bus: &EventBus) -> Self {
        let counters = Arc::new(Counters::default());
        let listener = Arc::clone(&counters);
        let subscription = bus.register(move |event: &Envelope<OperationExecuted>| {
            listener.record(event);
            Ok(())
        });
        Self {
            counters,
            subscription: Some(subscription),
            stop: None,
            printer: None,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.counters.snapshot()
    }

    /// Stop printing and unregister the listener
    pub fn close(mut self) -> ExecutionResult<ProgressSnapshot> {
        self.stop_printer();
        let last = self.counters.snapshot();
        match self.subscription.take() {
            Some(subscription) => subscription.close().map(|()| last),
            None => Ok(last),
        }
    }

    fn stop_printer(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(printer) = self.printer.take() {
            if printer.join().is_err() {
                tracing::warn!("progress reporter thread panicked");
            }
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop_printer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::ObjectOp;

    fn executed(size: u64) -> OperationExecuted {
        OperationExecuted {
            operation: ObjectOp::put("b", "k", size).into(),
            latency: Duration::from_micros(200),
        }
    }

    #[test]
    fn test_counts_executed_operations() {
        let bus = EventBus::new();
        let reporter = ProgressReporter::silent(&bus);

        bus.send(executed(1024));
        bus.send(executed(1024));
        bus.send(OperationExecuted {
            operation: ObjectOp::get("b", "k").into(),
            latency: Duration::from_micros(200),
        });

        let totals = reporter.close().unwrap();
        assert_eq!(totals.operations, 3);
        assert_eq!(totals.bytes, 2048);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_line_since() {
        let start = Instant::now();
        let previous = ProgressSnapshot {
            at: start,
            operations: 0,
            bytes: 0,
            latency_nanos: 0,
        };
        let current = ProgressSnapshot {
            at: start + Duration::from_secs(2),
            operations: 3000,
            bytes: 3000 * 4096,
            latency_nanos: 3000 * 150_000,
        };

        let line = current.line_since(&previous, start);
        assert_eq!(line, "[  2s] ops: 1.50K/s (5.86 MB/s) lat: 150us total: 3,000");
    }

    #[test]
    fn test_printer_stops_on_close() {
        let bus = EventBus::new();
        let reporter = ProgressReporter::start(&bus, Duration::from_millis(20));
        bus.send(executed(1));
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        reporter.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

//! iodriver - workload execution engine for storage cluster testing
//!
//! iodriver runs scenario-style workloads against a storage endpoint: object
//! I/O (buckets, puts, gets, deletes) and volume administration issued from
//! many concurrent lanes, observed through a typed event bus and measured
//! against each volume's QoS settings.
//!
//! # Architecture
//!
//! - **Operations**: a closed [`operation::Operation`] enum dispatched against
//!   an [`endpoint::Endpoint`] through its capability table
//! - **Workloads**: setup, concurrent body lanes started at a shared
//!   rendezvous, and teardown; lane failures are aggregated, never dropped
//! - **Context**: one [`context::WorkloadContext`] per run owns the
//!   [`event::EventBus`] and the QoS tracker
//! - **Validation and output**: validators read copies of the tracked
//!   statistics; summaries print as text or JSON
//!
//! # Example
//!
//! ```
//! use iodriver::driver::{Driver, DriverOptions};
//! use iodriver::endpoint::memory::MemoryEndpoint;
//! use iodriver::operation::ObjectOp;
//! use iodriver::workload::{sequence::SequenceWorkload, Workload};
//!
//! let endpoint = MemoryEndpoint::new();
//! let workload = Workload::new(
//!     SequenceWorkload::builder("hello")
//!         .setup(vec![ObjectOp::create_bucket("b", "vol").into()])
//!         .lane(vec![ObjectOp::put("b", "k", 4096).into()])
//!         .teardown(vec![ObjectOp::delete("b", "k").into(), ObjectOp::delete_bucket("b").into()])
//!         .build(),
//! );
//!
//! let summary = Driver::new(&endpoint, DriverOptions::default()).run(&workload).unwrap();
//! assert_eq!(summary.bytes_written, 4096);
//! ```

pub mod config;
pub mod context;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod operation;
pub mod output;
pub mod stats;
pub mod util;
pub mod validator;
pub mod volume;
pub mod workload;

// Re-export commonly used types
pub use config::Config;
pub use context::WorkloadContext;
pub use endpoint::Endpoint;
pub use error::{ExecutionError, ExecutionResult};
pub use operation::Operation;
pub use workload::Workload;

/// Result type used by the configuration layer and the binary
pub type Result<T> = anyhow::Result<T>;

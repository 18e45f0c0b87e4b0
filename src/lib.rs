//! # CDC Relay
//!
//! Tails a database replication stream, queues every row change in a durable
//! ordered log, and hands the queue to pluggable processors in single-rule
//! batches, acknowledging each batch only after it was processed.
//!
//! ## Core Concepts
//!
//! - **Event log**: append-only, id-ordered row events and position markers
//! - **Checkpoint**: how far ingestion and consumption have progressed
//! - **Trigger**: count/time debounce that runs one consumption cycle at a time
//! - **Consumer**: drain, dispatch, acknowledge; at-least-once delivery
//!
//! ## Example
//!
//! ```ignore
//! use cdc_relay::{ProcessorRegistry, Relay, RelayConfig, RowEvent, Shutdown};
//!
//! let mut processors = ProcessorRegistry::new();
//! processors.register("orders_sink", |batch: &[RowEvent], args: &[String]| {
//!     println!("{} events for {:?}", batch.len(), args);
//!     Ok(())
//! });
//!
//! let relay = Relay::open(RelayConfig::load("relay.yaml")?, processors)?;
//! let shutdown = Shutdown::new();
//! relay.run_with_source(&mut my_binlog_client, &shutdown)?;
//! relay.close()?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod ingest;
pub mod processor;
pub mod relay;
pub mod replication;
pub mod rules;
pub mod shutdown;
pub mod trigger;
pub mod types;

// Re-exports
pub use checkpoint::{reconcile, CheckpointManager, CheckpointOptions, CheckpointState, StorageMode};
pub use config::{RelayConfig, StorageConfig, TaskConfig};
pub use consumer::{Consumer, CycleReport};
pub use error::{ProcessError, RelayError, Result};
pub use events::{EventLog, LogEntry, ScanControl, ScanRange};
pub use ingest::IngestionAdapter;
pub use processor::{Processor, ProcessorRegistry};
pub use relay::{Relay, RelayStats};
pub use replication::{run_replication, stream_error, ReplicationSource, DEFAULT_RETRY_BACKOFF};
pub use rules::{Rule, RuleSet};
pub use shutdown::Shutdown;
pub use trigger::Trigger;
pub use types::*;

//! Ingestion/consumption positions and counters, persisted to a small
//! human-readable side file.

mod manager;
mod state;

pub use manager::{CheckpointManager, CheckpointOptions, PreFlushHook, CHECKPOINT_FILE};
pub use state::{reconcile, CheckpointState, StorageMode};

//! Persisted checkpoint record and startup reconciliation.

use crate::types::{EventId, Position, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Durability mode of the event log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Journaled log; the backlog survives restarts.
    #[default]
    File,
    /// In-memory log; the backlog is lost on restart.
    Memory,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::File => f.write_str("file"),
            StorageMode::Memory => f.write_str("memory"),
        }
    }
}

/// Snapshot of the checkpoint as written to disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Last stream offset durably appended to the log. Resume point in file mode.
    pub ingestion_position: Position,

    /// Last stream offset fully processed. Resume point in memory mode.
    pub consumption_position: Position,

    /// Sequence high-water mark.
    pub latest_event_id: EventId,

    /// Next id the consumer has not yet acknowledged.
    pub next_consume_event_id: EventId,

    /// Approximate number of pending entries.
    #[serde(default)]
    pub event_count: u64,

    pub mode: StorageMode,

    #[serde(default)]
    pub saved_at: Timestamp,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            ingestion_position: Position::default(),
            consumption_position: Position::default(),
            latest_event_id: EventId(0),
            next_consume_event_id: EventId(1),
            event_count: 0,
            mode: StorageMode::File,
            saved_at: Timestamp::default(),
        }
    }
}

impl CheckpointState {
    /// A fresh record for a cold start in `mode`.
    pub fn cold(mode: StorageMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Entries between the consumer cursor and the high-water mark.
    pub fn queue_depth(&self) -> u64 {
        (self.latest_event_id.0 + 1).saturating_sub(self.next_consume_event_id.0)
    }

    /// Where the replication client should resume from.
    pub fn resume_position(&self) -> &Position {
        match self.mode {
            StorageMode::File => &self.ingestion_position,
            StorageMode::Memory => &self.consumption_position,
        }
    }
}

/// Derive the effective state for this run from what was saved last time.
///
/// Whenever the previous or the current run keeps the log in memory there is
/// no backlog to resume from, so ingestion restarts at the consumption
/// position and the cursor moves past everything ever assigned.
pub fn reconcile(saved: CheckpointState, mode: StorageMode) -> CheckpointState {
    let mut state = saved;
    let backlog_lost = state.mode == StorageMode::Memory || mode == StorageMode::Memory;

    if backlog_lost {
        state.ingestion_position = state.consumption_position.clone();
        state.next_consume_event_id = state.latest_event_id.next();
    }

    if state.next_consume_event_id > state.latest_event_id.next() {
        state.next_consume_event_id = state.latest_event_id.next();
    }

    state.mode = mode;
    state
}

//! Durable, ID-ordered event queue.
//!
//! Row events and ingestion-position markers share one ordered keyspace, so
//! draining the log in key order yields position updates between events.

mod journal;
mod key;
mod log;

pub use journal::{Journal, JournalOp};
pub use key::{cursor_prefix, key_id, EntryKey, EntryKind, ID_WIDTH};
pub use log::{EventLog, LogEntry, Removed, ScanControl, ScanRange, JOURNAL_FILE};

//! Ordered, append-only event log.

use super::journal::{Journal, JournalOp};
use super::key::{key_id, EntryKey, EntryKind};
use crate::error::{RelayError, Result};
use crate::types::{EventId, Position, RowEvent};
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// File name of the journal inside the storage directory.
pub const JOURNAL_FILE: &str = "events.journal";

/// What the scan callback wants next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanControl {
    /// Include this entry in the scanned range and keep going.
    Continue,
    /// End the scan before this entry; it is not part of the range.
    Stop,
    /// Caller cancellation. Nothing scanned counts as consumed.
    Abort,
}

/// Key range actually covered by a scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanRange {
    pub first: Option<Vec<u8>>,
    pub last: Option<Vec<u8>>,
    /// Number of entries included in the range.
    pub visited: usize,
}

/// A decoded log entry.
#[derive(Clone, Debug, PartialEq)]
pub enum LogEntry {
    Event(RowEvent),
    Position(Position),
}

impl LogEntry {
    /// Decode a stored value according to its key.
    pub fn decode(key: &EntryKey, value: &[u8]) -> Result<Self> {
        match key.kind {
            EntryKind::Event => rmp_serde::from_slice(value)
                .map(LogEntry::Event)
                .map_err(|e| RelayError::UndecodableEvent {
                    id: key.id,
                    message: e.to_string(),
                }),
            EntryKind::Position => Ok(LogEntry::Position(rmp_serde::from_slice(value)?)),
        }
    }
}

/// Counts of entries removed by a range delete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Removed {
    pub events: u64,
    pub markers: u64,
}

impl Removed {
    pub fn total(&self) -> u64 {
        self.events + self.markers
    }
}

/// Append-only log of row events and ingestion-position markers.
///
/// Entries live in an ordered skip list keyed by [`EntryKey`]. In
/// full-durability mode every mutation goes through a [`Journal`] first;
/// in memory mode nothing survives the process.
pub struct EventLog {
    entries: SkipMap<Vec<u8>, Vec<u8>>,

    journal: Option<Journal>,

    /// Highest assigned id. Scans never look past it, so a batch that is
    /// still being inserted stays invisible until the whole batch is in.
    sequence: AtomicU64,

    /// Serializes mutations so journal order equals map order.
    write_lock: Mutex<()>,

    /// One compaction at a time.
    compact_lock: Mutex<()>,
}

impl EventLog {
    /// A log that lives only in memory (reduced durability).
    pub fn in_memory() -> Self {
        Self {
            entries: SkipMap::new(),
            journal: None,
            sequence: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            compact_lock: Mutex::new(()),
        }
    }

    /// Open or create a journaled log in `dir`.
    pub fn open(dir: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let entries = SkipMap::new();
        let journal = Journal::open(dir.as_ref().join(JOURNAL_FILE), sync_interval, |op| {
            Self::apply(&entries, op);
        })?;

        let sequence = entries
            .back()
            .and_then(|entry| key_id(entry.key()))
            .map(|id| id.0)
            .unwrap_or(0);

        info!(entries = entries.len(), latest_id = sequence, "event log opened");

        Ok(Self {
            entries,
            journal: Some(journal),
            sequence: AtomicU64::new(sequence),
            write_lock: Mutex::new(()),
            compact_lock: Mutex::new(()),
        })
    }

    /// Whether entries survive a restart.
    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }

    /// Append events in one atomic batch, assigning each the next id.
    ///
    /// Nothing becomes visible if any event fails to encode or the journal
    /// write fails. Returns the events with their assigned ids.
    pub fn append(&self, events: Vec<RowEvent>) -> Result<Vec<RowEvent>> {
        if events.is_empty() {
            return Ok(events);
        }

        let _lock = self.write_lock.lock();
        let mut next = self.sequence.load(Ordering::Acquire);

        let mut batch = Vec::with_capacity(events.len());
        let mut stored = Vec::with_capacity(events.len());
        for mut event in events {
            next += 1;
            event.id = EventId(next);
            let key = EntryKey::event(event.id, event.alias.clone(), event.action).encode();
            let value = rmp_serde::to_vec_named(&event)?;
            batch.push((key, value));
            stored.push(event);
        }

        self.commit(batch, next)?;
        Ok(stored)
    }

    /// Record that the replication stream reached `position`.
    pub fn append_marker(&self, position: &Position) -> Result<EventId> {
        let _lock = self.write_lock.lock();
        let id = EventId(self.sequence.load(Ordering::Acquire) + 1);

        let key = EntryKey::position(id).encode();
        let value = rmp_serde::to_vec_named(position)?;
        self.commit(vec![(key, value)], id.0)?;
        Ok(id)
    }

    /// Journal, insert, then publish the new high-water mark.
    fn commit(&self, batch: Vec<(Vec<u8>, Vec<u8>)>, last_id: u64) -> Result<()> {
        let op = JournalOp::Put { entries: batch };
        if let Some(journal) = &self.journal {
            journal.append(&op)?;
        }
        Self::apply(&self.entries, op);
        self.sequence.store(last_id, Ordering::Release);
        Ok(())
    }

    /// Iterate entries in key order starting at or after `start`.
    ///
    /// At most `limit` entries are included. The callback decides per entry
    /// whether to include it ([`ScanControl::Continue`]), end the range before
    /// it ([`ScanControl::Stop`]), or abandon the scan ([`ScanControl::Abort`],
    /// surfaced as [`RelayError::Cancelled`]).
    pub fn scan_from<F>(&self, start: &[u8], limit: Option<usize>, mut visit: F) -> Result<ScanRange>
    where
        F: FnMut(&EntryKey, &[u8]) -> Result<ScanControl>,
    {
        let visible = self.sequence.load(Ordering::Acquire);
        let mut range = ScanRange::default();

        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Included(start), Bound::Unbounded);
        for entry in self.entries.range::<[u8], _>(bounds) {
            if limit.is_some_and(|max| range.visited >= max) {
                break;
            }

            let key = EntryKey::decode(entry.key())?;
            if key.id.0 > visible {
                break;
            }

            match visit(&key, entry.value().as_slice())? {
                ScanControl::Continue => {
                    if range.first.is_none() {
                        range.first = Some(entry.key().clone());
                    }
                    range.last = Some(entry.key().clone());
                    range.visited += 1;
                }
                ScanControl::Stop => break,
                ScanControl::Abort => return Err(RelayError::Cancelled),
            }
        }

        Ok(range)
    }

    /// Delete every entry with key <= `end` in one operation.
    pub fn delete_up_to(&self, end: &[u8]) -> Result<Removed> {
        self.delete_range(end, true)
    }

    /// Delete every entry with id < `id`.
    pub fn delete_below(&self, id: EventId) -> Result<Removed> {
        self.delete_range(&super::key::cursor_prefix(id), false)
    }

    fn delete_range(&self, end: &[u8], inclusive: bool) -> Result<Removed> {
        let _lock = self.write_lock.lock();

        let removed = Self::count_range(&self.entries, end, inclusive);
        if removed.total() == 0 {
            return Ok(removed);
        }

        let op = JournalOp::DeleteUpTo {
            end: end.to_vec(),
            inclusive,
        };
        if let Some(journal) = &self.journal {
            journal.append(&op)?;
        }
        Self::apply(&self.entries, op);

        debug!(events = removed.events, markers = removed.markers, "event log range deleted");
        Ok(removed)
    }

    /// Remove everything.
    pub fn clear(&self) -> Result<()> {
        let _lock = self.write_lock.lock();
        if let Some(journal) = &self.journal {
            journal.append(&JournalOp::Clear)?;
        }
        Self::apply(&self.entries, JournalOp::Clear);
        Ok(())
    }

    /// Number of stored entries (events and markers).
    pub fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Highest id handed out so far.
    pub fn latest_id(&self) -> EventId {
        EventId(self.sequence.load(Ordering::Acquire))
    }

    /// Never hand out an id at or below `id` again.
    pub fn seed_sequence(&self, id: EventId) {
        self.sequence.fetch_max(id.0, Ordering::AcqRel);
    }

    /// Rewrite the journal down to the live entries.
    pub fn compact(&self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };

        let _compacting = self.compact_lock.lock();
        let before = journal.size()?;

        // Appends are held off only while the live set is copied. Anything
        // committed after this point is carried over by the journal itself.
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = {
            let _lock = self.write_lock.lock();
            journal.begin_rewrite();
            self.entries
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect()
        };

        let live = journal.rewrite(snapshot)?;
        info!(live, bytes_before = before, bytes_after = journal.size()?, "event log compacted");
        Ok(())
    }

    /// Flush the journal to stable storage.
    pub fn sync(&self) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    /// The most recent position marker still in the log.
    pub fn last_marker(&self) -> Result<Option<(EventId, Position)>> {
        for entry in self.entries.iter().rev() {
            let key = EntryKey::decode(entry.key())?;
            if key.kind == EntryKind::Position {
                let position = rmp_serde::from_slice(entry.value())?;
                return Ok(Some((key.id, position)));
            }
        }
        Ok(None)
    }

    fn count_range(entries: &SkipMap<Vec<u8>, Vec<u8>>, end: &[u8], inclusive: bool) -> Removed {
        let upper = if inclusive {
            Bound::Included(end)
        } else {
            Bound::Excluded(end)
        };
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Unbounded, upper);

        let mut removed = Removed::default();
        for entry in entries.range::<[u8], _>(bounds) {
            match EntryKey::decode(entry.key()).map(|k| k.kind) {
                Ok(EntryKind::Position) => removed.markers += 1,
                _ => removed.events += 1,
            }
        }
        removed
    }

    fn apply(entries: &SkipMap<Vec<u8>, Vec<u8>>, op: JournalOp) {
        match op {
            JournalOp::Put { entries: batch } => {
                for (key, value) in batch {
                    entries.insert(key, value);
                }
            }
            JournalOp::DeleteUpTo { end, inclusive } => {
                let upper = if inclusive {
                    Bound::Included(end.as_slice())
                } else {
                    Bound::Excluded(end.as_slice())
                };
                let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Unbounded, upper);
                for entry in entries.range::<[u8], _>(bounds) {
                    entry.remove();
                }
            }
            JournalOp::Clear => entries.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::key::cursor_prefix;
    use crate::types::{Action, Row};
    use serde_json::json;
    use tempfile::TempDir;

    fn event(table: &str, action: Action, n: i64) -> RowEvent {
        let mut row = Row::new();
        row.insert("id".to_string(), json!(n));
        row.insert("label".to_string(), json!(format!("row-{n}")));
        RowEvent {
            id: EventId(0),
            schema: "shop".to_string(),
            table: table.to_string(),
            alias: format!("shop.{table}.00ff00ff00ff00ff"),
            action,
            previous_row: Row::new(),
            row,
            diff_cols: Default::default(),
        }
    }

    fn collect(log: &EventLog, from: EventId) -> Vec<LogEntry> {
        let mut out = Vec::new();
        log.scan_from(&cursor_prefix(from), None, |key, value| {
            out.push(LogEntry::decode(key, value)?);
            Ok(ScanControl::Continue)
        })
        .unwrap();
        out
    }

    #[test]
    fn test_append_assigns_ids() {
        let log = EventLog::in_memory();
        let stored = log
            .append(vec![event("orders", Action::Insert, 1), event("orders", Action::Insert, 2)])
            .unwrap();
        assert_eq!(stored[0].id, EventId(1));
        assert_eq!(stored[1].id, EventId(2));

        let marker = log.append_marker(&Position::new("bin.000001", 400)).unwrap();
        assert_eq!(marker, EventId(3));
        assert_eq!(log.latest_id(), EventId(3));
        assert_eq!(log.count(), 3);
    }

    #[test]
    fn test_scanned_event_equals_appended() {
        let log = EventLog::in_memory();
        let mut original = event("orders", Action::Update, 5);
        original.previous_row.insert("label".to_string(), json!("old"));
        original.diff_cols.insert("label".to_string());
        original.row.insert("price".to_string(), json!(12.5));
        original.row.insert("tags".to_string(), json!(["a", null, -3]));

        let stored = log.append(vec![original]).unwrap();
        let entries = collect(&log, EventId(1));
        assert_eq!(entries, vec![LogEntry::Event(stored[0].clone())]);
    }

    #[test]
    fn test_scan_stop_excludes_entry() {
        let log = EventLog::in_memory();
        log.append((1..=5).map(|n| event("orders", Action::Insert, n)).collect())
            .unwrap();

        let range = log
            .scan_from(&cursor_prefix(EventId(2)), None, |key, _| {
                Ok(if key.id.0 < 4 {
                    ScanControl::Continue
                } else {
                    ScanControl::Stop
                })
            })
            .unwrap();

        assert_eq!(range.visited, 2);
        assert_eq!(key_id(range.first.as_ref().unwrap()), Some(EventId(2)));
        assert_eq!(key_id(range.last.as_ref().unwrap()), Some(EventId(3)));
    }

    #[test]
    fn test_scan_limit_and_abort() {
        let log = EventLog::in_memory();
        log.append((1..=5).map(|n| event("orders", Action::Insert, n)).collect())
            .unwrap();

        let range = log
            .scan_from(&cursor_prefix(EventId(1)), Some(3), |_, _| Ok(ScanControl::Continue))
            .unwrap();
        assert_eq!(range.visited, 3);

        let aborted = log.scan_from(&cursor_prefix(EventId(1)), None, |_, _| Ok(ScanControl::Abort));
        assert!(matches!(aborted, Err(RelayError::Cancelled)));
        assert_eq!(log.count(), 5);
    }

    #[test]
    fn test_delete_up_to_counts_kinds() {
        let log = EventLog::in_memory();
        log.append(vec![event("orders", Action::Insert, 1)]).unwrap();
        log.append_marker(&Position::new("bin.000001", 10)).unwrap();
        log.append(vec![event("orders", Action::Delete, 2)]).unwrap();

        let boundary = EntryKey::position(EventId(2)).encode();
        let removed = log.delete_up_to(&boundary).unwrap();
        assert_eq!(removed, Removed { events: 1, markers: 1 });
        assert_eq!(log.count(), 1);

        let left = collect(&log, EventId(0));
        assert!(matches!(&left[0], LogEntry::Event(e) if e.id == EventId(3)));
    }

    #[test]
    fn test_delete_below() {
        let log = EventLog::in_memory();
        log.append((1..=4).map(|n| event("orders", Action::Insert, n)).collect())
            .unwrap();
        let removed = log.delete_below(EventId(3)).unwrap();
        assert_eq!(removed.events, 2);
        assert_eq!(collect(&log, EventId(0)).len(), 2);
    }

    #[test]
    fn test_journal_survives_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let log = EventLog::open(dir.path(), 1).unwrap();
            log.append((1..=4).map(|n| event("orders", Action::Insert, n)).collect())
                .unwrap();
            log.append_marker(&Position::new("bin.000003", 77)).unwrap();
            log.delete_up_to(&EntryKey::event(EventId(2), "x", Action::Insert).encode())
                .unwrap();
        }

        let log = EventLog::open(dir.path(), 1).unwrap();
        assert!(log.is_durable());
        assert_eq!(log.count(), 3);
        assert_eq!(log.latest_id(), EventId(5));

        let entries = collect(&log, EventId(0));
        assert!(matches!(&entries[0], LogEntry::Event(e) if e.id == EventId(3)));
        assert_eq!(
            entries[2],
            LogEntry::Position(Position::new("bin.000003", 77))
        );

        // Ids continue after the persisted high-water mark.
        let next = log.append(vec![event("orders", Action::Insert, 9)]).unwrap();
        assert_eq!(next[0].id, EventId(6));
    }

    #[test]
    fn test_compact_preserves_content() {
        let dir = TempDir::new().unwrap();

        {
            let log = EventLog::open(dir.path(), 10).unwrap();
            for n in 1..=20 {
                log.append(vec![event("orders", Action::Insert, n)]).unwrap();
            }
            log.delete_up_to(&cursor_prefix(EventId(16))).unwrap();
            log.compact().unwrap();
            log.sync().unwrap();
        }

        let log = EventLog::open(dir.path(), 10).unwrap();
        assert_eq!(log.count(), 5);
        assert_eq!(log.latest_id(), EventId(20));
    }

    #[test]
    fn test_failed_journal_write_keeps_later_appends() {
        let dir = TempDir::new().unwrap();

        {
            let log = EventLog::open(dir.path(), 1).unwrap();
            log.append(vec![event("orders", Action::Insert, 1)]).unwrap();

            log.journal().unwrap().fail_next_append_after(10);
            assert!(log.append(vec![event("orders", Action::Insert, 2)]).is_err());
            assert_eq!(log.count(), 1);
            assert_eq!(log.latest_id(), EventId(1));

            let stored = log.append(vec![event("orders", Action::Insert, 3)]).unwrap();
            assert_eq!(stored[0].id, EventId(2));
        }

        let log = EventLog::open(dir.path(), 1).unwrap();
        let rows: Vec<(EventId, serde_json::Value)> = collect(&log, EventId(0))
            .into_iter()
            .map(|entry| match entry {
                LogEntry::Event(e) => (e.id, e.row["id"].clone()),
                other => panic!("unexpected entry {other:?}"),
            })
            .collect();
        assert_eq!(rows, vec![(EventId(1), json!(1)), (EventId(2), json!(3))]);
        assert_eq!(log.latest_id(), EventId(2));
    }

    #[test]
    fn test_compact_concurrent_with_appends() {
        let dir = TempDir::new().unwrap();

        {
            let log = EventLog::open(dir.path(), 100).unwrap();
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    for n in 1..=200 {
                        log.append(vec![event("orders", Action::Insert, n)]).unwrap();
                    }
                });
                for _ in 0..10 {
                    log.compact().unwrap();
                }
            });
            log.compact().unwrap();
            log.sync().unwrap();
        }

        let log = EventLog::open(dir.path(), 100).unwrap();
        assert_eq!(log.count(), 200);
        assert_eq!(log.latest_id(), EventId(200));
    }

    #[test]
    fn test_last_marker() {
        let log = EventLog::in_memory();
        assert_eq!(log.last_marker().unwrap(), None);

        log.append_marker(&Position::new("binlog.000001", 10)).unwrap();
        log.append_marker(&Position::new("binlog.000001", 20)).unwrap();
        log.append(vec![event("orders", Action::Insert, 1)]).unwrap();

        assert_eq!(
            log.last_marker().unwrap(),
            Some((EventId(2), Position::new("binlog.000001", 20)))
        );
    }

    #[test]
    fn test_seed_sequence_is_monotonic() {
        let log = EventLog::in_memory();
        log.seed_sequence(EventId(100));
        log.seed_sequence(EventId(50));
        let stored = log.append(vec![event("orders", Action::Insert, 1)]).unwrap();
        assert_eq!(stored[0].id, EventId(101));
    }
}

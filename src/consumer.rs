//! The consumption loop.
//!
//! Each trigger fire runs one cycle: drain the log from the consume cursor
//! into a single-rule batch, hand it to the rule's processor, and only on
//! success acknowledge it by advancing the cursor and range-deleting what
//! was scanned. A failed cycle changes nothing, so the same events are
//! offered again on the next fire.

use crate::checkpoint::CheckpointManager;
use crate::error::{RelayError, Result};
use crate::events::{cursor_prefix, EntryKind, EventLog, LogEntry, ScanControl};
use crate::processor::ProcessorRegistry;
use crate::rules::{RuleIndex, RuleSet};
use crate::shutdown::Shutdown;
use crate::trigger::Trigger;
use crate::types::{EventId, Position, RowEvent};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of one consumption cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Call the batch was dispatched to, if any.
    pub call: Option<String>,
    /// Events handed to the processor.
    pub dispatched: usize,
    /// Events with no matching rule, dropped.
    pub skipped: usize,
    /// Position markers passed over.
    pub markers: usize,
    /// Id range covered by the acknowledged scan.
    pub first_id: Option<EventId>,
    pub last_id: Option<EventId>,
    /// Entries removed from the log.
    pub removed: u64,
}

impl CycleReport {
    /// True when the cycle found nothing to do.
    pub fn is_idle(&self) -> bool {
        self.last_id.is_none()
    }
}

/// Result of the drain step, before anything is acknowledged.
#[derive(Default)]
struct Drained {
    rule: Option<RuleIndex>,
    batch: Vec<RowEvent>,
    skipped: usize,
    markers: usize,
    position: Option<Position>,
    first_id: Option<EventId>,
    last_key: Option<Vec<u8>>,
    last_id: Option<EventId>,
}

/// Drains the event log into processors, one single-rule batch per cycle.
pub struct Consumer {
    log: Arc<EventLog>,
    checkpoint: Arc<CheckpointManager>,
    trigger: Arc<Trigger>,
    rules: RuleSet,
    processors: ProcessorRegistry,
    max_batch_size: usize,
}

impl Consumer {
    pub fn new(
        log: Arc<EventLog>,
        checkpoint: Arc<CheckpointManager>,
        trigger: Arc<Trigger>,
        rules: RuleSet,
        processors: ProcessorRegistry,
        max_batch_size: usize,
    ) -> Self {
        Self {
            log,
            checkpoint,
            trigger,
            rules,
            processors,
            max_batch_size: max_batch_size.max(1),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Trigger callback: run one cycle, log its failure, re-arm.
    pub fn on_fire(&self, fire: u64, shutdown: &Shutdown) {
        match self.run_cycle(shutdown) {
            Ok(report) if report.is_idle() => {}
            Ok(report) => debug!(fire, ?report, "consumption cycle finished"),
            Err(RelayError::Cancelled) => debug!(fire, "consumption cycle cancelled during drain"),
            Err(e) => error!(fire, error = %e, "consumption cycle failed"),
        }
    }

    /// Run one check / drain / dispatch / acknowledge / re-arm cycle.
    ///
    /// Cancellation is honoured only while draining. Once a batch has been
    /// handed to its processor the cycle runs to completion.
    pub fn run_cycle(&self, shutdown: &Shutdown) -> Result<CycleReport> {
        if self.checkpoint.event_count() == 0 {
            return Ok(CycleReport::default());
        }

        let result = self.drain(shutdown).and_then(|drained| self.dispatch_and_ack(drained));

        self.trigger.on_count_changed(self.checkpoint.event_count());
        result
    }

    fn drain(&self, shutdown: &Shutdown) -> Result<Drained> {
        let cursor = self.checkpoint.next_consume_event_id();
        let mut drained = Drained::default();
        let mut examined = 0usize;

        self.log.scan_from(&cursor_prefix(cursor), None, |key, value| {
            if shutdown.is_cancelled() {
                return Ok(ScanControl::Abort);
            }

            match key.kind {
                EntryKind::Position => {
                    if let LogEntry::Position(position) = LogEntry::decode(key, value)? {
                        drained.position = Some(position);
                    }
                    drained.markers += 1;
                }
                EntryKind::Event => {
                    if examined >= self.max_batch_size {
                        return Ok(ScanControl::Stop);
                    }

                    let LogEntry::Event(event) = LogEntry::decode(key, value)? else {
                        return Err(RelayError::InvalidKey(format!("event key {} holds a marker", key.id)));
                    };

                    match self.rules.match_rule(&event.schema, &event.table) {
                        None => {
                            debug!(id = %event.id, schema = %event.schema, table = %event.table, "no matching rule, skipping");
                            drained.skipped += 1;
                        }
                        Some((index, _)) if drained.rule.is_some_and(|current| current != index) => {
                            return Ok(ScanControl::Stop);
                        }
                        Some((index, _)) => {
                            drained.rule = Some(index);
                            drained.batch.push(event);
                        }
                    }
                    examined += 1;
                }
            }

            drained.first_id.get_or_insert(key.id);
            drained.last_id = Some(key.id);
            Ok(ScanControl::Continue)
        })
        .map(|range| {
            drained.last_key = range.last;
            drained
        })
    }

    fn dispatch_and_ack(&self, drained: Drained) -> Result<CycleReport> {
        let (Some(last_key), Some(last_id)) = (drained.last_key, drained.last_id) else {
            // The count was stale: everything below the cursor is already gone.
            debug!(count = self.checkpoint.event_count(), "nothing to drain, resyncing pending count");
            self.checkpoint.set_event_count(self.log.count());
            return Ok(CycleReport::default());
        };

        let mut report = CycleReport {
            skipped: drained.skipped,
            markers: drained.markers,
            first_id: drained.first_id,
            last_id: Some(last_id),
            ..CycleReport::default()
        };

        if let Some(rule) = drained.rule.and_then(|index| self.rules.get(index)) {
            let first = drained.batch.first().map(|e| e.id);
            let last = drained.batch.last().map(|e| e.id);

            if let Err(e) = self.processors.invoke(&rule.call, &drained.batch, &rule.arguments) {
                error!(
                    call = %rule.call,
                    target = %rule.target(),
                    first_id = ?first,
                    last_id = ?last,
                    size = drained.batch.len(),
                    error = %e,
                    "batch processing failed, will redeliver"
                );
                return Err(e);
            }

            report.call = Some(rule.call.clone());
            report.dispatched = drained.batch.len();
        }

        self.checkpoint.update_next_consume_event_id(last_id.next());
        if let Some(position) = drained.position {
            self.checkpoint.update_consumption_position(position);
        }

        let removed = self.log.delete_up_to(&last_key).map_err(|e| {
            warn!(last_id = %last_id, error = %e, "acknowledge delete failed, range will be purged on restart");
            e
        })?;
        self.checkpoint.add_event_count(-(removed.total() as i64));
        report.removed = removed.total();

        info!(
            call = report.call.as_deref().unwrap_or("-"),
            dispatched = report.dispatched,
            skipped = report.skipped,
            markers = report.markers,
            first_id = ?report.first_id,
            last_id = %last_id,
            "batch acknowledged"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointOptions, StorageMode};
    use crate::error::ProcessError;
    use crate::rules::Rule;
    use crate::types::{Action, Row};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    type Calls = Arc<Mutex<Vec<(String, Vec<u64>)>>>;

    struct Fixture {
        _dir: TempDir,
        log: Arc<EventLog>,
        checkpoint: Arc<CheckpointManager>,
        consumer: Consumer,
        calls: Calls,
    }

    fn event(table: &str) -> RowEvent {
        let mut row = Row::new();
        row.insert("id".into(), serde_json::json!(1));
        RowEvent {
            id: EventId(0),
            schema: "shop".into(),
            table: table.into(),
            alias: format!("shop.{table}.00"),
            action: Action::Insert,
            previous_row: Row::new(),
            row,
            diff_cols: Default::default(),
        }
    }

    fn recorder(calls: &Calls, name: &'static str) -> impl Fn(&[RowEvent], &[String]) -> std::result::Result<(), ProcessError> {
        let calls = Arc::clone(calls);
        move |batch: &[RowEvent], _: &[String]| -> std::result::Result<(), ProcessError> {
            calls.lock().push((name.to_string(), batch.iter().map(|e| e.id.0).collect()));
            Ok(())
        }
    }

    fn fixture(max_batch_size: usize, fail_b: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(EventLog::in_memory());
        let checkpoint = Arc::new(
            CheckpointManager::initial(
                dir.path(),
                CheckpointOptions {
                    mode: StorageMode::Memory,
                    flush_interval: Duration::from_secs(3600),
                    flush_on_close: false,
                },
                0,
            )
            .unwrap(),
        );
        let trigger = Arc::new(Trigger::new(10, Duration::from_secs(60)));

        let calls: Calls = Arc::default();
        let mut processors = ProcessorRegistry::new();
        processors.register("sink_a", recorder(&calls, "sink_a"));
        if fail_b {
            processors.register("sink_b", |_: &[RowEvent], _: &[String]| -> std::result::Result<(), ProcessError> {
                Err("downstream unavailable".into())
            });
        } else {
            processors.register("sink_b", recorder(&calls, "sink_b"));
        }

        let rules = RuleSet::new(vec![Rule::new("shop", "a", "sink_a"), Rule::new("shop", "b", "sink_b")]);
        let consumer = Consumer::new(
            Arc::clone(&log),
            Arc::clone(&checkpoint),
            trigger,
            rules,
            processors,
            max_batch_size,
        );

        Fixture {
            _dir: dir,
            log,
            checkpoint,
            consumer,
            calls,
        }
    }

    impl Fixture {
        fn append(&self, tables: &[&str]) {
            let stored = self
                .log
                .append(tables.iter().map(|t| event(t)).collect())
                .unwrap();
            self.checkpoint.observe_latest_event_id(stored.last().unwrap().id);
            self.checkpoint.add_event_count(stored.len() as i64);
        }

        fn marker(&self, file: &str, offset: u64) {
            let id = self.log.append_marker(&Position::new(file, offset)).unwrap();
            self.checkpoint.observe_latest_event_id(id);
            self.checkpoint.add_event_count(1);
        }
    }

    #[test]
    fn test_batches_never_span_rules() {
        let f = fixture(10, false);
        f.append(&["a", "a", "b", "a", "b"]);
        let shutdown = Shutdown::new();

        while !f.consumer.run_cycle(&shutdown).unwrap().is_idle() {}

        assert_eq!(
            *f.calls.lock(),
            vec![
                ("sink_a".to_string(), vec![1, 2]),
                ("sink_b".to_string(), vec![3]),
                ("sink_a".to_string(), vec![4]),
                ("sink_b".to_string(), vec![5]),
            ]
        );
        assert_eq!(f.log.count(), 0);
        assert_eq!(f.checkpoint.event_count(), 0);
        assert_eq!(f.checkpoint.next_consume_event_id(), EventId(6));
    }

    #[test]
    fn test_failed_dispatch_changes_nothing() {
        let f = fixture(10, true);
        f.append(&["b", "b"]);
        let shutdown = Shutdown::new();

        let next_before = f.checkpoint.next_consume_event_id();
        let count_before = f.log.count();

        let err = f.consumer.run_cycle(&shutdown).unwrap_err();
        assert!(matches!(err, RelayError::Processing { .. }));
        assert_eq!(f.checkpoint.next_consume_event_id(), next_before);
        assert_eq!(f.log.count(), count_before);
        assert_eq!(f.checkpoint.event_count(), 2);

        // Redelivered on the next cycle.
        assert!(f.consumer.run_cycle(&shutdown).is_err());
        assert_eq!(f.log.count(), count_before);
    }

    #[test]
    fn test_unmatched_events_are_dropped_without_dispatch() {
        let f = fixture(10, false);
        f.append(&["audit", "audit"]);
        let shutdown = Shutdown::new();

        let report = f.consumer.run_cycle(&shutdown).unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.call, None);
        assert!(f.calls.lock().is_empty());
        assert_eq!(f.log.count(), 0);
        assert_eq!(f.checkpoint.next_consume_event_id(), EventId(3));
    }

    #[test]
    fn test_markers_advance_consumption_position() {
        let f = fixture(10, false);
        f.append(&["a"]);
        f.marker("binlog.000001", 400);
        f.append(&["a"]);
        f.marker("binlog.000001", 900);
        let shutdown = Shutdown::new();

        let report = f.consumer.run_cycle(&shutdown).unwrap();
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.markers, 2);
        assert_eq!(report.removed, 4);
        assert_eq!(f.checkpoint.consumption_position(), Position::new("binlog.000001", 900));
        assert_eq!(f.checkpoint.event_count(), 0);
    }

    #[test]
    fn test_batch_size_limits_examined_events_not_markers() {
        let f = fixture(2, false);
        f.append(&["a"]);
        f.marker("binlog.000001", 10);
        f.marker("binlog.000001", 20);
        f.append(&["a", "a"]);
        let shutdown = Shutdown::new();

        let first = f.consumer.run_cycle(&shutdown).unwrap();
        assert_eq!(first.dispatched, 2);
        assert_eq!(first.markers, 2);

        let second = f.consumer.run_cycle(&shutdown).unwrap();
        assert_eq!(second.dispatched, 1);
        assert_eq!(*f.calls.lock(), vec![
            ("sink_a".to_string(), vec![1, 4]),
            ("sink_a".to_string(), vec![5]),
        ]);
    }

    #[test]
    fn test_cancelled_drain_acknowledges_nothing() {
        let f = fixture(10, false);
        f.append(&["a", "a"]);
        let shutdown = Shutdown::new();
        shutdown.cancel();

        assert!(matches!(f.consumer.run_cycle(&shutdown), Err(RelayError::Cancelled)));
        assert!(f.calls.lock().is_empty());
        assert_eq!(f.log.count(), 2);
        assert_eq!(f.checkpoint.next_consume_event_id(), EventId(1));
    }

    #[test]
    fn test_zero_count_is_a_no_op() {
        let f = fixture(10, false);
        let report = f.consumer.run_cycle(&Shutdown::new()).unwrap();
        assert!(report.is_idle());
    }
}

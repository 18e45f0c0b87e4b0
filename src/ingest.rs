//! Ingestion adapter: replication callbacks -> event log.

use crate::checkpoint::CheckpointManager;
use crate::error::{RelayError, Result};
use crate::events::EventLog;
use crate::trigger::Trigger;
use crate::types::{ColumnMeta, EventId, Position, RowChange, RowEvent, TableMeta};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Cached alias for one table, valid while its column layout is unchanged.
struct CachedAlias {
    columns: Vec<ColumnMeta>,
    alias: Arc<str>,
}

/// Turns decoded replication notifications into log entries.
///
/// Appends never wait on the consumption loop; the only shared lock is the
/// log's short write lock.
pub struct IngestionAdapter {
    log: Arc<EventLog>,
    checkpoint: Arc<CheckpointManager>,
    trigger: Arc<Trigger>,
    aliases: Mutex<HashMap<String, CachedAlias>>,
}

impl IngestionAdapter {
    pub fn new(log: Arc<EventLog>, checkpoint: Arc<CheckpointManager>, trigger: Arc<Trigger>) -> Self {
        Self {
            log,
            checkpoint,
            trigger,
            aliases: Mutex::new(HashMap::new()),
        }
    }

    /// Alias for `table`, recomputed only when its column layout changes.
    pub fn alias(&self, table: &TableMeta) -> Arc<str> {
        let mut aliases = self.aliases.lock();
        let key = table.qualified_name();

        if let Some(cached) = aliases.get(&key) {
            if cached.columns == table.columns {
                return Arc::clone(&cached.alias);
            }
        }

        let alias: Arc<str> = table.fingerprint().into();
        debug!(table = %key, alias = %alias, "table alias computed");
        aliases.insert(
            key,
            CachedAlias {
                columns: table.columns.clone(),
                alias: Arc::clone(&alias),
            },
        );
        alias
    }

    /// Record one row change.
    pub fn on_row_change(&self, table: &TableMeta, change: RowChange) -> Result<EventId> {
        let ids = self.on_rows(table, vec![change])?;
        ids.into_iter()
            .next()
            .ok_or_else(|| RelayError::Corruption("append returned no id".into()))
    }

    /// Record every row of one replication event as a single atomic append.
    pub fn on_rows(&self, table: &TableMeta, changes: Vec<RowChange>) -> Result<Vec<EventId>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let alias = self.alias(table);
        let events: Vec<RowEvent> = changes
            .into_iter()
            .map(|change| RowEvent::from_change(table, &alias, change))
            .collect();

        let stored = self.log.append(events).map_err(|e| {
            error!(table = %table.qualified_name(), error = %e, "event append failed");
            e
        })?;

        let ids: Vec<EventId> = stored.iter().map(|event| event.id).collect();
        if let Some(last) = ids.last() {
            self.checkpoint.observe_latest_event_id(*last);
        }
        let count = self.checkpoint.add_event_count(ids.len() as i64);
        trace!(table = %table.qualified_name(), appended = ids.len(), count, "rows ingested");

        self.trigger.on_count_changed(count);
        Ok(ids)
    }

    /// Record that the stream reached `position`, with or without rows.
    pub fn on_position_advance(&self, position: Position) -> Result<EventId> {
        let id = self.log.append_marker(&position)?;
        self.checkpoint.observe_latest_event_id(id);
        self.checkpoint.update_ingestion_position(position);
        let count = self.checkpoint.add_event_count(1);
        self.trigger.on_count_changed(count);
        Ok(id)
    }

    pub fn on_stream_error(&self, err: &RelayError) {
        error!(
            error = %err,
            ingestion = %self.checkpoint.ingestion_position(),
            "replication stream error"
        );
    }

    /// Position the replication client should (re)start from.
    ///
    /// Startup reconciliation already folds the storage mode into the
    /// ingestion position, so it is correct for both modes and for
    /// in-process reconnects. A configured position only wins when it is
    /// ahead of what was recorded.
    pub fn resume_position(&self, configured: Option<&Position>) -> Position {
        let recorded = self.checkpoint.ingestion_position();
        let position = match configured {
            Some(configured) if *configured > recorded => configured.clone(),
            _ => recorded,
        };
        info!(position = %position, mode = %self.checkpoint.mode(), "resuming replication");
        position
    }

    pub fn checkpoint(&self) -> &CheckpointManager {
        &self.checkpoint
    }
}

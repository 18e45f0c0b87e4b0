//! The relay facade tying all components together.

use crate::checkpoint::{CheckpointManager, StorageMode};
use crate::config::RelayConfig;
use crate::consumer::Consumer;
use crate::error::{RelayError, Result};
use crate::events::EventLog;
use crate::ingest::IngestionAdapter;
use crate::processor::ProcessorRegistry;
use crate::replication::{run_replication, ReplicationSource};
use crate::shutdown::Shutdown;
use crate::trigger::Trigger;
use crate::types::{EventId, Position};
use crossbeam_channel::{select, tick};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Name of the lock file inside the storage directory.
pub const LOCK_FILE: &str = "relay.lock";

/// Point-in-time view of the relay's progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayStats {
    pub mode: StorageMode,
    /// Approximate entries (events and markers) awaiting consumption.
    pub pending: u64,
    /// Entries actually held by the log.
    pub log_entries: u64,
    pub latest_event_id: EventId,
    pub next_consume_event_id: EventId,
    pub ingestion_position: Position,
    pub consumption_position: Position,
    /// Consumption cycles started by the trigger.
    pub fires: u64,
}

/// A running CDC relay: event log, checkpoint, trigger, and the loops
/// between them.
///
/// One relay owns its storage directory exclusively.
pub struct Relay {
    config: RelayConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: Arc<EventLog>,

    checkpoint: Arc<CheckpointManager>,

    trigger: Arc<Trigger>,

    ingestor: Arc<IngestionAdapter>,

    consumer: Consumer,
}

impl Relay {
    /// Open the storage directory and recover state from the last run.
    ///
    /// Fails if the configuration is invalid, the directory cannot be
    /// opened, or another relay holds it.
    pub fn open(config: RelayConfig, processors: ProcessorRegistry) -> Result<Self> {
        config.validate(&processors)?;

        let dir = config.storage.dir.clone();
        fs::create_dir_all(&dir)?;
        let lock_file = Self::acquire_lock(&dir)?;

        let log = Arc::new(match config.storage.mode() {
            StorageMode::File => EventLog::open(&dir, config.storage.journal_sync_interval)?,
            StorageMode::Memory => EventLog::in_memory(),
        });

        let checkpoint = Arc::new(CheckpointManager::initial(
            &dir,
            config.storage.checkpoint_options(),
            log.count(),
        )?);

        if log.is_durable() {
            // A saved record must never point past what the journal holds.
            let journal = Arc::clone(&log);
            checkpoint.set_pre_flush(Box::new(move || journal.sync()));
        }

        Self::recover(&log, &checkpoint)?;

        let trigger = Arc::new(Trigger::new(config.task.max_batch_size, config.task.max_wait()));
        let ingestor = Arc::new(IngestionAdapter::new(
            Arc::clone(&log),
            Arc::clone(&checkpoint),
            Arc::clone(&trigger),
        ));
        let consumer = Consumer::new(
            Arc::clone(&log),
            Arc::clone(&checkpoint),
            Arc::clone(&trigger),
            config.task.rule_set(),
            processors,
            usize::try_from(config.task.max_batch_size).unwrap_or(usize::MAX),
        );

        info!(
            dir = %dir.display(),
            mode = %checkpoint.mode(),
            rules = consumer.rules().len(),
            pending = checkpoint.event_count(),
            "relay opened"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            checkpoint,
            trigger,
            ingestor,
            consumer,
        })
    }

    /// Line the log and the checkpoint up after a restart.
    fn recover(log: &EventLog, checkpoint: &CheckpointManager) -> Result<()> {
        // Ids are never reused, whichever side saw the higher one.
        let latest = checkpoint.observe_latest_event_id(log.latest_id());
        log.seed_sequence(latest);

        // With a journal, the newest marker it holds is where ingestion
        // really stopped, whichever way it differs from the saved record.
        if log.is_durable() {
            if let Some((id, position)) = log.last_marker()? {
                let saved = checkpoint.ingestion_position();
                if position < saved {
                    warn!(id = %id, saved = %saved, journal = %position, "checkpoint ahead of journal, resuming from journal");
                    checkpoint.update_ingestion_position(position);
                } else if position > saved {
                    info!(id = %id, position = %position, "ingestion position recovered from log");
                    checkpoint.update_ingestion_position(position);
                }
            }
        }

        // Acknowledged before the crash but not yet deleted.
        let purged = log.delete_below(checkpoint.next_consume_event_id())?;
        if purged.total() > 0 {
            warn!(
                events = purged.events,
                markers = purged.markers,
                next_id = %checkpoint.next_consume_event_id(),
                "purged acknowledged entries left by previous run"
            );
        }

        checkpoint.set_event_count(log.count());
        Ok(())
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = File::create(dir.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| RelayError::Locked)?;
        Ok(lock_file)
    }

    /// Run the trigger loop and background maintenance until `shutdown`
    /// is cancelled. A consumption cycle in its dispatch step is allowed to
    /// finish before this returns.
    pub fn run(&self, shutdown: &Shutdown) -> Result<()> {
        thread::scope(|scope| -> Result<()> {
            let maintenance = thread::Builder::new()
                .name("relay-maintenance".into())
                .spawn_scoped(scope, || self.maintain(shutdown))?;

            // Service whatever backlog the previous run left behind.
            self.trigger.on_count_changed(self.checkpoint.event_count());
            self.trigger.run(shutdown, |fire, shutdown| self.consumer.on_fire(fire, shutdown));

            if maintenance.join().is_err() {
                error!("maintenance thread panicked");
            }
            Ok(())
        })
    }

    /// Like [`Relay::run`], with `source` streaming into the relay on its
    /// own thread.
    pub fn run_with_source<S>(&self, source: &mut S, shutdown: &Shutdown) -> Result<()>
    where
        S: ReplicationSource + ?Sized,
    {
        thread::scope(|scope| -> Result<()> {
            let replication = thread::Builder::new()
                .name("relay-replication".into())
                .spawn_scoped(scope, || {
                    run_replication(
                        source,
                        &self.ingestor,
                        self.config.task.start_position.as_ref(),
                        shutdown,
                        self.config.task.retry_backoff(),
                    )
                })?;

            let result = self.run(shutdown);

            match replication.join() {
                Ok(Err(e)) => error!(error = %e, "replication loop failed"),
                Err(_) => error!("replication thread panicked"),
                Ok(Ok(())) => {}
            }
            result
        })
    }

    fn maintain(&self, shutdown: &Shutdown) {
        let ticker = tick(self.config.storage.compaction_interval());
        loop {
            select! {
                recv(ticker) -> _ => {
                    if let Err(e) = self.log.sync() {
                        error!(error = %e, "event log sync failed");
                    }
                    if let Err(e) = self.log.compact() {
                        error!(error = %e, "event log compaction failed");
                    }
                }
                recv(shutdown.receiver()) -> _ => break,
            }
        }
    }

    /// Entry point for replication callbacks.
    pub fn ingestor(&self) -> &Arc<IngestionAdapter> {
        &self.ingestor
    }

    pub fn checkpoint(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    /// Run one consumption cycle on the caller's thread.
    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            mode: self.checkpoint.mode(),
            pending: self.checkpoint.event_count(),
            log_entries: self.log.count(),
            latest_event_id: self.checkpoint.latest_event_id(),
            next_consume_event_id: self.checkpoint.next_consume_event_id(),
            ingestion_position: self.checkpoint.ingestion_position(),
            consumption_position: self.checkpoint.consumption_position(),
            fires: self.trigger.fire_count(),
        }
    }

    /// Sync the log and close the checkpoint. The lock is released when
    /// the relay is dropped.
    pub fn close(self) -> Result<()> {
        let synced = self.log.sync();
        let closed = self.checkpoint.close();
        info!(stats = ?self.stats(), "relay closed");
        synced.and(closed)
    }
}

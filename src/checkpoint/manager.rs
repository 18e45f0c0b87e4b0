//! Checkpoint manager: atomic counters and positions, flushed on a timer.

use super::state::{reconcile, CheckpointState, StorageMode};
use crate::error::Result;
use crate::types::{EventId, Position, Timestamp};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// File name of the checkpoint record inside the storage directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Options for [`CheckpointManager::initial`].
#[derive(Clone, Debug)]
pub struct CheckpointOptions {
    pub mode: StorageMode,
    /// How often the in-memory state is written to disk.
    pub flush_interval: Duration,
    /// Write the state one last time on close.
    pub flush_on_close: bool,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            mode: StorageMode::File,
            flush_interval: Duration::from_secs(30),
            flush_on_close: false,
        }
    }
}

/// Runs before every checkpoint write; an error skips the write.
pub type PreFlushHook = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// State shared with the flusher thread.
struct Shared {
    path: PathBuf,
    file: Mutex<Option<File>>,
    mode: StorageMode,

    ingestion_position: RwLock<Position>,
    consumption_position: RwLock<Position>,
    latest_event_id: AtomicU64,
    next_consume_event_id: AtomicU64,
    /// Approximate; may briefly dip below zero under concurrent updates.
    event_count: AtomicI64,

    /// Set on every mutation, cleared by a successful flush.
    dirty: AtomicBool,

    pre_flush: RwLock<Option<PreFlushHook>>,
}

struct Flusher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the checkpoint record for the lifetime of the process.
///
/// Mutations update memory only; a background thread writes the record to
/// disk every `flush_interval`. A crash loses at most one interval.
pub struct CheckpointManager {
    shared: Arc<Shared>,
    flusher: Mutex<Option<Flusher>>,
    flush_on_close: bool,
}

impl CheckpointManager {
    /// Open (or create) the record in `dir`, reconcile it for this run's
    /// mode, and start the periodic flush.
    ///
    /// An unreadable or corrupt record is logged and treated as a cold start.
    pub fn initial(
        dir: impl AsRef<Path>,
        options: CheckpointOptions,
        event_count_hint: u64,
    ) -> Result<Self> {
        let path = dir.as_ref().join(CHECKPOINT_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let saved = Self::load(&mut file, &path);
        let cold = saved.is_none();
        let state = reconcile(
            saved.unwrap_or_else(|| CheckpointState::cold(options.mode)),
            options.mode,
        );

        info!(
            path = %path.display(),
            cold,
            mode = %state.mode,
            ingestion = %state.ingestion_position,
            consumption = %state.consumption_position,
            latest_id = state.latest_event_id.0,
            next_id = state.next_consume_event_id.0,
            "checkpoint loaded"
        );

        let shared = Arc::new(Shared {
            path,
            file: Mutex::new(Some(file)),
            mode: options.mode,
            ingestion_position: RwLock::new(state.ingestion_position),
            consumption_position: RwLock::new(state.consumption_position),
            latest_event_id: AtomicU64::new(state.latest_event_id.0),
            next_consume_event_id: AtomicU64::new(state.next_consume_event_id.0),
            event_count: AtomicI64::new(event_count_hint as i64),
            dirty: AtomicBool::new(true),
            pre_flush: RwLock::new(None),
        });

        let flusher = Self::spawn_flusher(Arc::clone(&shared), options.flush_interval)?;

        Ok(Self {
            shared,
            flusher: Mutex::new(Some(flusher)),
            flush_on_close: options.flush_on_close,
        })
    }

    fn load(file: &mut File, path: &Path) -> Option<CheckpointState> {
        let mut buf = Vec::new();
        if let Err(e) = file.seek(SeekFrom::Start(0)).and_then(|_| file.read_to_end(&mut buf)) {
            warn!(path = %path.display(), error = %e, "checkpoint unreadable, starting cold");
            return None;
        }
        if buf.is_empty() {
            return None;
        }
        match serde_json::from_slice(&buf) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "checkpoint corrupt, starting cold");
                None
            }
        }
    }

    fn spawn_flusher(shared: Arc<Shared>, interval: Duration) -> Result<Flusher> {
        let (stop, stopped) = bounded::<()>(1);
        let ticker = tick(interval.max(Duration::from_millis(1)));

        let handle = thread::Builder::new()
            .name("checkpoint-flush".into())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => {
                        if let Err(e) = shared.flush() {
                            error!(path = %shared.path.display(), error = %e, "checkpoint flush failed");
                        }
                    }
                    recv(stopped) -> _ => break,
                }
            })?;

        Ok(Flusher { stop, handle })
    }

    /// Make everything the next record will describe durable first.
    ///
    /// The hook runs after the state is captured and before it is written,
    /// so the record never gets ahead of what the hook persisted.
    pub fn set_pre_flush(&self, hook: PreFlushHook) {
        *self.shared.pre_flush.write() = Some(hook);
    }

    // --- Counters ---

    /// Bump the sequence high-water mark.
    pub fn add_latest_event_id(&self, delta: u64) -> EventId {
        let id = self.shared.latest_event_id.fetch_add(delta, Ordering::AcqRel) + delta;
        self.shared.touch();
        EventId(id)
    }

    /// Raise the high-water mark to at least `id`.
    pub fn observe_latest_event_id(&self, id: EventId) -> EventId {
        let prev = self.shared.latest_event_id.fetch_max(id.0, Ordering::AcqRel);
        self.shared.touch();
        EventId(prev.max(id.0))
    }

    /// Adjust the approximate pending count.
    pub fn add_event_count(&self, delta: i64) -> u64 {
        let count = self.shared.event_count.fetch_add(delta, Ordering::AcqRel) + delta;
        self.shared.touch();
        count.max(0) as u64
    }

    /// Overwrite the approximate pending count.
    pub fn set_event_count(&self, count: u64) {
        self.shared.event_count.store(count as i64, Ordering::Release);
        self.shared.touch();
    }

    // --- Positions ---

    pub fn update_ingestion_position(&self, position: Position) {
        *self.shared.ingestion_position.write() = position;
        self.shared.touch();
    }

    /// Advance the consumption position. Returns false (and changes nothing)
    /// if `position` is behind the current one.
    pub fn update_consumption_position(&self, position: Position) -> bool {
        let mut current = self.shared.consumption_position.write();
        if position < *current {
            debug!(current = %*current, rejected = %position, "consumption position would regress");
            return false;
        }
        *current = position;
        drop(current);
        self.shared.touch();
        true
    }

    pub fn update_next_consume_event_id(&self, id: EventId) {
        self.shared.next_consume_event_id.store(id.0, Ordering::Release);
        // Keep `next <= latest + 1` even if the producer has not reported yet.
        self.shared
            .latest_event_id
            .fetch_max(id.0.saturating_sub(1), Ordering::AcqRel);
        self.shared.touch();
    }

    // --- Reads ---

    pub fn ingestion_position(&self) -> Position {
        self.shared.ingestion_position.read().clone()
    }

    pub fn consumption_position(&self) -> Position {
        self.shared.consumption_position.read().clone()
    }

    pub fn latest_event_id(&self) -> EventId {
        EventId(self.shared.latest_event_id.load(Ordering::Acquire))
    }

    pub fn next_consume_event_id(&self) -> EventId {
        EventId(self.shared.next_consume_event_id.load(Ordering::Acquire))
    }

    pub fn event_count(&self) -> u64 {
        self.shared.event_count.load(Ordering::Acquire).max(0) as u64
    }

    pub fn mode(&self) -> StorageMode {
        self.shared.mode
    }

    /// Where the replication client should resume from in this mode.
    pub fn resume_position(&self) -> Position {
        match self.shared.mode {
            StorageMode::File => self.ingestion_position(),
            StorageMode::Memory => self.consumption_position(),
        }
    }

    pub fn snapshot(&self) -> CheckpointState {
        self.shared.snapshot()
    }

    /// Write the current state to disk now.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    /// Stop the flush timer and release the file.
    ///
    /// The state is only written first when `flush_on_close` is set;
    /// otherwise whatever the last periodic flush wrote stays on disk.
    pub fn close(&self) -> Result<()> {
        self.stop_flusher();

        let result = if self.flush_on_close {
            self.shared.flush()
        } else {
            Ok(())
        };

        self.shared.file.lock().take();
        result
    }

    fn stop_flusher(&self) {
        if let Some(flusher) = self.flusher.lock().take() {
            let _ = flusher.stop.send(());
            let _ = flusher.handle.join();
        }
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        self.stop_flusher();
    }
}

impl Shared {
    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn snapshot(&self) -> CheckpointState {
        CheckpointState {
            ingestion_position: self.ingestion_position.read().clone(),
            consumption_position: self.consumption_position.read().clone(),
            latest_event_id: EventId(self.latest_event_id.load(Ordering::Acquire)),
            next_consume_event_id: EventId(self.next_consume_event_id.load(Ordering::Acquire)),
            event_count: self.event_count.load(Ordering::Acquire).max(0) as u64,
            mode: self.mode,
            saved_at: Timestamp::now(),
        }
    }

    fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let state = self.snapshot();
        let result = self.run_pre_flush().and_then(|()| self.write(&state));
        if result.is_err() {
            // Retry on the next tick.
            self.touch();
        } else {
            info!(
                consumption = %state.consumption_position,
                ingestion = %state.ingestion_position,
                latest_id = state.latest_event_id.0,
                next_id = state.next_consume_event_id.0,
                "checkpoint saved"
            );
        }
        result
    }

    fn run_pre_flush(&self) -> Result<()> {
        match self.pre_flush.read().as_ref() {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }

    fn write(&self, state: &CheckpointState) -> Result<()> {
        let buf = serde_json::to_vec_pretty(state)?;

        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }
}

//! On-disk journal backing the event log in full-durability mode.
//!
//! Every mutation of the in-memory ordered map is first appended here as a
//! length-prefixed, CRC-checked frame. On open the frames are replayed to
//! rebuild the map; compaction rewrites the file down to the live entries.

use crate::error::{RelayError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"EVJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Upper bound for a single frame; anything larger is treated as corruption.
const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Entries per `Put` frame when rewriting during compaction.
const REWRITE_CHUNK: usize = 4096;

/// A journaled mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JournalOp {
    /// Insert a batch of entries atomically.
    Put { entries: Vec<(Vec<u8>, Vec<u8>)> },
    /// Remove every entry with key <= `end` (or < `end` when not inclusive).
    DeleteUpTo { end: Vec<u8>, inclusive: bool },
    /// Remove everything.
    Clear,
}

/// Append handle plus the length of the intact journal prefix.
struct Sink {
    file: File,
    /// Bytes up to the end of the last complete frame.
    committed: u64,
    writes_since_sync: u64,
    /// A failed append could not be rolled back; the tail is unknown.
    poisoned: bool,
    /// Frames appended while a rewrite is in progress.
    captured: Option<Vec<Vec<u8>>>,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl Sink {
    fn new(file: File, committed: u64) -> Self {
        Self {
            file,
            committed,
            writes_since_sync: 0,
            poisoned: false,
            captured: None,
            #[cfg(test)]
            fail_after: None,
        }
    }

    fn write_frame(&mut self, frame: &[u8], sync_interval: u64) -> std::io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_after.take() {
            self.file.write_all(&frame[..limit.min(frame.len())])?;
            return Err(std::io::Error::new(ErrorKind::Other, "injected write failure"));
        }

        self.file.write_all(frame)?;
        self.writes_since_sync += 1;
        if self.writes_since_sync >= sync_interval {
            self.file.sync_data()?;
            self.writes_since_sync = 0;
        }
        Ok(())
    }

    /// Cut the file back to the last complete frame.
    fn rollback(&mut self, path: &Path) {
        if let Err(e) = self.file.set_len(self.committed) {
            error!(path = %path.display(), committed = self.committed, error = %e, "journal rollback failed, refusing further appends");
            self.poisoned = true;
        }
    }
}

/// Append-only operation journal.
pub struct Journal {
    path: PathBuf,
    sink: Mutex<Sink>,
    /// fsync every N appended frames.
    sync_interval: u64,
}

impl Journal {
    /// Open or create a journal, feeding every intact frame to `replay`.
    ///
    /// A torn or corrupt tail (a crash mid-write) stops the replay; the file
    /// is truncated back to the last intact frame.
    pub fn open<F>(path: impl AsRef<Path>, sync_interval: u64, mut replay: F) -> Result<Self>
    where
        F: FnMut(JournalOp),
    {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists() && fs::metadata(&path)?.len() > 0;

        let committed = if exists {
            let file = File::open(&path)?;
            let file_len = file.metadata()?.len();
            let mut reader = BufReader::new(file);

            let mut magic = [0u8; 4];
            reader.read_exact(&mut magic)?;
            if &magic != JOURNAL_MAGIC {
                return Err(RelayError::InvalidFormat("Invalid journal magic".into()));
            }
            let mut version = [0u8; 1];
            reader.read_exact(&mut version)?;
            if version[0] != JOURNAL_VERSION {
                return Err(RelayError::InvalidFormat(format!(
                    "Unsupported journal version: {}",
                    version[0]
                )));
            }

            let mut good_end = HEADER_SIZE;
            let mut frames = 0u64;
            loop {
                match Self::read_frame(&mut reader) {
                    Ok((op, size)) => {
                        replay(op);
                        good_end += size;
                        frames += 1;
                    }
                    Err(RelayError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                    Err(e) => {
                        warn!(path = %path.display(), offset = good_end, error = %e, "journal frame unreadable, truncating tail");
                        break;
                    }
                }
            }

            if good_end < file_len {
                warn!(path = %path.display(), kept = good_end, dropped = file_len - good_end, "truncating torn journal tail");
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(good_end)?;
                file.sync_all()?;
            }
            info!(path = %path.display(), frames, "journal replayed");
            good_end
        } else {
            Self::create_empty(&path)?;
            HEADER_SIZE
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            sink: Mutex::new(Sink::new(file, committed)),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append one operation. Returns once it is written (and synced on interval).
    ///
    /// On failure the file is cut back to the previous frame, so a failed
    /// append leaves nothing behind for later appends to be stranded after.
    pub fn append(&self, op: &JournalOp) -> Result<()> {
        let frame = Self::encode_frame(op)?;

        let mut sink = self.sink.lock();
        if sink.poisoned {
            return Err(RelayError::Corruption(format!(
                "journal {} has an unrecoverable tail, reopen required",
                self.path.display()
            )));
        }

        if let Err(e) = sink.write_frame(&frame, self.sync_interval) {
            warn!(path = %self.path.display(), error = %e, "journal append failed, rolling back");
            sink.rollback(&self.path);
            return Err(e.into());
        }

        sink.committed += frame.len() as u64;
        if let Some(captured) = sink.captured.as_mut() {
            captured.push(frame);
        }
        Ok(())
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut sink = self.sink.lock();
        sink.file.sync_all()?;
        sink.writes_since_sync = 0;
        Ok(())
    }

    /// Start recording appended frames for a following [`Journal::rewrite`].
    ///
    /// Call while no append can interleave, at the same point the live
    /// entries handed to `rewrite` are read.
    pub fn begin_rewrite(&self) {
        self.sink.lock().captured = Some(Vec::new());
    }

    /// Replace the journal with the given live entries plus every frame
    /// appended since [`Journal::begin_rewrite`].
    ///
    /// The bulk of the file is written without blocking appends. The new
    /// file is renamed over the original, so a crash leaves either the old
    /// or the new journal intact.
    pub fn rewrite<I>(&self, entries: I) -> Result<u64>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let tmp_path = self.path.with_extension("journal.tmp");
        let result = self.write_rewrite(&tmp_path, entries);
        if result.is_err() {
            self.sink.lock().captured = None;
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn write_rewrite<I>(&self, tmp_path: &Path, entries: I) -> Result<u64>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let mut tmp = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(tmp_path)?,
        );
        tmp.write_all(JOURNAL_MAGIC)?;
        tmp.write_all(&[JOURNAL_VERSION])?;

        let mut written = 0u64;
        let mut chunk = Vec::with_capacity(REWRITE_CHUNK);
        for entry in entries {
            chunk.push(entry);
            if chunk.len() == REWRITE_CHUNK {
                written += chunk.len() as u64;
                let entries = std::mem::replace(&mut chunk, Vec::with_capacity(REWRITE_CHUNK));
                tmp.write_all(&Self::encode_frame(&JournalOp::Put { entries })?)?;
            }
        }
        if !chunk.is_empty() {
            written += chunk.len() as u64;
            tmp.write_all(&Self::encode_frame(&JournalOp::Put { entries: chunk })?)?;
        }
        tmp.flush()?;

        // Appends wait from here until the new file is in place.
        let mut sink = self.sink.lock();
        let captured = sink.captured.take().unwrap_or_default();
        for frame in &captured {
            tmp.write_all(frame)?;
        }
        tmp.flush()?;
        tmp.get_ref().sync_all()?;
        let committed = tmp.get_ref().metadata()?.len();
        drop(tmp);

        fs::rename(tmp_path, &self.path)?;
        *sink = Sink::new(OpenOptions::new().append(true).open(&self.path)?, committed);

        Ok(written)
    }

    /// Current size of the journal file in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn create_empty(path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    /// `len | rmp bytes | crc32`, ready to write in one call.
    fn encode_frame(op: &JournalOp) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(op)?;

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(frame)
    }

    /// Make the next append write at most `bytes` bytes and then fail.
    #[cfg(test)]
    pub(crate) fn fail_next_append_after(&self, bytes: usize) {
        self.sink.lock().fail_after = Some(bytes);
    }

    /// Read one frame, returning the op and the frame's size on disk.
    fn read_frame<R: Read>(reader: &mut R) -> Result<(JournalOp, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(RelayError::Corruption("journal frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(RelayError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let op = rmp_serde::from_slice(&encoded)?;
        Ok((op, (4 + len + 4) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(key: &str, value: &str) -> JournalOp {
        JournalOp::Put {
            entries: vec![(key.as_bytes().to_vec(), value.as_bytes().to_vec())],
        }
    }

    fn replay_all(path: &Path) -> Vec<JournalOp> {
        let mut ops = Vec::new();
        Journal::open(path, 1, |op| ops.push(op)).unwrap();
        ops
    }

    #[test]
    fn test_journal_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.journal");

        {
            let journal = Journal::open(&path, 1, |_| {}).unwrap();
            journal.append(&put("a", "1")).unwrap();
            journal.append(&put("b", "2")).unwrap();
            journal
                .append(&JournalOp::DeleteUpTo {
                    end: b"a".to_vec(),
                    inclusive: true,
                })
                .unwrap();
        }

        let ops = replay_all(&path);
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[2], JournalOp::DeleteUpTo { inclusive: true, .. }));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.journal");

        {
            let journal = Journal::open(&path, 1, |_| {}).unwrap();
            journal.append(&put("a", "1")).unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();

        // Simulate a crash halfway through the next frame.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&64u32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let ops = replay_all(&path);
        assert_eq!(ops.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
    }

    #[test]
    fn test_rewrite_keeps_only_live_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.journal");

        let journal = Journal::open(&path, 1, |_| {}).unwrap();
        for i in 0..50 {
            journal.append(&put(&format!("k{i:03}"), "v")).unwrap();
        }
        let before = journal.size().unwrap();

        let written = journal
            .rewrite(vec![(b"k049".to_vec(), b"v".to_vec())])
            .unwrap();
        assert_eq!(written, 1);
        assert!(journal.size().unwrap() < before);

        // Appends after a rewrite land in the new file.
        journal.append(&put("k050", "v")).unwrap();
        drop(journal);

        let ops = replay_all(&path);
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.journal");

        let journal = Journal::open(&path, 1, |_| {}).unwrap();
        journal.append(&put("a", "1")).unwrap();
        let intact_len = journal.size().unwrap();

        journal.fail_next_append_after(6);
        assert!(matches!(journal.append(&put("b", "2")), Err(RelayError::Io(_))));
        assert_eq!(journal.size().unwrap(), intact_len);

        // The next append lands right after the last intact frame.
        journal.append(&put("c", "3")).unwrap();
        drop(journal);

        let ops = replay_all(&path);
        assert_eq!(ops.len(), 2);
        match &ops[1] {
            JournalOp::Put { entries } => assert_eq!(entries[0].0, b"c".to_vec()),
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_rewrite_keeps_appends_made_during_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.journal");

        let journal = Journal::open(&path, 1, |_| {}).unwrap();
        journal.append(&put("a", "1")).unwrap();
        journal.append(&put("b", "2")).unwrap();

        journal.begin_rewrite();
        journal.append(&put("c", "3")).unwrap();
        journal
            .rewrite(vec![(b"b".to_vec(), b"2".to_vec())])
            .unwrap();
        journal.append(&put("d", "4")).unwrap();
        drop(journal);

        let keys: Vec<Vec<u8>> = replay_all(&path)
            .into_iter()
            .flat_map(|op| match op {
                JournalOp::Put { entries } => entries.into_iter().map(|(k, _)| k).collect(),
                _ => Vec::new(),
            })
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.journal");
        fs::write(&path, b"XXXX\x01").unwrap();

        let result = Journal::open(&path, 1, |_| {});
        assert!(matches!(result, Err(RelayError::InvalidFormat(_))));
    }
}

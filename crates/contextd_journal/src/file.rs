//! File-backed journal and sequence stores.
//!
//! Both stores append framed records (see [`crate::record`]) to a single
//! file and `sync_all` after every mutation. The journal keeps every entry
//! in memory alongside a csn→offset index so fork repair can cut the file
//! at the replaced entry.
//!
//! Store calls run on tokio's blocking pool, so a stalled write or fsync
//! never parks a runtime worker and a caller's timeout still fires. A call
//! that times out keeps running in the background and may still land.

use crate::digest::Digest;
use crate::dir::sync_directory;
use crate::error::{JournalError, JournalResult};
use crate::journal::{JournalIndex, JournalStore};
use crate::record::{encode_record, scan_records, RecordKind, Scan};
use crate::sequence::SequenceStore;
use crate::transaction::{TransactionObject, TransactionRequest};
use async_trait::async_trait;
use contextd_codec::{Decode, Encode};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Sequence files are rewritten to a single record after this many appends.
const SEQUENCE_COMPACT_AFTER: usize = 1024;

/// An append-only file with explicit truncation.
#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    file: File,
    size: u64,
}

impl LogFile {
    fn open(path: &Path) -> JournalResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
        })
    }

    fn read_all(&mut self) -> JournalResult<Vec<u8>> {
        let mut data = Vec::with_capacity(usize::try_from(self.size).unwrap_or(0));
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Appends and syncs, returning the offset the data was written at.
    ///
    /// Writes at the tracked end of file. On failure whatever part of the
    /// data reached the file is cut off again and the size is unchanged.
    fn append(&mut self, data: &[u8]) -> JournalResult<u64> {
        let offset = self.size;
        let written = self
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .and_then(|()| self.file.sync_all());
        if let Err(e) = written {
            if let Err(rollback) = self.file.set_len(offset) {
                tracing::warn!(
                    path = %self.path.display(),
                    offset,
                    error = %rollback,
                    "failed to roll back partial append"
                );
            }
            return Err(e.into());
        }
        self.size += data.len() as u64;
        Ok(offset)
    }

    fn truncate(&mut self, new_size: u64) -> JournalResult<()> {
        if new_size > self.size {
            return Err(JournalError::storage(format!(
                "cannot truncate {} to {new_size} bytes, file has {}",
                self.path.display(),
                self.size
            )));
        }
        self.file.set_len(new_size)?;
        self.file.sync_all()?;
        self.size = new_size;
        Ok(())
    }
}

/// Runs `f` against the locked state on the blocking pool.
async fn blocking<S, T>(
    state: &Arc<Mutex<S>>,
    f: impl FnOnce(&mut S) -> JournalResult<T> + Send + 'static,
) -> JournalResult<T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || f(&mut *state.lock()))
        .await
        .map_err(|e| JournalError::storage(format!("store task failed: {e}")))?
}

/// Journal entries read from a file without taking ownership of it.
#[derive(Debug)]
pub struct JournalFile {
    /// Entries in file order.
    pub entries: Vec<TransactionObject>,
    /// Bytes after the last complete record.
    pub torn_bytes: u64,
}

/// Reads and decodes a journal file.
///
/// The file is not modified; a torn tail is reported in
/// [`JournalFile::torn_bytes`].
///
/// # Errors
///
/// Returns [`JournalError::Corrupted`] if a record is damaged, does not
/// decode, or breaks csn order.
pub fn read_journal_file(path: &Path) -> JournalResult<JournalFile> {
    let data = fs::read(path)?;
    let (entries, offsets_end) = decode_entries(&data)?;
    Ok(JournalFile {
        entries: entries.into_iter().map(|(_, txn)| txn).collect(),
        torn_bytes: data.len() as u64 - offsets_end,
    })
}

/// Decodes every entry record, returning `(offset, entry)` pairs and the
/// length of the valid prefix.
fn decode_entries(data: &[u8]) -> JournalResult<(Vec<(u64, TransactionObject)>, u64)> {
    let scan = scan_records(data)?;
    let mut entries: Vec<(u64, TransactionObject)> = Vec::with_capacity(scan.frames.len());

    for frame in &scan.frames {
        if frame.kind != RecordKind::Entry {
            return Err(JournalError::corrupted(format!(
                "unexpected {:?} record at offset {}",
                frame.kind, frame.offset
            )));
        }
        let txn = TransactionObject::decode(frame.payload).map_err(|e| {
            JournalError::corrupted(format!("entry at offset {}: {e}", frame.offset))
        })?;
        if let Some((_, prev)) = entries.last() {
            if txn.csn <= prev.csn {
                return Err(JournalError::corrupted(format!(
                    "csn {} follows csn {} at offset {}",
                    txn.csn, prev.csn, frame.offset
                )));
            }
        }
        entries.push((frame.offset, txn));
    }

    Ok((entries, scan.valid_len))
}

#[derive(Debug)]
struct JournalState {
    log: LogFile,
    index: JournalIndex,
    offsets: BTreeMap<u64, u64>,
}

impl JournalState {
    fn append(&mut self, txn: &TransactionObject) -> JournalResult<()> {
        if self.index.contains(txn.csn) {
            return Err(JournalError::DuplicateCsn { csn: txn.csn });
        }
        let record = encode_record(RecordKind::Entry, &txn.encode()?)?;
        let offset = self.log.append(&record)?;
        self.offsets.insert(txn.csn, offset);
        self.index.insert(txn.clone())
    }
}

/// Durable journal over a single append-only file.
#[derive(Debug)]
pub struct FileJournal {
    state: Arc<Mutex<JournalState>>,
}

impl FileJournal {
    /// Opens or creates a journal file.
    ///
    /// A torn final record left by a crash is truncated away.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Corrupted`] for damage before the final
    /// record, or an I/O error.
    pub fn open(path: &Path) -> JournalResult<Self> {
        let mut log = LogFile::open(path)?;
        let data = log.read_all()?;
        let (entries, valid_len) = decode_entries(&data)?;

        if valid_len < log.size {
            tracing::warn!(
                path = %path.display(),
                torn_bytes = log.size - valid_len,
                "truncating torn journal tail"
            );
            log.truncate(valid_len)?;
        }

        let mut index = JournalIndex::default();
        let mut offsets = BTreeMap::new();
        for (offset, txn) in entries {
            offsets.insert(txn.csn, offset);
            index.insert(txn)?;
        }
        tracing::debug!(path = %path.display(), entries = index.len(), "opened journal");

        Ok(Self {
            state: Arc::new(Mutex::new(JournalState {
                log,
                index,
                offsets,
            })),
        })
    }

    /// Returns the highest csn without going through the async contract.
    pub fn tail_csn(&self) -> u64 {
        self.state.lock().index.last_csn()
    }
}

#[async_trait]
impl JournalStore for FileJournal {
    async fn insert(&self, txn: &TransactionObject) -> JournalResult<()> {
        let txn = txn.clone();
        blocking(&self.state, move |state| state.append(&txn)).await
    }

    async fn find_by_csn(&self, csn: u64) -> JournalResult<Option<TransactionObject>> {
        blocking(&self.state, move |state| Ok(state.index.get(csn).cloned())).await
    }

    async fn get_last_digest(&self) -> JournalResult<Digest> {
        blocking(&self.state, |state| Ok(state.index.last_digest())).await
    }

    async fn last_csn(&self) -> JournalResult<u64> {
        blocking(&self.state, |state| Ok(state.index.last_csn())).await
    }

    async fn check_consistent(
        &self,
        observed_csn: u64,
        request: &TransactionRequest,
    ) -> JournalResult<()> {
        let request = request.clone();
        blocking(&self.state, move |state| {
            state.index.check_consistent(observed_csn, &request)
        })
        .await
    }

    async fn update_and_delete_after(
        &self,
        txn: &TransactionObject,
    ) -> JournalResult<Vec<TransactionObject>> {
        let txn = txn.clone();
        blocking(&self.state, move |state| {
            let cut = state.offsets.range(txn.csn..).next().map(|(_, &offset)| offset);
            if let Some(offset) = cut {
                state.log.truncate(offset)?;
            }
            state.offsets.split_off(&txn.csn);
            let removed = state.index.split_off(txn.csn);
            state.append(&txn)?;
            Ok(removed)
        })
        .await
    }

    async fn entries_from(&self, csn: u64, limit: usize) -> JournalResult<Vec<TransactionObject>> {
        blocking(&self.state, move |state| Ok(state.index.range(csn, limit))).await
    }
}

#[derive(Debug)]
struct SequenceState {
    log: LogFile,
    current: u64,
    records: usize,
}

impl SequenceState {
    fn raise_to(&mut self, seq: u64) -> JournalResult<()> {
        if seq > self.current {
            self.store(seq)?;
        }
        Ok(())
    }

    fn store(&mut self, value: u64) -> JournalResult<()> {
        if self.records >= SEQUENCE_COMPACT_AFTER {
            self.compact(value)?;
        } else {
            self.log
                .append(&encode_record(RecordKind::Sequence, &value.to_le_bytes())?)?;
            self.records += 1;
        }
        self.current = value;
        Ok(())
    }

    /// Replaces the file with a single record holding `value`.
    fn compact(&mut self, value: u64) -> JournalResult<()> {
        let path = self.log.path.clone();
        let temp = path.with_extension("tmp");
        {
            let mut file = File::create(&temp)?;
            file.write_all(&encode_record(RecordKind::Sequence, &value.to_le_bytes())?)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &path)?;
        if let Some(parent) = path.parent() {
            sync_directory(parent)?;
        }
        self.log = LogFile::open(&path)?;
        self.records = 1;
        Ok(())
    }
}

/// Reads the counter value from a sequence file without modifying it.
///
/// # Errors
///
/// Returns [`JournalError::Corrupted`] for damaged records, or an I/O
/// error.
pub fn read_sequence_file(path: &Path) -> JournalResult<u64> {
    let data = fs::read(path)?;
    decode_sequence(&scan_records(&data)?)
}

fn decode_sequence(scan: &Scan<'_>) -> JournalResult<u64> {
    let mut current = 0u64;
    for frame in &scan.frames {
        let bytes = match (frame.kind, <[u8; 8]>::try_from(frame.payload)) {
            (RecordKind::Sequence, Ok(bytes)) => bytes,
            _ => {
                return Err(JournalError::corrupted(format!(
                    "bad sequence record at offset {}",
                    frame.offset
                )))
            }
        };
        current = current.max(u64::from_le_bytes(bytes));
    }
    Ok(current)
}

/// Durable sequence counter over a single append-only file.
#[derive(Debug)]
pub struct FileSequence {
    state: Arc<Mutex<SequenceState>>,
}

impl FileSequence {
    /// Opens or creates a sequence file.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Corrupted`] for damaged records, or an I/O
    /// error.
    pub fn open(path: &Path) -> JournalResult<Self> {
        let mut log = LogFile::open(path)?;
        let data = log.read_all()?;
        let scan = scan_records(&data)?;
        let current = decode_sequence(&scan)?;
        let records = scan.frames.len();

        if scan.valid_len < log.size {
            tracing::warn!(path = %path.display(), "truncating torn sequence tail");
            log.truncate(scan.valid_len)?;
        }

        Ok(Self {
            state: Arc::new(Mutex::new(SequenceState {
                log,
                current,
                records,
            })),
        })
    }

    /// Raises the counter to `seq` if it is behind.
    ///
    /// # Errors
    ///
    /// Returns an error if the new value cannot be persisted.
    pub fn raise_to(&self, seq: u64) -> JournalResult<()> {
        self.state.lock().raise_to(seq)
    }
}

#[async_trait]
impl SequenceStore for FileSequence {
    async fn get_current_csn(&self) -> JournalResult<u64> {
        blocking(&self.state, |state| Ok(state.current)).await
    }

    async fn increment(&self) -> JournalResult<u64> {
        blocking(&self.state, |state| {
            let next = state
                .current
                .checked_add(1)
                .ok_or_else(|| JournalError::storage("sequence exhausted"))?;
            state.store(next)?;
            Ok(next)
        })
        .await
    }

    async fn update(&self, seq: u64) -> JournalResult<()> {
        blocking(&self.state, move |state| state.raise_to(seq)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::HEADER_LEN;
    use contextd_codec::Value;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn commit(journal: &FileJournal, target: &str) -> TransactionObject {
        let csn = journal.last_csn().await.unwrap() + 1;
        let before = journal.get_last_digest().await.unwrap();
        let request = TransactionRequest::insert(target, Value::map([("n", Value::Integer(1))]));
        let txn = TransactionObject::seal(request, csn, 1_000, before).unwrap();
        journal.insert(&txn).await.unwrap();
        txn
    }

    #[tokio::test]
    async fn journal_survives_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("journal.log");
        let (first, second) = {
            let journal = FileJournal::open(&path).unwrap();
            (commit(&journal, "a").await, commit(&journal, "b").await)
        };

        let journal = FileJournal::open(&path).unwrap();
        assert_eq!(journal.last_csn().await.unwrap(), 2);
        assert_eq!(journal.find_by_csn(1).await.unwrap(), Some(first));
        assert_eq!(journal.get_last_digest().await.unwrap(), second.digest);
    }

    #[tokio::test]
    async fn fork_repair_truncates_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("journal.log");
        let journal = FileJournal::open(&path).unwrap();
        let first = commit(&journal, "a").await;
        commit(&journal, "b").await;
        commit(&journal, "c").await;

        let request = TransactionRequest::insert("z", Value::empty_map());
        let replacement = TransactionObject::seal(request, 2, 2_000, first.digest).unwrap();
        let removed = journal.update_and_delete_after(&replacement).await.unwrap();
        assert_eq!(removed.len(), 2);
        drop(journal);

        let reopened = read_journal_file(&path).unwrap();
        assert_eq!(reopened.torn_bytes, 0);
        assert_eq!(
            reopened.entries.iter().map(|t| t.request.target.as_str()).collect::<Vec<_>>(),
            vec!["a", "z"]
        );
    }

    #[tokio::test]
    async fn torn_tail_is_truncated_on_open() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("journal.log");
        {
            let journal = FileJournal::open(&path).unwrap();
            commit(&journal, "a").await;
            commit(&journal, "b").await;
        }
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 5).unwrap();
        assert!(read_journal_file(&path).unwrap().torn_bytes > 0);

        let journal = FileJournal::open(&path).unwrap();
        assert_eq!(journal.last_csn().await.unwrap(), 1);
        commit(&journal, "c").await;
        drop(journal);
        assert_eq!(read_journal_file(&path).unwrap().entries.len(), 2);
    }

    #[tokio::test]
    async fn mid_file_damage_is_corruption() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("journal.log");
        {
            let journal = FileJournal::open(&path).unwrap();
            commit(&journal, "a").await;
            commit(&journal, "b").await;
        }
        let mut data = fs::read(&path).unwrap();
        data[HEADER_LEN + 2] ^= 0xFF;
        fs::write(&path, data).unwrap();
        assert!(matches!(
            FileJournal::open(&path),
            Err(JournalError::Corrupted(_))
        ));
    }

    #[tokio::test]
    async fn append_lands_at_the_tracked_end() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("journal.log");
        let journal = FileJournal::open(&path).unwrap();
        let first = commit(&journal, "a").await;

        // Stray bytes past the tracked end, as a failed append leaves when
        // its rollback fails too.
        let mut stray = OpenOptions::new().append(true).open(&path).unwrap();
        stray.write_all(b"zzz").unwrap();
        drop(stray);

        commit(&journal, "b").await;
        drop(journal);

        let file = read_journal_file(&path).unwrap();
        assert_eq!(file.torn_bytes, 0);
        assert_eq!(file.entries.len(), 2);
        assert_eq!(file.entries[0], first);

        let journal = FileJournal::open(&path).unwrap();
        let request = TransactionRequest::insert("z", Value::empty_map());
        let replacement = TransactionObject::seal(request, 2, 2_000, first.digest).unwrap();
        assert_eq!(journal.update_and_delete_after(&replacement).await.unwrap().len(), 1);
        drop(journal);
        assert_eq!(read_journal_file(&path).unwrap().entries[1], replacement);
    }

    #[test]
    fn failed_append_leaves_size_unchanged() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("sequence.log");
        let mut log = LogFile::open(&path).unwrap();
        log.append(b"first").unwrap();

        let writable = std::mem::replace(&mut log.file, File::open(&path).unwrap());
        assert!(log.append(b"second").is_err());
        assert_eq!(log.size, 5);

        log.file = writable;
        assert_eq!(log.append(b"third").unwrap(), 5);
        assert_eq!(fs::read(&path).unwrap(), b"firstthird");
    }

    #[tokio::test]
    #[allow(clippy::await_holding_lock)]
    async fn stalled_store_does_not_block_the_runtime() {
        let temp = tempdir().unwrap();
        let journal = FileJournal::open(&temp.path().join("journal.log")).unwrap();
        let request = TransactionRequest::insert("a", Value::empty_map());
        let txn = TransactionObject::seal(request, 1, 1_000, Digest::GENESIS).unwrap();

        // Holding the state lock stands in for a write stuck in the kernel.
        let guard = journal.state.lock();
        let stalled = tokio::time::timeout(Duration::from_millis(50), journal.insert(&txn)).await;
        assert!(stalled.is_err());
        drop(guard);

        // The abandoned write still completes.
        for _ in 0..200 {
            if journal.last_csn().await.unwrap() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out write never landed");
    }

    #[tokio::test]
    async fn sequence_persists_and_never_decreases() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("sequence.log");
        {
            let seq = FileSequence::open(&path).unwrap();
            assert_eq!(seq.increment().await.unwrap(), 1);
            assert_eq!(seq.increment().await.unwrap(), 2);
            seq.update(10).await.unwrap();
            seq.update(4).await.unwrap();
        }
        assert_eq!(read_sequence_file(&path).unwrap(), 10);
        let seq = FileSequence::open(&path).unwrap();
        assert_eq!(seq.get_current_csn().await.unwrap(), 10);
        assert_eq!(seq.increment().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn sequence_compacts() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("sequence.log");
        let seq = FileSequence::open(&path).unwrap();
        for _ in 0..SEQUENCE_COMPACT_AFTER + 5 {
            seq.increment().await.unwrap();
        }
        drop(seq);
        let size = fs::metadata(&path).unwrap().len();
        assert!(size < 64 * 8);
        let seq = FileSequence::open(&path).unwrap();
        assert_eq!(
            seq.get_current_csn().await.unwrap(),
            (SEQUENCE_COMPACT_AFTER + 5) as u64
        );
    }
}

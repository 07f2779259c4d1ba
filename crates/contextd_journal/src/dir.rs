//! Context directory management.
//!
//! Each database keeps its durable state in its own directory:
//!
//! ```text
//! <data_dir>/<database>/
//! ├─ LOCK              # Advisory lock, one process per directory
//! ├─ journal.log       # Framed journal entries
//! └─ sequence.log      # Framed counter values
//! ```

use crate::error::{JournalError, JournalResult};
use crate::file::{FileJournal, FileSequence};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.log";
const SEQUENCE_FILE: &str = "sequence.log";

/// An exclusively locked context directory.
///
/// The lock is held until this value is dropped.
#[derive(Debug)]
pub struct ContextDir {
    path: PathBuf,
    _lock_file: File,
}

impl ContextDir {
    /// Opens (creating if needed) the directory for `database` under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Locked`] if another process holds the
    /// directory, or an I/O error.
    pub fn open(root: &Path, database: &str) -> JournalResult<Self> {
        if database.is_empty() || database.contains(['/', '\\']) || database == ".." {
            return Err(JournalError::storage(format!(
                "invalid database name {database:?}"
            )));
        }
        let path = root.join(database);
        fs::create_dir_all(&path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(JournalError::Locked);
        }

        Ok(Self {
            path,
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the journal file path.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        journal_path(&self.path)
    }

    /// Returns the sequence file path.
    #[must_use]
    pub fn sequence_path(&self) -> PathBuf {
        sequence_path(&self.path)
    }

    /// Opens the journal and sequence stores in this directory.
    ///
    /// A sequence file that is behind the journal tail is raised to it.
    ///
    /// # Errors
    ///
    /// Returns an error if either file is corrupted or cannot be opened.
    pub fn open_stores(&self) -> JournalResult<(FileJournal, FileSequence)> {
        let journal = FileJournal::open(&self.journal_path())?;
        let sequence = FileSequence::open(&self.sequence_path())?;
        sequence.raise_to(journal.tail_csn())?;
        Ok((journal, sequence))
    }
}

/// Returns the journal file path for a context directory.
#[must_use]
pub fn journal_path(dir: &Path) -> PathBuf {
    dir.join(JOURNAL_FILE)
}

/// Returns the sequence file path for a context directory.
pub fn sequence_path(dir: &Path) -> PathBuf {
    dir.join(SEQUENCE_FILE)
}

/// Syncs a directory so renames inside it are durable.
#[cfg(unix)]
pub(crate) fn sync_directory(path: &Path) -> JournalResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_directory(_path: &Path) -> JournalResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_layout() {
        let temp = tempdir().unwrap();
        let dir = ContextDir::open(temp.path(), "orders").unwrap();
        assert!(dir.path().join(LOCK_FILE).exists());
        assert_eq!(dir.journal_path(), temp.path().join("orders/journal.log"));
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _held = ContextDir::open(temp.path(), "orders").unwrap();
        assert!(matches!(
            ContextDir::open(temp.path(), "orders"),
            Err(JournalError::Locked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(ContextDir::open(temp.path(), "orders").unwrap());
        ContextDir::open(temp.path(), "orders").unwrap();
    }

    #[test]
    fn rejects_path_like_names() {
        let temp = tempdir().unwrap();
        assert!(ContextDir::open(temp.path(), "").is_err());
        assert!(ContextDir::open(temp.path(), "a/b").is_err());
    }
}

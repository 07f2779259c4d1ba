//! # contextd journal
//!
//! The digest-chained transaction log behind a contextd database.
//!
//! Every mutation of a context is committed as a [`TransactionObject`] with a
//! csn from the [`SequenceStore`] and a `before_digest` linking it to the
//! previous entry. The [`JournalStore`] keeps those entries in csn order;
//! fork repair may replace a diverged tail but nothing else ever removes an
//! entry.
//!
//! ## Stores
//!
//! | Store | Journal | Sequence |
//! |---|---|---|
//! | In memory | [`MemoryJournal`] | [`MemorySequence`] |
//! | On disk | [`FileJournal`] | [`FileSequence`] |
//!
//! [`ContextDir`] lays out and locks the on-disk stores for one database.
//!
//! ## Invariants
//!
//! - csns in a journal are `1..=N` with no gaps
//! - `entry(n).before_digest == entry(n - 1).digest`, genesis for `n = 1`
//! - the sequence counter never decreases and is never behind the journal

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod chain;
mod digest;
mod dir;
mod error;
mod file;
mod journal;
mod operator;
pub mod record;
mod sequence;
mod transaction;

pub use chain::{verify_chain, verify_chain_from, ChainReport, ChainViolation};
pub use digest::{Digest, DIGEST_LEN};
pub use dir::{journal_path, sequence_path, ContextDir};
pub use error::{JournalError, JournalResult};
pub use file::{read_journal_file, read_sequence_file, FileJournal, FileSequence, JournalFile};
pub use journal::{JournalStore, MemoryJournal};
pub use operator::apply_operator;
pub use sequence::{MemorySequence, SequenceStore};
pub use transaction::{TransactionObject, TransactionRequest, TransactionType};

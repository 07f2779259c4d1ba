//! Journal store contract and in-memory implementation.

use crate::digest::Digest;
use crate::error::{JournalError, JournalResult};
use crate::transaction::{TransactionObject, TransactionRequest};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Append-only, csn-indexed transaction log.
///
/// Entries are only ever removed by [`update_and_delete_after`], which fork
/// repair uses to replace a diverged tail.
///
/// [`update_and_delete_after`]: JournalStore::update_and_delete_after
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Appends an entry. The csn must not already be present.
    async fn insert(&self, txn: &TransactionObject) -> JournalResult<()>;

    /// Returns the entry at `csn`, if any.
    async fn find_by_csn(&self, csn: u64) -> JournalResult<Option<TransactionObject>>;

    /// Returns the digest of the highest entry, or [`Digest::GENESIS`].
    async fn get_last_digest(&self) -> JournalResult<Digest>;

    /// Returns the highest csn, or 0 when empty.
    async fn last_csn(&self) -> JournalResult<u64>;

    /// Checks that a read taken at `observed_csn` is still current for
    /// `request`.
    ///
    /// An observed csn of 0 carries no baseline and always passes. Otherwise
    /// the check fails if the observed csn is ahead of the journal, or if a
    /// later entry touched the same target or reset the whole context.
    async fn check_consistent(
        &self,
        observed_csn: u64,
        request: &TransactionRequest,
    ) -> JournalResult<()>;

    /// Replaces the entry at `txn.csn` and deletes every later entry.
    ///
    /// Returns the entries that were replaced or removed, in csn order.
    async fn update_and_delete_after(
        &self,
        txn: &TransactionObject,
    ) -> JournalResult<Vec<TransactionObject>>;

    /// Returns up to `limit` entries starting at `csn`.
    async fn entries_from(&self, csn: u64, limit: usize) -> JournalResult<Vec<TransactionObject>>;
}

/// Csn-ordered entries shared by the journal implementations.
#[derive(Debug, Default)]
pub(crate) struct JournalIndex {
    entries: BTreeMap<u64, TransactionObject>,
}

impl JournalIndex {
    pub(crate) fn insert(&mut self, txn: TransactionObject) -> JournalResult<()> {
        if self.entries.contains_key(&txn.csn) {
            return Err(JournalError::DuplicateCsn { csn: txn.csn });
        }
        self.entries.insert(txn.csn, txn);
        Ok(())
    }

    pub(crate) fn contains(&self, csn: u64) -> bool {
        self.entries.contains_key(&csn)
    }

    pub(crate) fn get(&self, csn: u64) -> Option<&TransactionObject> {
        self.entries.get(&csn)
    }

    pub(crate) fn last_csn(&self) -> u64 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    pub(crate) fn last_digest(&self) -> Digest {
        self.entries
            .values()
            .next_back()
            .map_or(Digest::GENESIS, |txn| txn.digest)
    }

    pub(crate) fn check_consistent(
        &self,
        observed_csn: u64,
        request: &TransactionRequest,
    ) -> JournalResult<()> {
        if observed_csn == 0 {
            return Ok(());
        }
        let last = self.last_csn();
        if observed_csn > last {
            return Err(JournalError::consistency(format!(
                "observed csn {observed_csn} is ahead of journal tail {last}"
            )));
        }
        let conflict = self
            .entries
            .range(observed_csn + 1..)
            .map(|(_, txn)| txn)
            .find(|txn| txn.request.kind.resets_context() || txn.request.target == request.target);
        match conflict {
            Some(txn) => Err(JournalError::consistency(format!(
                "{} at csn {} supersedes the read at csn {observed_csn}",
                txn.request.kind.name(),
                txn.csn
            ))),
            None => Ok(()),
        }
    }

    /// Removes every entry at or after `csn`.
    pub(crate) fn split_off(&mut self, csn: u64) -> Vec<TransactionObject> {
        self.entries.split_off(&csn).into_values().collect()
    }

    pub(crate) fn range(&self, csn: u64, limit: usize) -> Vec<TransactionObject> {
        self.entries
            .range(csn..)
            .take(limit)
            .map(|(_, txn)| txn.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// In-memory journal.
///
/// Contents are lost when dropped. Suitable for tests and for replicas that
/// rebuild from the leader on start.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    index: RwLock<JournalIndex>,
}

impl MemoryJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Returns true if the journal is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JournalStore for MemoryJournal {
    async fn insert(&self, txn: &TransactionObject) -> JournalResult<()> {
        self.index.write().insert(txn.clone())
    }

    async fn find_by_csn(&self, csn: u64) -> JournalResult<Option<TransactionObject>> {
        Ok(self.index.read().get(csn).cloned())
    }

    async fn get_last_digest(&self) -> JournalResult<Digest> {
        Ok(self.index.read().last_digest())
    }

    async fn last_csn(&self) -> JournalResult<u64> {
        Ok(self.index.read().last_csn())
    }

    async fn check_consistent(
        &self,
        observed_csn: u64,
        request: &TransactionRequest,
    ) -> JournalResult<()> {
        self.index.read().check_consistent(observed_csn, request)
    }

    async fn update_and_delete_after(
        &self,
        txn: &TransactionObject,
    ) -> JournalResult<Vec<TransactionObject>> {
        let mut index = self.index.write();
        let removed = index.split_off(txn.csn);
        index.insert(txn.clone())?;
        Ok(removed)
    }

    async fn entries_from(&self, csn: u64, limit: usize) -> JournalResult<Vec<TransactionObject>> {
        Ok(self.index.read().range(csn, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionType;
    use contextd_codec::Value;

    fn chain(journal: &JournalIndex, request: TransactionRequest) -> TransactionObject {
        TransactionObject::seal(request, journal.last_csn() + 1, 0, journal.last_digest()).unwrap()
    }

    fn insert(target: &str) -> TransactionRequest {
        TransactionRequest::insert(target, Value::map([("x", Value::Integer(1))]))
    }

    async fn filled(targets: &[&str]) -> MemoryJournal {
        let journal = MemoryJournal::new();
        for target in targets {
            let txn = chain(&journal.index.read(), insert(target));
            journal.insert(&txn).await.unwrap();
        }
        journal
    }

    #[tokio::test]
    async fn empty_journal_uses_genesis() {
        let journal = MemoryJournal::new();
        assert_eq!(journal.get_last_digest().await.unwrap(), Digest::GENESIS);
        assert_eq!(journal.last_csn().await.unwrap(), 0);
        assert!(journal.find_by_csn(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_csn_rejected() {
        let journal = filled(&["a"]).await;
        let first = journal.find_by_csn(1).await.unwrap().unwrap();
        assert!(matches!(
            journal.insert(&first).await,
            Err(JournalError::DuplicateCsn { csn: 1 })
        ));
    }

    #[tokio::test]
    async fn consistency_tracks_target() {
        let journal = filled(&["a", "b", "a"]).await;

        // no baseline
        journal.check_consistent(0, &insert("a")).await.unwrap();
        // "b" untouched since csn 2
        journal.check_consistent(2, &insert("b")).await.unwrap();
        // "a" rewritten at csn 3
        assert!(matches!(
            journal.check_consistent(2, &insert("a")).await,
            Err(JournalError::Consistency(_))
        ));
        // read from the future
        assert!(journal.check_consistent(4, &insert("c")).await.is_err());
    }

    #[tokio::test]
    async fn truncate_invalidates_every_baseline() {
        let journal = filled(&["a"]).await;
        let txn = chain(
            &journal.index.read(),
            TransactionRequest::marker(TransactionType::Truncate),
        );
        journal.insert(&txn).await.unwrap();
        assert!(journal.check_consistent(1, &insert("zzz")).await.is_err());
        journal.check_consistent(2, &insert("zzz")).await.unwrap();
    }

    #[tokio::test]
    async fn update_and_delete_after_replaces_tail() {
        let journal = filled(&["a", "b", "c", "d"]).await;
        let before = journal.find_by_csn(1).await.unwrap().unwrap();
        let replacement = TransactionObject::seal(insert("x"), 2, 99, before.digest).unwrap();

        let removed = journal.update_and_delete_after(&replacement).await.unwrap();

        assert_eq!(
            removed.iter().map(|t| t.csn).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.last_csn().await.unwrap(), 2);
        assert_eq!(journal.get_last_digest().await.unwrap(), replacement.digest);
    }

    #[tokio::test]
    async fn entries_from_pages() {
        let journal = filled(&["a", "b", "c", "d", "e"]).await;
        let page = journal.entries_from(2, 2).await.unwrap();
        assert_eq!(page.iter().map(|t| t.csn).collect::<Vec<_>>(), vec![2, 3]);
        assert!(journal.entries_from(9, 10).await.unwrap().is_empty());
    }
}

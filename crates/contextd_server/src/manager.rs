//! The context manager.
//!
//! One [`ContextManager`] owns one database's context on one process. It
//! holds the journal and sequence stores, the exclusive critical section
//! shared by the commit and replication paths, and the leadership lease if
//! this process won the election.
//!
//! # Commit path
//!
//! [`exec`](ContextManager::exec) runs only while leading. Under the lock it
//! checks the caller's baseline, resolves the resulting document, takes the
//! next csn, links the entry to the journal tail, appends it and publishes
//! it on the transaction topic. Validation happens before any store
//! mutation, so a rejected request leaves no trace.
//!
//! # Replication path
//!
//! Every process, the leader included, applies each published entry through
//! [`on_receive`](ContextManager::on_receive). A missing csn is appended, an
//! identical one is ignored, and a different one at the same csn is a fork:
//! the local tail is replaced and, if this process thought it was leading,
//! it gives the lease back and stands for election again.

use crate::cluster::{Coordinator, Lease, Subscription};
use crate::config::ContextConfig;
use crate::error::{ContextError, ContextResult};
use crate::event::ContextEvent;
use chrono::Utc;
use contextd_codec::{Decode, Encode, Value};
use contextd_journal::{
    ContextDir, Digest, JournalResult, JournalStore, MemoryJournal, MemorySequence, SequenceStore,
    TransactionObject, TransactionRequest,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What applying a replicated entry did to the local journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entry was new and has been appended.
    Inserted,
    /// An identical entry was already present.
    Duplicate,
    /// The local entry at this csn differed and the tail was replaced.
    Repaired {
        /// How many local entries were replaced or removed.
        discarded: usize,
    },
}

/// A snapshot of a context's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextStatus {
    /// Database name.
    pub database: String,
    /// Whether this process holds the leadership lease.
    pub leader: bool,
    /// Latest csn handed out by the sequence store.
    pub current_csn: u64,
    /// Highest csn in the journal.
    pub last_csn: u64,
    /// Digest of the journal tail.
    pub last_digest: Digest,
}

struct Shared {
    config: ContextConfig,
    journal: Arc<dyn JournalStore>,
    sequence: Arc<dyn SequenceStore>,
    coordinator: Arc<dyn Coordinator>,
    critical: Mutex<()>,
    lease: Mutex<Option<Lease>>,
    events: broadcast::Sender<ContextEvent>,
    _dir: Option<ContextDir>,
}

impl Shared {
    fn emit(&self, event: ContextEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Runs one store call, bounded by the configured timeout.
    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> ContextResult<T>
    where
        F: Future<Output = JournalResult<T>>,
    {
        let after = self.config.store_timeout;
        match tokio::time::timeout(after, call).await {
            Ok(result) => result.map_err(ContextError::from),
            Err(_) => {
                warn!(
                    database = %self.config.database,
                    operation,
                    ?after,
                    "store call timed out"
                );
                Err(ContextError::Timeout { operation, after })
            }
        }
    }

    async fn connect(&self) -> ContextResult<bool> {
        let mut lease = self.lease.lock().await;
        if let Some(held) = lease.take() {
            if let Err(e) = self.coordinator.release_lease(held).await {
                warn!(database = %self.config.database, error = %e, "failed to release lease");
            }
            self.emit(ContextEvent::LeadershipLost);
        }

        match self
            .coordinator
            .acquire_lease(&self.config.context_path())
            .await?
        {
            Some(granted) => {
                *lease = Some(granted);
                info!(database = %self.config.database, "acquired leadership");
                self.emit(ContextEvent::LeadershipAcquired);
                Ok(true)
            }
            None => {
                debug!(database = %self.config.database, "another process leads");
                Ok(false)
            }
        }
    }

    async fn exec(&self, observed_csn: u64, request: TransactionRequest) -> ContextResult<Value> {
        let _critical = self.critical.lock().await;
        if self.lease.lock().await.is_none() {
            return Err(ContextError::NotLeader);
        }

        self.bounded(
            "journal.check_consistent",
            self.journal.check_consistent(observed_csn, &request),
        )
        .await?;
        let mut update_object = request.resolve_update_object()?;
        request
            .to_value()
            .encode()
            .map_err(|e| ContextError::InvalidRequest(e.to_string()))?;

        let csn = self
            .bounded("sequence.increment", self.sequence.increment())
            .await?;
        let before_digest = self
            .bounded("journal.get_last_digest", self.journal.get_last_digest())
            .await?;

        let target = request.target.clone();
        let kind = request.kind.name();
        let txn =
            TransactionObject::seal(request, csn, Utc::now().timestamp_millis(), before_digest)?;
        let payload = txn.encode()?;
        self.bounded("journal.insert", self.journal.insert(&txn))
            .await?;
        debug!(database = %self.config.database, csn, kind, %target, "committed");

        if let Err(e) = self
            .coordinator
            .publish(&self.config.transaction_path(), payload)
            .await
        {
            warn!(database = %self.config.database, csn, error = %e, "failed to publish transaction");
        }
        self.emit(ContextEvent::Committed { csn });

        if update_object.get("_id").is_none() && !target.is_empty() {
            update_object.insert("_id", Value::Text(target));
        }
        update_object.insert("csn", Value::Integer(i64::try_from(csn).unwrap_or(i64::MAX)));
        Ok(update_object)
    }

    async fn on_receive(&self, txn: TransactionObject) -> ContextResult<ApplyOutcome> {
        if !txn.verify_digest() {
            return Err(ContextError::InvalidRequest(format!(
                "csn {}: digest does not match content",
                txn.csn
            )));
        }

        let _critical = self.critical.lock().await;
        let current = self
            .bounded("sequence.get_current_csn", self.sequence.get_current_csn())
            .await?;
        if current < txn.csn {
            self.bounded("sequence.update", self.sequence.update(txn.csn))
                .await?;
        }

        let existing = self
            .bounded("journal.find_by_csn", self.journal.find_by_csn(txn.csn))
            .await?;
        match existing {
            None => {
                self.bounded("journal.insert", self.journal.insert(&txn))
                    .await?;
                debug!(database = %self.config.database, csn = txn.csn, "applied");
                self.emit(ContextEvent::Applied { csn: txn.csn });
                Ok(ApplyOutcome::Inserted)
            }
            Some(saved) if saved.digest == txn.digest => Ok(ApplyOutcome::Duplicate),
            Some(_) => {
                let csn = txn.csn;
                let discarded = self
                    .bounded(
                        "journal.update_and_delete_after",
                        self.journal.update_and_delete_after(&txn),
                    )
                    .await?;
                let count = discarded.len();
                warn!(
                    database = %self.config.database,
                    csn,
                    discarded = count,
                    "fork detected, replaced local tail"
                );
                self.emit(ContextEvent::Superseded { csn, discarded });

                let leading = self.lease.lock().await.is_some();
                if leading {
                    warn!(database = %self.config.database, csn, "leadership is stale, re-electing");
                    self.connect().await?;
                }
                Ok(ApplyOutcome::Repaired { discarded: count })
            }
        }
    }
}

/// Consumes the transaction topic until it closes.
async fn replicate(shared: Arc<Shared>, mut subscription: Subscription) {
    while let Some(payload) = subscription.recv().await {
        let txn = match TransactionObject::decode(&payload) {
            Ok(txn) => txn,
            Err(e) => {
                warn!(database = %shared.config.database, error = %e, "dropping undecodable transaction");
                continue;
            }
        };
        let csn = txn.csn;
        if let Err(e) = shared.on_receive(txn).await {
            warn!(database = %shared.config.database, csn, error = %e, "failed to apply transaction");
        }
    }
    debug!(database = %shared.config.database, "transaction topic closed");
}

/// Per-database leader election, commit and replication.
///
/// # Example
///
/// ```
/// use contextd_codec::Value;
/// use contextd_journal::TransactionRequest;
/// use contextd_server::{ContextConfig, ContextManager, LocalCoordinator};
/// use std::sync::Arc;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let coordinator = Arc::new(LocalCoordinator::new());
/// let manager = ContextManager::in_memory(ContextConfig::new("orders"), coordinator);
/// manager.start().await.unwrap();
///
/// let request = TransactionRequest::insert("t1", Value::map([("x", Value::Integer(1))]));
/// let result = manager.exec(0, request).await.unwrap();
/// assert_eq!(result.get("csn"), Some(&Value::Integer(1)));
/// # });
/// ```
pub struct ContextManager {
    shared: Arc<Shared>,
    replication: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ContextManager {
    /// Creates a manager over the given stores. Call [`start`](Self::start)
    /// before use.
    pub fn new(
        config: ContextConfig,
        journal: Arc<dyn JournalStore>,
        sequence: Arc<dyn SequenceStore>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        Self::build(config, journal, sequence, coordinator, None)
    }

    /// Creates a manager over fresh in-memory stores.
    pub fn in_memory(config: ContextConfig, coordinator: Arc<dyn Coordinator>) -> Self {
        Self::new(
            config,
            Arc::new(MemoryJournal::new()),
            Arc::new(MemorySequence::new()),
            coordinator,
        )
    }

    /// Creates a manager using the stores `config` asks for: file-backed
    /// under `data_dir` if set, in-memory otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the stores
    /// cannot be opened.
    pub fn open(config: ContextConfig, coordinator: Arc<dyn Coordinator>) -> ContextResult<Self> {
        config.validate()?;
        let Some(root) = config.data_dir.clone() else {
            return Ok(Self::in_memory(config, coordinator));
        };

        let dir = ContextDir::open(&root, &config.database)?;
        let (journal, sequence) = dir.open_stores()?;
        info!(database = %config.database, path = %dir.path().display(), "opened file stores");
        Ok(Self::build(
            config,
            Arc::new(journal),
            Arc::new(sequence),
            coordinator,
            Some(dir),
        ))
    }

    fn build(
        config: ContextConfig,
        journal: Arc<dyn JournalStore>,
        sequence: Arc<dyn SequenceStore>,
        coordinator: Arc<dyn Coordinator>,
        dir: Option<ContextDir>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                journal,
                sequence,
                coordinator,
                critical: Mutex::new(()),
                lease: Mutex::new(None),
                events,
                _dir: dir,
            }),
            replication: parking_lot::Mutex::new(None),
        }
    }

    /// Subscribes to the transaction topic, starts replication and stands
    /// for election.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the coordinator
    /// fails.
    pub async fn start(&self) -> ContextResult<()> {
        let config = &self.shared.config;
        config.validate()?;

        let subscription = self
            .shared
            .coordinator
            .subscribe(&config.transaction_path())
            .await?;
        let handle = tokio::spawn(replicate(Arc::clone(&self.shared), subscription));
        let previous = self.replication.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(database = %config.database, "context manager started");

        self.connect().await?;
        Ok(())
    }

    /// Releases any held lease and requests a fresh one.
    ///
    /// Returns true if this process now leads.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator fails to answer.
    pub async fn connect(&self) -> ContextResult<bool> {
        self.shared.connect().await
    }

    /// Stops replication and releases the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator fails to release the lease.
    pub async fn stop(&self) -> ContextResult<()> {
        let handle = self.replication.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            // Resolves once the task, and its handle on the stores, is gone.
            let _ = handle.await;
        }

        let held = self.shared.lease.lock().await.take();
        if let Some(lease) = held {
            self.shared.coordinator.release_lease(lease).await?;
            self.shared.emit(ContextEvent::LeadershipLost);
        }
        info!(database = %self.shared.config.database, "context manager stopped");
        Ok(())
    }

    /// Commits `request` against a read taken at `observed_csn`.
    ///
    /// Returns the resulting document with `_id` defaulted to the target
    /// and `csn` set to the assigned csn.
    ///
    /// # Errors
    ///
    /// - [`ContextError::NotLeader`] if this process holds no lease
    /// - [`ContextError::Consistency`] if the read is stale
    /// - [`ContextError::InvalidRequest`] if the request cannot be resolved
    /// - [`ContextError::Storage`] or [`ContextError::Timeout`] if a store
    ///   call fails
    pub async fn exec(
        &self,
        observed_csn: u64,
        request: TransactionRequest,
    ) -> ContextResult<Value> {
        self.shared.exec(observed_csn, request).await
    }

    /// Applies a replicated entry.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::InvalidRequest`] if the entry's digest does
    /// not match its content, or a storage error.
    pub async fn on_receive(&self, txn: TransactionObject) -> ContextResult<ApplyOutcome> {
        self.shared.on_receive(txn).await
    }

    /// Returns a snapshot of this context.
    ///
    /// # Errors
    ///
    /// Returns an error if a store call fails.
    pub async fn status(&self) -> ContextResult<ContextStatus> {
        let shared = &self.shared;
        let _critical = shared.critical.lock().await;
        let leader = shared.lease.lock().await.is_some();
        Ok(ContextStatus {
            database: shared.config.database.clone(),
            leader,
            current_csn: shared
                .bounded("sequence.get_current_csn", shared.sequence.get_current_csn())
                .await?,
            last_csn: shared
                .bounded("journal.last_csn", shared.journal.last_csn())
                .await?,
            last_digest: shared
                .bounded("journal.get_last_digest", shared.journal.get_last_digest())
                .await?,
        })
    }

    /// Returns true if this process holds the leadership lease.
    pub async fn is_leader(&self) -> bool {
        self.shared.lease.lock().await.is_some()
    }

    /// Subscribes to this context's events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ContextEvent> {
        self.shared.events.subscribe()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ContextConfig {
        &self.shared.config
    }

    /// Returns the database name.
    pub fn database(&self) -> &str {
        &self.shared.config.database
    }

    /// Returns the journal store.
    pub fn journal(&self) -> Arc<dyn JournalStore> {
        Arc::clone(&self.shared.journal)
    }
}

impl Drop for ContextManager {
    fn drop(&mut self) {
        if let Some(handle) = self.replication.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCoordinator;
    use contextd_codec::json::parse_json;
    use contextd_journal::TransactionType;

    fn doc(json: &str) -> Value {
        parse_json(json).unwrap()
    }

    async fn leader(database: &str) -> (ContextManager, Arc<LocalCoordinator>) {
        let coordinator = Arc::new(LocalCoordinator::new());
        let manager = ContextManager::in_memory(ContextConfig::new(database), coordinator.clone());
        manager.start().await.unwrap();
        assert!(manager.is_leader().await);
        (manager, coordinator)
    }

    #[tokio::test]
    async fn first_insert_gets_csn_one() {
        let (manager, _) = leader("db").await;
        let result = manager
            .exec(0, TransactionRequest::insert("t1", doc(r#"{"x": 1}"#)))
            .await
            .unwrap();
        assert_eq!(result, doc(r#"{"_id": "t1", "x": 1, "csn": 1}"#));

        let entry = manager.journal().find_by_csn(1).await.unwrap().unwrap();
        assert_eq!(entry.before_digest, Digest::GENESIS);
        assert!(entry.verify_digest());
    }

    #[tokio::test]
    async fn explicit_id_is_kept() {
        let (manager, _) = leader("db").await;
        let result = manager
            .exec(0, TransactionRequest::insert("t1", doc(r#"{"_id": "own"}"#)))
            .await
            .unwrap();
        assert_eq!(result.get("_id"), Some(&Value::from("own")));
    }

    #[tokio::test]
    async fn rejections_leave_no_trace() {
        let (manager, _) = leader("db").await;
        manager
            .exec(0, TransactionRequest::insert("t1", doc("{}")))
            .await
            .unwrap();

        let stale = manager.exec(5, TransactionRequest::insert("t2", doc("{}"))).await;
        assert!(matches!(stale, Err(ContextError::Consistency(_))));

        let bad_operator = TransactionRequest::update("t1", doc("{}"), doc(r#"{"$nope": {}}"#));
        assert!(matches!(
            manager.exec(1, bad_operator).await,
            Err(ContextError::InvalidRequest(_))
        ));

        let status = manager.status().await.unwrap();
        assert_eq!(status.current_csn, 1);
        assert_eq!(status.last_csn, 1);
    }

    #[tokio::test]
    async fn unencodable_requests_take_no_csn() {
        let (manager, _) = leader("db").await;
        for bad in [
            Value::map([("d", Value::Timestamp(i64::MAX))]),
            Value::map([("d", Value::Timestamp(300_000_000_000_000))]),
            Value::map([("f", Value::Float(f64::NAN))]),
        ] {
            assert!(matches!(
                manager.exec(0, TransactionRequest::insert("t1", bad)).await,
                Err(ContextError::InvalidRequest(_))
            ));
        }
        assert_eq!(manager.status().await.unwrap().current_csn, 0);

        let result = manager
            .exec(0, TransactionRequest::insert("t2", doc(r#"{"p": 9.99}"#)))
            .await
            .unwrap();
        assert_eq!(result.get("csn"), Some(&Value::Integer(1)));

        let entries = manager.journal().entries_from(1, usize::MAX).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].csn, 1);
        assert!(contextd_journal::verify_chain(&entries).is_valid());
    }

    #[tokio::test]
    async fn followers_refuse_exec() {
        let (_leader, coordinator) = leader("db").await;
        let follower = ContextManager::in_memory(ContextConfig::new("db"), coordinator);
        follower.start().await.unwrap();
        assert!(!follower.is_leader().await);
        assert!(matches!(
            follower
                .exec(0, TransactionRequest::marker(TransactionType::BeginImport))
                .await,
            Err(ContextError::NotLeader)
        ));
    }

    #[tokio::test]
    async fn tampered_entry_rejected() {
        let (manager, _) = leader("db").await;
        let mut txn = TransactionObject::seal(
            TransactionRequest::insert("t1", doc("{}")),
            1,
            0,
            Digest::GENESIS,
        )
        .unwrap();
        txn.request.target = "t2".into();
        assert!(matches!(
            manager.on_receive(txn).await,
            Err(ContextError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn start_requires_database() {
        let manager =
            ContextManager::in_memory(ContextConfig::default(), Arc::new(LocalCoordinator::new()));
        assert!(matches!(
            manager.start().await,
            Err(ContextError::Config(_))
        ));
    }

    #[tokio::test]
    async fn stop_releases_lease() {
        let (manager, coordinator) = leader("db").await;
        let mut events = manager.subscribe_events();
        manager.stop().await.unwrap();
        assert!(!manager.is_leader().await);
        assert!(!coordinator.is_leased("/db/context"));
        assert_eq!(events.recv().await.unwrap(), ContextEvent::LeadershipLost);
    }
}

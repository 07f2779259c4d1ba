//! Election and broadcast contract.
//!
//! The context manager relies on an external primitive for two things:
//!
//! - an exclusive lease per leadership path, held by at most one process
//! - reliable fan-out of payloads published on a topic path
//!
//! [`Coordinator`] abstracts that primitive. [`LocalCoordinator`] implements
//! it in-process for single-node deployments and tests, with hooks to revoke
//! leases and delay or drop deliveries.

use crate::error::ContextResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// An exclusive leadership lease.
///
/// Opaque to the holder. A lease stays in the holder's hands even after the
/// coordinator has granted the path to someone else; releasing such a stale
/// lease has no effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    path: String,
    token: Uuid,
}

impl Lease {
    /// Creates a lease for `path` with a fresh token.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            token: Uuid::new_v4(),
        }
    }

    /// The leadership path this lease covers.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The grant token.
    pub fn token(&self) -> Uuid {
        self.token
    }
}

/// Inbound payloads published on one topic.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    /// Wraps a channel receiver.
    pub fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Waits for the next payload. `None` once the topic is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Leader election and broadcast primitive.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Requests the exclusive lease on `path`. `None` if another process
    /// holds it.
    async fn acquire_lease(&self, path: &str) -> ContextResult<Option<Lease>>;

    /// Gives a lease back. Stale leases are ignored.
    async fn release_lease(&self, lease: Lease) -> ContextResult<()>;

    /// Subscribes to every payload published on `path` from now on.
    async fn subscribe(&self, path: &str) -> ContextResult<Subscription>;

    /// Publishes a payload to every subscriber of `path`. Does not wait for
    /// delivery.
    async fn publish(&self, path: &str, payload: Vec<u8>) -> ContextResult<()>;
}

#[derive(Debug, Default)]
struct LocalState {
    leases: HashMap<String, Uuid>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    paused: bool,
    queued: Vec<(String, Vec<u8>)>,
    drop_next: usize,
}

impl LocalState {
    fn deliver(&mut self, path: &str, payload: &[u8]) {
        if let Some(senders) = self.subscribers.get_mut(path) {
            senders.retain(|tx| tx.send(payload.to_vec()).is_ok());
        }
    }
}

/// In-process coordinator.
///
/// Grants at most one lease per path and delivers each publish to every
/// subscriber in publish order.
#[derive(Debug, Default)]
pub struct LocalCoordinator {
    state: Mutex<LocalState>,
}

impl LocalCoordinator {
    /// Creates a coordinator with no leases or subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if some process holds the lease on `path`.
    pub fn is_leased(&self, path: &str) -> bool {
        self.state.lock().leases.contains_key(path)
    }

    /// Withdraws the grant on `path` without telling the holder.
    ///
    /// Returns true if a lease was held.
    pub fn revoke(&self, path: &str) -> bool {
        let revoked = self.state.lock().leases.remove(path).is_some();
        debug!(path, revoked, "lease revoked");
        revoked
    }

    /// Queues publishes instead of delivering them.
    pub fn pause_delivery(&self) {
        self.state.lock().paused = true;
    }

    /// Delivers every queued publish in order and resumes normal delivery.
    pub fn resume_delivery(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        let queued = std::mem::take(&mut state.queued);
        for (path, payload) in queued {
            state.deliver(&path, &payload);
        }
    }

    /// Silently discards the next `n` publishes.
    pub fn drop_next(&self, n: usize) {
        self.state.lock().drop_next = n;
    }

    /// Number of publishes waiting for [`resume_delivery`](Self::resume_delivery).
    pub fn queued(&self) -> usize {
        self.state.lock().queued.len()
    }
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    async fn acquire_lease(&self, path: &str) -> ContextResult<Option<Lease>> {
        let mut state = self.state.lock();
        if state.leases.contains_key(path) {
            return Ok(None);
        }
        let lease = Lease::new(path);
        state.leases.insert(path.to_string(), lease.token());
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease: Lease) -> ContextResult<()> {
        let mut state = self.state.lock();
        if state.leases.get(lease.path()) == Some(&lease.token()) {
            state.leases.remove(lease.path());
        } else {
            debug!(path = lease.path(), "ignoring release of stale lease");
        }
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> ContextResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn publish(&self, path: &str, payload: Vec<u8>) -> ContextResult<()> {
        let mut state = self.state.lock();
        if state.drop_next > 0 {
            state.drop_next -= 1;
            debug!(path, "dropping publish");
        } else if state.paused {
            state.queued.push((path.to_string(), payload));
        } else {
            state.deliver(path, &payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_lease_per_path() {
        let coordinator = LocalCoordinator::new();
        let lease = coordinator.acquire_lease("/db/context").await.unwrap().unwrap();
        assert!(coordinator.acquire_lease("/db/context").await.unwrap().is_none());
        assert!(coordinator.acquire_lease("/other/context").await.unwrap().is_some());

        coordinator.release_lease(lease).await.unwrap();
        assert!(coordinator.acquire_lease("/db/context").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_release_keeps_new_holder() {
        let coordinator = LocalCoordinator::new();
        let stale = coordinator.acquire_lease("/db/context").await.unwrap().unwrap();
        assert!(coordinator.revoke("/db/context"));

        let current = coordinator.acquire_lease("/db/context").await.unwrap().unwrap();
        coordinator.release_lease(stale).await.unwrap();
        assert!(coordinator.is_leased("/db/context"));

        coordinator.release_lease(current).await.unwrap();
        assert!(!coordinator.is_leased("/db/context"));
    }

    #[tokio::test]
    async fn fan_out_to_every_subscriber() {
        let coordinator = LocalCoordinator::new();
        let mut a = coordinator.subscribe("/db/transaction").await.unwrap();
        let mut b = coordinator.subscribe("/db/transaction").await.unwrap();

        coordinator.publish("/db/transaction", vec![1]).await.unwrap();
        coordinator.publish("/elsewhere", vec![9]).await.unwrap();

        assert_eq!(a.recv().await, Some(vec![1]));
        assert_eq!(b.recv().await, Some(vec![1]));
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pause_queues_in_order() {
        let coordinator = LocalCoordinator::new();
        let mut sub = coordinator.subscribe("/t").await.unwrap();

        coordinator.pause_delivery();
        coordinator.publish("/t", vec![1]).await.unwrap();
        coordinator.publish("/t", vec![2]).await.unwrap();
        assert_eq!(coordinator.queued(), 2);
        assert!(sub.rx.try_recv().is_err());

        coordinator.resume_delivery();
        assert_eq!(sub.recv().await, Some(vec![1]));
        assert_eq!(sub.recv().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn drop_next_loses_messages() {
        let coordinator = LocalCoordinator::new();
        let mut sub = coordinator.subscribe("/t").await.unwrap();

        coordinator.drop_next(1);
        coordinator.publish("/t", vec![1]).await.unwrap();
        coordinator.publish("/t", vec![2]).await.unwrap();
        assert_eq!(sub.recv().await, Some(vec![2]));
    }
}

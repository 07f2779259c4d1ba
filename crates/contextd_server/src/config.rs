//! Context manager configuration.

use crate::error::{ContextError, ContextResult};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one database's context manager.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Database name. Used to build the topic, leadership and RPC paths.
    pub database: String,
    /// Bound on each journal or sequence call made while holding the lock.
    pub store_timeout: Duration,
    /// Capacity of the event channel.
    pub event_capacity: usize,
    /// Root directory for file-backed stores. In-memory stores if `None`.
    pub data_dir: Option<PathBuf>,
}

impl ContextConfig {
    /// Creates a configuration for `database`.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            store_timeout: Duration::from_secs(10),
            event_capacity: 256,
            data_dir: None,
        }
    }

    /// Sets the store call timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Persists stores under `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Checks the configuration before start.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Config`] if the database name is missing or
    /// contains `/`, or a bound is zero.
    pub fn validate(&self) -> ContextResult<()> {
        if self.database.is_empty() {
            return Err(ContextError::Config("database name is missing".into()));
        }
        if self.database.contains('/') {
            return Err(ContextError::Config(format!(
                "database name {:?} contains '/'",
                self.database
            )));
        }
        if self.store_timeout.is_zero() {
            return Err(ContextError::Config("store timeout must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(ContextError::Config("event capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Topic carrying committed transactions.
    pub fn transaction_path(&self) -> String {
        format!("/{}/transaction", self.database)
    }

    /// Leadership path registered in exclusive single-holder mode.
    pub fn context_path(&self) -> String {
        format!("/{}/context", self.database)
    }

    /// RPC route accepting `exec` calls.
    pub fn exec_path(&self) -> String {
        format!("/{}/exec", self.database)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_needs_database() {
        let config = ContextConfig::default();
        assert_eq!(config.store_timeout, Duration::from_secs(10));
        assert!(matches!(config.validate(), Err(ContextError::Config(_))));
    }

    #[test]
    fn config_builder() {
        let config = ContextConfig::new("orders")
            .with_store_timeout(Duration::from_millis(50))
            .with_event_capacity(8)
            .with_data_dir("/var/lib/contextd");

        config.validate().unwrap();
        assert_eq!(config.event_capacity, 8);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/contextd")));
    }

    #[test]
    fn paths() {
        let config = ContextConfig::new("orders");
        assert_eq!(config.transaction_path(), "/orders/transaction");
        assert_eq!(config.context_path(), "/orders/context");
        assert_eq!(config.exec_path(), "/orders/exec");
    }

    #[test]
    fn rejects_bad_names_and_bounds() {
        assert!(ContextConfig::new("a/b").validate().is_err());
        assert!(ContextConfig::new("a")
            .with_store_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}

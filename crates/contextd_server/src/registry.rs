//! Multi-database routing.

use crate::error::{ContextError, ContextResult};
use crate::manager::ContextManager;
use crate::rpc::{self, RpcRequest, RpcResponse};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Independent contexts keyed by database name.
///
/// Requests for `/<database>/…` go to that database's manager.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: RwLock<HashMap<String, Arc<ContextManager>>>,
}

impl ContextRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a manager under its database name.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Config`] if the name is already registered.
    pub fn register(&self, manager: Arc<ContextManager>) -> ContextResult<()> {
        let database = manager.database().to_string();
        let mut contexts = self.contexts.write();
        if contexts.contains_key(&database) {
            return Err(ContextError::Config(format!(
                "database {database} is already registered"
            )));
        }
        info!(database = %database, "registered context");
        contexts.insert(database, manager);
        Ok(())
    }

    /// Removes and returns a manager.
    pub fn remove(&self, database: &str) -> Option<Arc<ContextManager>> {
        self.contexts.write().remove(database)
    }

    /// Looks up a manager.
    pub fn get(&self, database: &str) -> Option<Arc<ContextManager>> {
        self.contexts.read().get(database).cloned()
    }

    /// Looks up a manager, failing for unknown names.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::UnknownDatabase`] if nothing is registered
    /// under `database`.
    pub fn require(&self, database: &str) -> ContextResult<Arc<ContextManager>> {
        self.get(database)
            .ok_or_else(|| ContextError::UnknownDatabase(database.to_string()))
    }

    /// Registered database names, sorted.
    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.contexts.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stops every registered manager.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the remaining managers are still stopped.
    pub async fn stop_all(&self) -> ContextResult<()> {
        let managers: Vec<Arc<ContextManager>> = self.contexts.read().values().cloned().collect();
        let mut first = None;
        for manager in managers {
            if let Err(e) = manager.stop().await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Routes a call to the database named by the first path segment.
    pub async fn handle(&self, request: &RpcRequest) -> RpcResponse {
        if request.method.eq_ignore_ascii_case("OPTIONS") {
            return RpcResponse::preflight();
        }

        let database = request
            .route()
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default();
        match self.require(database) {
            Ok(manager) => rpc::handle(&manager, request).await,
            Err(e) => RpcResponse::not_found(&e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCoordinator;
    use crate::config::ContextConfig;

    fn manager(database: &str) -> Arc<ContextManager> {
        Arc::new(ContextManager::in_memory(
            ContextConfig::new(database),
            Arc::new(LocalCoordinator::new()),
        ))
    }

    #[test]
    fn register_and_lookup() {
        let registry = ContextRegistry::new();
        registry.register(manager("orders")).unwrap();
        registry.register(manager("audit")).unwrap();

        assert_eq!(registry.databases(), vec!["audit", "orders"]);
        assert!(registry.get("orders").is_some());
        assert!(matches!(
            registry.require("missing"),
            Err(ContextError::UnknownDatabase(_))
        ));
        assert!(matches!(
            registry.register(manager("orders")),
            Err(ContextError::Config(_))
        ));

        assert!(registry.remove("orders").is_some());
        assert_eq!(registry.databases(), vec!["audit"]);
    }

    #[tokio::test]
    async fn unknown_database_is_404() {
        let registry = ContextRegistry::new();
        let response = registry.handle(&RpcRequest::post("/nope/exec", "{}")).await;
        assert_eq!(response.status, 404);
        assert_eq!(
            response.json_body().unwrap()["error"],
            "unknown database: nope"
        );
    }
}

//! # contextd server
//!
//! The context manager: one leader per database commits transactions to a
//! digest-chained journal, and every process replicates them.
//!
//! This crate provides:
//! - leader election over an external lease primitive ([`Coordinator`])
//! - the commit path behind the `exec` RPC
//! - the replication path with idempotent apply and fork repair
//! - transport-agnostic RPC routing across several databases
//!
//! # Architecture
//!
//! ```text
//! client -> RPC exec -> ContextManager::exec (leader, under lock)
//!                          -> journal + sequence stores
//!                          -> publish /<db>/transaction
//!                                 -> every ContextManager::on_receive (under lock)
//!                                        -> journal + sequence stores
//! ```
//!
//! Cross-process exclusion rests only on the lease. A stale leader can
//! commit a conflicting entry; the next broadcast of the same csn exposes the
//! fork and every process converges on the last delivered version.
//!
//! # Example
//!
//! ```rust,ignore
//! use contextd_server::{ContextConfig, ContextManager, ContextRegistry, LocalCoordinator, RpcRequest};
//!
//! let coordinator = Arc::new(LocalCoordinator::new());
//! let manager = Arc::new(ContextManager::open(
//!     ContextConfig::new("orders").with_data_dir("/var/lib/contextd"),
//!     coordinator,
//! )?);
//! manager.start().await?;
//!
//! let registry = ContextRegistry::new();
//! registry.register(manager)?;
//! let response = registry
//!     .handle(&RpcRequest::post("/orders/exec", r#"{"csn": 0, "request": {...}}"#))
//!     .await;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod cluster;
mod config;
mod error;
mod event;
mod manager;
mod registry;
pub mod rpc;

pub use cluster::{Coordinator, Lease, LocalCoordinator, Subscription};
pub use config::ContextConfig;
pub use error::{ContextError, ContextResult};
pub use event::ContextEvent;
pub use manager::{ApplyOutcome, ContextManager, ContextStatus};
pub use registry::ContextRegistry;
pub use rpc::{ExecResponse, RpcRequest, RpcResponse};

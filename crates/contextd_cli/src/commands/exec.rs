//! Exec command implementation.

use contextd_codec::json::parse_json;
use contextd_journal::TransactionRequest;
use contextd_server::{ContextConfig, ContextManager, ExecResponse, LocalCoordinator};
use std::path::Path;
use std::sync::Arc;

/// Commits one request through a single-node context over the file stores
/// under `data_dir`.
pub async fn exec(
    data_dir: &Path,
    database: &str,
    csn: u64,
    request: TransactionRequest,
) -> Result<ExecResponse, Box<dyn std::error::Error>> {
    let config = ContextConfig::new(database).with_data_dir(data_dir);
    let manager = ContextManager::open(config, Arc::new(LocalCoordinator::new()))?;
    manager.start().await?;
    if !manager.is_leader().await {
        return Err("could not acquire leadership".into());
    }

    let response = ExecResponse::from_result(manager.exec(csn, request).await);
    manager.stop().await?;
    Ok(response)
}

/// Runs the exec command.
pub fn run(
    data_dir: &Path,
    database: &str,
    csn: u64,
    request: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = TransactionRequest::from_value(&parse_json(request)?)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let response = runtime.block_on(exec(data_dir, database, csn, request))?;
    println!("{}", serde_json::to_string_pretty(&response.to_json())?);

    if response.is_ok() {
        Ok(())
    } else {
        Err("Request rejected".into())
    }
}

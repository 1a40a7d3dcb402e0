//! Timeout helpers for model calls and clarification waits.

use std::future::Future;
use std::time::Duration;

use crate::types::{LoomError, Result};

/// Execute an async operation with a timeout
///
/// Returns `LoomError::Timeout` if the operation doesn't complete in time.
pub async fn with_timeout<T, F>(timeout: Duration, future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(LoomError::timeout(operation_name, timeout)),
    }
}

/// Like [`with_timeout`] for futures that don't return a `Result`
pub async fn with_timeout_map<T, F>(timeout: Duration, future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => Ok(result),
        Err(_) => Err(LoomError::timeout(operation_name, timeout)),
    }
}

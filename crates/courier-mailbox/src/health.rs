//! Storage health check

use courier_core::{CourierError, CourierResult};
use opendal::Operator;

/// Verify the storage backend is reachable by listing the root
pub async fn check_health(op: &Operator) -> CourierResult<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| CourierError::Storage(format!("storage health check failed: {e}")))
}

/// Returns true if storage is reachable, false otherwise (non-panicking)
pub async fn is_healthy(op: &Operator) -> bool {
    check_health(op).await.is_ok()
}

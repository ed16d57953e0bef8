// ABOUTME: Bounded execution of a future with a distinguishable timeout error
//
// On timeout the operation's future is dropped, abandoning the work at its
// next suspension point. Work that has to outlive its waiter must run in its
// own task; only the wait is bounded then.

use std::future::Future;
use std::time::Duration;

use super::error::{ProxyError, ProxyResult};

/// Runs `operation` for at most `limit`.
///
/// Returns the operation's own result if it finishes first, or
/// [`ProxyError::Timeout`] if `limit` elapses first. Check for the timeout
/// case with [`is_timeout`] rather than by message.
pub async fn timeout_in<T, F>(operation: F, limit: Duration) -> ProxyResult<T>
where
    F: Future<Output = ProxyResult<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Timeout(limit)),
    }
}

/// Whether `err` was produced by a bounded wait elapsing.
pub const fn is_timeout(err: &ProxyError) -> bool {
    err.is_timeout()
}

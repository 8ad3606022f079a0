//! Dispatch scope tracking.
//!
//! Uses `tokio::task_local!` to mark the task that is currently running a
//! loader's batch function, so a `load` issued from inside it can be refused
//! instead of waiting on a window that can never close.

use std::future::Future;

tokio::task_local! {
    static DISPATCHING: u64;
}

/// Run `fut` marked as the batch function of loader `loader_id`.
pub(crate) async fn dispatching<F>(loader_id: u64, fut: F) -> F::Output
where
    F: Future,
{
    DISPATCHING.scope(loader_id, fut).await
}

/// True when called from within the batch function of loader `loader_id`.
pub(crate) fn is_dispatching(loader_id: u64) -> bool {
    DISPATCHING
        .try_with(|current| *current == loader_id)
        .unwrap_or(false)
}

use std::{future::Future, time::Duration};

use log::warn;

/// Resolves once the process receives ctrl-c. If the signal cannot be
/// listened for, never resolves.
pub async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for interrupts: {e}");
        std::future::pending::<()>().await;
    }
}

/// `None` when `limit` passes before `future` completes.
pub async fn with_optional_timeout<F: Future>(limit: Option<Duration>, future: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::select!(
            _ = tokio::time::sleep(limit) => None,
            output = future => Some(output),
        ),
        None => Some(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_futures_are_cut_off() {
        let slow = tokio::time::sleep(Duration::from_secs(30));
        assert!(with_optional_timeout(Some(Duration::from_millis(20)), slow)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn no_limit_waits_for_completion() {
        assert_eq!(with_optional_timeout(None, async { 3 }).await, Some(3));
    }
}

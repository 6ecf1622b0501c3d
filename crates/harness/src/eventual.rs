//! Eventual-consistency helpers for timing-dependent verification.
//!
//! A successful deploy returns before the control plane's listing index and
//! per-resource status have fully settled. This module provides retry logic
//! with exponential backoff for assertions against that lag, with a
//! documented maximum per consistency category.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Categories of eventual consistency with documented ceilings.
#[derive(Debug, Clone, Copy)]
pub enum ConsistencyCategory {
    /// Control-plane listing/index propagation after a write (2x 15s
    /// observed propagation = 30s).
    ControlPlaneIndex,

    /// Individual resources settling into their terminal status after the
    /// CLI reports success (2x 30s observed = 60s).
    ResourceSettle,
}

impl ConsistencyCategory {
    /// Get the maximum timeout for this consistency category.
    pub fn timeout(&self) -> Duration {
        match self {
            ConsistencyCategory::ControlPlaneIndex => Duration::from_secs(30),
            ConsistencyCategory::ResourceSettle => Duration::from_secs(60),
        }
    }

    /// Get the initial retry delay for exponential backoff.
    fn initial_delay(&self) -> Duration {
        Duration::from_millis(500)
    }
}

/// Assert that a condition becomes true within the timeout for the given
/// consistency category.
///
/// Uses exponential backoff: 500ms initial delay, 2x multiplier, retrying
/// until the category's timeout is reached.
pub async fn assert_eventually<F, Fut>(
    category: ConsistencyCategory,
    mut condition: F,
) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let timeout = category.timeout();
    let mut delay = category.initial_delay();
    let start = std::time::Instant::now();

    loop {
        if condition().await {
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(format!(
                "Condition not met within {:?} (category: {:?})",
                timeout, category
            ));
        }

        sleep(delay).await;

        delay *= 2;

        // Cap delay at remaining time
        let remaining = timeout.saturating_sub(elapsed);
        if delay > remaining {
            delay = remaining;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_category_timeouts() {
        assert_eq!(
            ConsistencyCategory::ControlPlaneIndex.timeout(),
            Duration::from_secs(30)
        );
        assert_eq!(
            ConsistencyCategory::ResourceSettle.timeout(),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn test_assert_eventually_succeeds_immediately() {
        let result =
            assert_eventually(ConsistencyCategory::ControlPlaneIndex, || async { true }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_assert_eventually_succeeds_after_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = assert_eventually(ConsistencyCategory::ControlPlaneIndex, move || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                count >= 2
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }
}

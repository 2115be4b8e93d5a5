//! Bounded-retry convergence polling.
//!
//! The harness never sleeps to order phases; it only polls for state that the
//! scheduler under test updates asynchronously (status updates landing in the store,
//! launch confirmations). Polls are bounded and report what they saw on timeout.

use std::future::Future;
use std::time::Duration;

use tracing::trace;
use tracing::warn;

use crate::config::PollOptions;
use crate::error::PollTimeoutSnafu;
use crate::error::Result;
use crate::verified::max_poll_attempts;

/// Re-evaluates a predicate at fixed spacing until it holds or time runs out.
#[derive(Debug, Clone, Copy)]
pub struct ConvergencePoller {
    options: PollOptions,
}

impl ConvergencePoller {
    /// Create a poller.
    pub fn new(options: PollOptions) -> Self {
        Self { options }
    }

    /// Spacing and timeout in force.
    pub fn options(&self) -> PollOptions {
        self.options
    }

    /// Poll `predicate` until it returns `true`.
    ///
    /// Fails with [`crate::SimError::PollTimeout`] (without diagnostics) when the attempt
    /// budget is exhausted. Errors from the predicate propagate immediately.
    pub async fn poll<P, Fut>(&self, label: &str, predicate: P) -> Result<()>
    where
        P: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        if self.run(label, predicate).await? {
            return Ok(());
        }
        warn!(label, timeout_ms = self.options.timeout_ms, "poll timed out");
        PollTimeoutSnafu {
            label,
            timeout_ms: self.options.timeout_ms,
            diagnostics: None::<String>,
        }
        .fail()
    }

    /// Poll `predicate` until it returns `true`, attaching `diagnostics()` on timeout.
    pub async fn poll_with_diagnostics<P, Fut, D, DFut>(&self, label: &str, predicate: P, diagnostics: D) -> Result<()>
    where
        P: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
        D: FnOnce() -> DFut,
        DFut: Future<Output = String>,
    {
        if self.run(label, predicate).await? {
            return Ok(());
        }
        let report = diagnostics().await;
        warn!(label, timeout_ms = self.options.timeout_ms, diagnostics = %report, "poll timed out");
        PollTimeoutSnafu {
            label,
            timeout_ms: self.options.timeout_ms,
            diagnostics: Some(report),
        }
        .fail()
    }

    async fn run<P, Fut>(&self, label: &str, mut predicate: P) -> Result<bool>
    where
        P: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let attempts = max_poll_attempts(self.options.interval_ms, self.options.timeout_ms);
        let interval = Duration::from_millis(self.options.interval_ms);

        for attempt in 1..=attempts {
            if predicate().await? {
                trace!(label, attempt, "poll converged");
                return Ok(true);
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::SimError;
    use crate::error::StoreError;

    fn poller(interval_ms: u64, timeout_ms: u64) -> ConvergencePoller {
        ConvergencePoller::new(PollOptions { interval_ms, timeout_ms })
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_predicate_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        poller(10, 1_000)
            .poll("third attempt", || {
                let counter = Arc::clone(&counter);
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3) }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn observes_external_mutation() {
        let flag = Arc::new(AtomicU32::new(0));
        let writer = Arc::clone(&flag);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(55)).await;
            writer.store(1, Ordering::SeqCst);
        });

        let reader = Arc::clone(&flag);
        poller(10, 1_000)
            .poll("flag set", || {
                let reader = Arc::clone(&reader);
                async move { Ok(reader.load(Ordering::SeqCst) == 1) }
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_carries_diagnostics() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = poller(10, 100)
            .poll_with_diagnostics(
                "never",
                || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(false)
                    }
                },
                || async { "store=3 cluster=2".to_string() },
            )
            .await
            .unwrap_err();

        match err {
            SimError::PollTimeout {
                label,
                timeout_ms,
                diagnostics,
            } => {
                assert_eq!(label, "never");
                assert_eq!(timeout_ms, 100);
                assert_eq!(diagnostics.as_deref(), Some("store=3 cluster=2"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_diagnostics() {
        let err = poller(10, 20).poll("never", || async { Ok(false) }).await.unwrap_err();
        assert!(matches!(err, SimError::PollTimeout { diagnostics: None, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_error_propagates() {
        let err = poller(10, 1_000)
            .poll("broken", || async {
                Err(SimError::from(StoreError::Unavailable {
                    reason: "down".to_string(),
                }))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Store { .. }));
    }
}

//! Exponential backoff for transient chain API failures.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ccdindex_core::error::IndexerError;
use ccdindex_core::types::Header;

use crate::api::ChainApi;
use crate::types::Block;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Stateless retry policy; computes the next delay given the attempt number.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max_backoff.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Run `op`, retrying while it fails with a retryable error.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T, IndexerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let Some(delay) = self.next_delay(attempt) else {
                        tracing::error!(op = name, attempts = attempt, error = %e, "Retries exhausted");
                        return Err(e);
                    };
                    tracing::warn!(op = name, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying chain API call");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A [`ChainApi`] that retries timeouts, disconnections and rate limits.
pub struct RetryingChainApi<A> {
    inner: A,
    policy: RetryPolicy,
}

impl<A: ChainApi> RetryingChainApi<A> {
    pub fn new(inner: A, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn into_arc(self) -> Arc<dyn ChainApi>
    where
        A: 'static,
    {
        Arc::new(self)
    }
}

#[async_trait]
impl<A: ChainApi> ChainApi for RetryingChainApi<A> {
    async fn init(&self) -> Result<(), IndexerError> {
        self.policy.run("init", || self.inner.init()).await
    }

    async fn finalized_header(&self) -> Result<Header, IndexerError> {
        self.policy
            .run("finalized_header", || self.inner.finalized_header())
            .await
    }

    async fn best_height(&self) -> Result<u64, IndexerError> {
        self.policy.run("best_height", || self.inner.best_height()).await
    }

    async fn fetch_blocks(&self, heights: &[u64]) -> Result<Vec<Block>, IndexerError> {
        self.policy
            .run("fetch_blocks", || self.inner.fetch_blocks(heights))
            .await
    }

    async fn header_by_hash(&self, hash: &str) -> Result<Header, IndexerError> {
        self.policy
            .run("header_by_hash", || self.inner.header_by_hash(hash))
            .await
    }

    fn chain_id(&self) -> String {
        self.inner.chain_id()
    }

    fn genesis_hash(&self) -> String {
        self.inner.genesis_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        })
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
        });
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(300)));
        assert_eq!(policy.next_delay(5), None);
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(IndexerError::chain_api("disconnected from node"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_large_responses() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(3)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IndexerError::chain_api("Exceeded max limit of 4MB"))
            })
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(2)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IndexerError::chain_api("Rate Limited at endpoint: x"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

//! The store seam: where processed blocks become externally visible.

use async_trait::async_trait;

use crate::error::IndexerError;

/// The entity store cache the dispatcher commits through.
///
/// `flush` is only ever called after every handler for `up_to` has returned,
/// and in ascending height order.
#[async_trait]
pub trait StoreCache: Send + Sync {
    /// Commit everything written by handlers up to and including `up_to`.
    async fn flush(&self, up_to: u64) -> Result<(), IndexerError>;

    /// Drop everything written above `to` (fork or dynamic-datasource rewind).
    async fn rewind(&self, to: u64) -> Result<(), IndexerError>;
}

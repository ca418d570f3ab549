//! Unfinalized block tracking: detects forks among blocks past the finalized height.
//!
//! When indexing past finality, every processed block above the last known
//! finalized height is remembered as a [`Header`]. Each time the node reports a
//! new finalized head, the remembered headers that it now covers are checked
//! against the finalized chain. A mismatch means the indexer processed blocks
//! from a fork, and processing must rewind to the last height both chains share.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::Header;

/// Resolves block headers by hash; implemented by the chain API.
#[async_trait]
pub trait HeaderSource: Send + Sync {
    async fn header_by_hash(&self, hash: &str) -> Result<Header, IndexerError>;
}

/// Tracks processed headers that are not yet final.
#[derive(Debug, Default, Clone)]
pub struct UnfinalizedBlocks {
    /// Processed headers above the finalized height (ascending).
    headers: Vec<Header>,
    /// Latest finalized header reported by the node.
    finalized: Option<Header>,
    /// Highest processed height known to be on the finalized chain.
    last_verified_height: Option<u64>,
}

impl UnfinalizedBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from headers persisted in a checkpoint.
    pub fn from_headers(mut headers: Vec<Header>) -> Self {
        headers.sort_by_key(|h| h.height);
        headers.dedup_by_key(|h| h.height);
        Self {
            headers,
            ..Self::default()
        }
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn finalized(&self) -> Option<&Header> {
        self.finalized.as_ref()
    }

    pub fn finalized_height(&self) -> Option<u64> {
        self.finalized.as_ref().map(|h| h.height)
    }

    pub fn last_verified_height(&self) -> Option<u64> {
        self.last_verified_height
    }

    /// Register the node's latest finalized header.
    ///
    /// A finalized height lower than one already seen is an RPC inconsistency
    /// (usually a node switch) and is ignored.
    pub fn register_finalized(&mut self, header: Header) {
        if let Some(current) = &self.finalized {
            if header.height < current.height {
                tracing::warn!(
                    last_finalized = current.height,
                    new_finalized = header.height,
                    "Finalized block decreased, ignoring"
                );
                return;
            }
        }
        self.finalized = Some(header);
    }

    /// Record a processed block and check the remembered headers for a fork.
    ///
    /// Returns `Some(height)` when processing must rewind to `height`.
    pub async fn process_block(
        &mut self,
        header: Header,
        source: &dyn HeaderSource,
    ) -> Result<Option<u64>, IndexerError> {
        match self.finalized_height() {
            Some(finalized) if header.height <= finalized => {
                self.last_verified_height =
                    Some(self.last_verified_height.map_or(header.height, |h| h.max(header.height)));
            }
            _ => {
                // A re-processed height replaces whatever was remembered from it upward.
                self.headers.retain(|h| h.height < header.height);
                self.headers.push(header);
            }
        }

        if let Some(forked) = self.has_forked(source).await? {
            let rewind_to = self.last_correct_height(&forked, source).await?;
            tracing::warn!(
                rewind_to,
                finalized = forked.height,
                "Fork detected in unfinalized blocks"
            );
            self.headers.clear();
            self.last_verified_height = Some(rewind_to);
            return Ok(Some(rewind_to));
        }

        self.remove_finalized();
        Ok(None)
    }

    /// Forget every header above `height` (after a rewind elsewhere).
    pub fn rewind_to(&mut self, height: u64) {
        self.headers.retain(|h| h.height <= height);
        if let Some(verified) = self.last_verified_height {
            self.last_verified_height = Some(verified.min(height));
        }
    }

    /// Returns the finalized-chain header at the highest remembered height that
    /// is now final, if its hash differs from the one processed.
    async fn has_forked(&self, source: &dyn HeaderSource) -> Result<Option<Header>, IndexerError> {
        let Some(finalized) = self.finalized.clone() else {
            return Ok(None);
        };
        let Some(verifiable) = self
            .headers
            .iter()
            .rev()
            .find(|h| h.height <= finalized.height)
        else {
            return Ok(None);
        };

        if verifiable.height == finalized.height {
            return Ok((verifiable.hash != finalized.hash).then_some(finalized));
        }

        let mut checking = finalized;
        while checking.height > verifiable.height {
            checking = source.header_by_hash(&checking.parent_hash).await?;
        }
        if checking.hash != verifiable.hash {
            Ok(Some(checking))
        } else {
            Ok(None)
        }
    }

    /// Walk back through the remembered headers until one matches the
    /// finalized chain.
    async fn last_correct_height(
        &self,
        forked: &Header,
        source: &dyn HeaderSource,
    ) -> Result<u64, IndexerError> {
        let mut checking = forked.clone();
        for header in self.headers.iter().rev().filter(|h| h.height <= forked.height) {
            if header.hash == checking.hash || checking.extends(header) {
                return Ok(header.height);
            }
            checking = source.header_by_hash(&checking.parent_hash).await?;
        }

        self.last_verified_height.ok_or_else(|| IndexerError::ReorgDetected {
            height: forked.height,
            expected: forked.hash.clone(),
            actual: self
                .headers
                .iter()
                .find(|h| h.height == forked.height)
                .map(|h| h.hash.clone())
                .unwrap_or_default(),
        })
    }

    fn remove_finalized(&mut self) {
        let Some(finalized) = self.finalized_height() else {
            return;
        };
        if let Some(top) = self.headers.iter().rev().find(|h| h.height <= finalized) {
            let top = top.height;
            self.last_verified_height = Some(self.last_verified_height.map_or(top, |h| h.max(top)));
        }
        self.headers.retain(|h| h.height > finalized);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Chain(HashMap<String, Header>);

    impl Chain {
        fn new(headers: &[Header]) -> Self {
            Self(headers.iter().map(|h| (h.hash.clone(), h.clone())).collect())
        }
    }

    #[async_trait]
    impl HeaderSource for Chain {
        async fn header_by_hash(&self, hash: &str) -> Result<Header, IndexerError> {
            self.0
                .get(hash)
                .cloned()
                .ok_or_else(|| IndexerError::chain_api(format!("unknown hash {hash}")))
        }
    }

    fn h(height: u64, hash: &str, parent: &str) -> Header {
        Header::new(height, hash, parent)
    }

    #[tokio::test]
    async fn no_fork_prunes_finalized_headers() {
        let chain = Chain::new(&[h(10, "10", "9"), h(11, "11", "10"), h(12, "12", "11")]);
        let mut ub = UnfinalizedBlocks::new();
        ub.register_finalized(h(10, "10", "9"));

        assert_eq!(ub.process_block(h(11, "11", "10"), &chain).await.unwrap(), None);
        assert_eq!(ub.process_block(h(12, "12", "11"), &chain).await.unwrap(), None);
        assert_eq!(ub.headers().len(), 2);

        ub.register_finalized(h(12, "12", "11"));
        assert_eq!(ub.process_block(h(13, "13", "12"), &chain).await.unwrap(), None);
        assert_eq!(ub.headers().len(), 1);
        assert_eq!(ub.last_verified_height(), Some(12));
    }

    #[tokio::test]
    async fn fork_rewinds_to_common_ancestor() {
        let chain = Chain::new(&[h(10, "10", "9"), h(11, "11b", "10"), h(12, "12b", "11b")]);
        let mut ub = UnfinalizedBlocks::new();
        ub.register_finalized(h(10, "10", "9"));

        ub.process_block(h(10, "10", "9"), &chain).await.unwrap();
        ub.process_block(h(11, "11", "10"), &chain).await.unwrap();
        ub.process_block(h(12, "12", "11"), &chain).await.unwrap();

        ub.register_finalized(h(12, "12b", "11b"));
        let rewind = ub.process_block(h(13, "13", "12"), &chain).await.unwrap();
        assert_eq!(rewind, Some(10));
        assert!(ub.headers().is_empty());
    }

    #[tokio::test]
    async fn fork_with_no_verified_height_is_a_reorg() {
        let chain = Chain::new(&[h(10, "x10", "x9")]);
        let mut ub = UnfinalizedBlocks::new();
        ub.register_finalized(h(10, "10", "9"));
        assert_eq!(ub.process_block(h(11, "11", "10"), &chain).await.unwrap(), None);

        ub.register_finalized(h(11, "x11", "x10"));
        let err = ub.process_block(h(12, "12", "11"), &chain).await.unwrap_err();
        assert!(err.is_reorg());
        assert!(!err.is_fatal());
        assert_eq!(ub.headers().first().map(|h| h.height), Some(11));
    }

    #[tokio::test]
    async fn fork_found_by_walking_finalized_parents() {
        let chain = Chain::new(&[
            h(10, "10", "9"),
            h(11, "11b", "10"),
            h(12, "12b", "11b"),
            h(13, "13b", "12b"),
        ]);
        let mut ub = UnfinalizedBlocks::from_headers(vec![
            h(10, "10", "9"),
            h(11, "11", "10"),
            h(12, "12", "11"),
        ]);
        ub.register_finalized(h(13, "13b", "12b"));
        let rewind = ub.process_block(h(14, "14", "13"), &chain).await.unwrap();
        assert_eq!(rewind, Some(10));
    }

    #[tokio::test]
    async fn decreasing_finalized_is_ignored() {
        let mut ub = UnfinalizedBlocks::new();
        ub.register_finalized(h(20, "20", "19"));
        ub.register_finalized(h(15, "15", "14"));
        assert_eq!(ub.finalized_height(), Some(20));
    }

    #[tokio::test]
    async fn reprocessed_height_replaces_headers() {
        let chain = Chain::new(&[]);
        let mut ub = UnfinalizedBlocks::new();
        ub.register_finalized(h(5, "5", "4"));
        ub.process_block(h(6, "6", "5"), &chain).await.unwrap();
        ub.process_block(h(7, "7", "6"), &chain).await.unwrap();
        ub.process_block(h(6, "6b", "5"), &chain).await.unwrap();
        assert_eq!(ub.headers(), &[h(6, "6b", "5")]);
    }
}

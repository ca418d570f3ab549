//! The chain API seam.

use async_trait::async_trait;

use ccdindex_core::error::IndexerError;
use ccdindex_core::types::Header;
use ccdindex_core::unfinalized::HeaderSource;

use crate::types::Block;

/// Access to a Concordium node.
#[async_trait]
pub trait ChainApi: Send + Sync {
    /// Connect and read the genesis block.
    async fn init(&self) -> Result<(), IndexerError>;

    /// Header of the last finalized block.
    async fn finalized_header(&self) -> Result<Header, IndexerError>;

    /// Height of the best (possibly unfinalized) block.
    async fn best_height(&self) -> Result<u64, IndexerError>;

    /// One fully populated block per requested height, in the requested order.
    async fn fetch_blocks(&self, heights: &[u64]) -> Result<Vec<Block>, IndexerError>;

    async fn header_by_hash(&self, hash: &str) -> Result<Header, IndexerError>;

    fn chain_id(&self) -> String;

    fn genesis_hash(&self) -> String;
}

/// Adapts a [`ChainApi`] to the header lookups fork detection needs.
pub struct ApiHeaders<'a>(pub &'a dyn ChainApi);

#[async_trait]
impl HeaderSource for ApiHeaders<'_> {
    async fn header_by_hash(&self, hash: &str) -> Result<Header, IndexerError> {
        self.0.header_by_hash(hash).await
    }
}

/// Check that `blocks` holds exactly the requested heights, reordered to match.
pub fn ensure_complete(heights: &[u64], mut blocks: Vec<Block>) -> Result<Vec<Block>, IndexerError> {
    if blocks.len() != heights.len() {
        return Err(IndexerError::chain_api(format!(
            "requested {} blocks, node returned {}",
            heights.len(),
            blocks.len()
        )));
    }
    let mut ordered = Vec::with_capacity(heights.len());
    for &height in heights {
        let pos = blocks
            .iter()
            .position(|b| b.height() == height)
            .ok_or_else(|| IndexerError::chain_api(format!("no block returned for height {height}")))?;
        ordered.push(blocks.swap_remove(pos));
    }
    Ok(ordered)
}

//! Observer hooks for the fetch / dispatch pipeline.

use std::time::Duration;

/// Callbacks invoked at defined points in the pipeline. All default to no-ops.
pub trait IndexerObserver: Send + Sync {
    /// A batch of blocks finished fetching (any order).
    fn on_blocks_fetched(&self, _heights: &[u64]) {}

    /// A block finished processing and was flushed.
    fn on_block_indexed(&self, _height: u64, _matched_handlers: usize, _duration: Duration) {}

    /// Processing was rewound from `from` back to `to`.
    fn on_rewind(&self, _from: u64, _to: u64) {}

    /// A handler created a dynamic datasource effective at `height`.
    fn on_dynamic_ds_created(&self, _height: u64) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl IndexerObserver for NoopObserver {}

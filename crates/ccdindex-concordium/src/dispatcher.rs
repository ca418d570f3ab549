//! Block dispatcher: fetch-ahead with strictly ordered processing.
//!
//! Heights are queued by the fetch service, fetched in batches of
//! `batch_size` with up to `parallel_batches` batches in flight, buffered,
//! and processed one block at a time in ascending height order. A block is
//! processed when:
//!
//! 1. every matched handler has returned
//! 2. the store has been flushed up to its height
//! 3. the cursor has advanced
//!
//! With `workers > 0` the pending heights are indexed in rounds across a
//! [`WorkerPool`] instead, and the indexed blocks are committed here in the
//! same order.
//!
//! Creating a dynamic datasource discards everything buffered above the
//! block and notifies the fetch service to re-plan. A fork detected through
//! the unfinalized headers rewinds the store, the dynamic datasources and the
//! cursor to the last common height.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::task::JoinSet;

use ccdindex_core::checkpoint::{CheckpointManager, CheckpointState, CheckpointStore};
use ccdindex_core::cursor::DispatchCursor;
use ccdindex_core::error::IndexerError;
use ccdindex_core::indexer::IndexerConfig;
use ccdindex_core::observer::{IndexerObserver, NoopObserver};
use ccdindex_core::store::StoreCache;
use ccdindex_core::types::Header;
use ccdindex_core::unfinalized::UnfinalizedBlocks;

use crate::api::{ensure_complete, ApiHeaders, ChainApi};
use crate::dynamic_ds::{DatasourceParams, DatasourceRegistry};
use crate::indexer_manager::{IndexerManager, ProcessBlockResponse};
use crate::project::ProjectDs;
use crate::types::Block;
use crate::worker::WorkerPool;

/// Invoked with the block height at which a dynamic datasource was created.
pub type DynamicDsCallback = Box<dyn FnMut(u64) + Send>;

type FetchResult = (Vec<u64>, Result<Vec<Block>, IndexerError>);

/// Fetches, orders and processes blocks for one pipeline.
pub struct BlockDispatcher {
    config: IndexerConfig,
    api: Arc<dyn ChainApi>,
    manager: IndexerManager,
    registry: DatasourceRegistry,
    store: Arc<dyn StoreCache>,
    checkpoints: CheckpointManager,
    unfinalized: UnfinalizedBlocks,
    observer: Arc<dyn IndexerObserver>,
    cursor: DispatchCursor,
    last_hash: String,
    /// Heights enqueued but not processed, ascending.
    pending: VecDeque<u64>,
    /// Heights enqueued but not handed to a fetch task yet.
    to_fetch: VecDeque<u64>,
    fetched: BTreeMap<u64, Block>,
    in_flight: JoinSet<FetchResult>,
    /// Spawned on first use when `config.workers > 0`.
    pool: Option<WorkerPool>,
    /// Number of queue resets so far.
    resets: u64,
    on_dynamic_ds: Option<DynamicDsCallback>,
}

impl BlockDispatcher {
    pub fn new(
        config: IndexerConfig,
        api: Arc<dyn ChainApi>,
        manager: IndexerManager,
        registry: DatasourceRegistry,
        store: Arc<dyn StoreCache>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let checkpoints = CheckpointManager::new(
            checkpoint_store,
            &config.chain,
            &config.id,
            config.checkpoint_interval,
        );
        Self {
            config,
            api,
            manager,
            registry,
            store,
            checkpoints,
            unfinalized: UnfinalizedBlocks::new(),
            observer: Arc::new(NoopObserver),
            cursor: DispatchCursor::default(),
            last_hash: String::new(),
            pending: VecDeque::new(),
            to_fetch: VecDeque::new(),
            fetched: BTreeMap::new(),
            in_flight: JoinSet::new(),
            pool: None,
            resets: 0,
            on_dynamic_ds: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn IndexerObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Register the callback run when a handler creates a datasource.
    pub fn init(&mut self, on_dynamic_ds_created: DynamicDsCallback) {
        self.on_dynamic_ds = Some(on_dynamic_ds_created);
    }

    /// Resume from the saved checkpoint, or start at `start_height`.
    pub async fn restore(&mut self, start_height: u64) -> Result<(), IndexerError> {
        match self.checkpoints.load().await? {
            Some(cp) => {
                tracing::info!(
                    height = cp.block_height,
                    hash = %cp.block_hash,
                    unfinalized = cp.unfinalized.len(),
                    dynamic_ds = cp.dynamic_datasources.len(),
                    "Resuming from checkpoint"
                );
                let params = cp
                    .dynamic_datasources
                    .into_iter()
                    .map(serde_json::from_value::<DatasourceParams>)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| {
                        IndexerError::Storage(format!("corrupt dynamic datasource record: {e}"))
                    })?;
                self.registry.dynamic_mut().restore(params)?;
                self.unfinalized = UnfinalizedBlocks::from_headers(cp.unfinalized);
                self.cursor = DispatchCursor::resume_from(cp.block_height + 1);
                self.last_hash = cp.block_hash;
            }
            None => {
                tracing::info!(start_height, "No checkpoint, starting fresh");
                self.cursor = DispatchCursor::resume_from(start_height);
            }
        }
        Ok(())
    }

    pub fn cursor(&self) -> &DispatchCursor {
        &self.cursor
    }

    pub fn unfinalized(&self) -> &UnfinalizedBlocks {
        &self.unfinalized
    }

    /// Every datasource known so far, static and dynamic.
    pub fn datasources(&self) -> Vec<Arc<ProjectDs>> {
        self.registry.all().cloned().collect()
    }

    /// Number of enqueued heights not processed yet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// How many times buffered work has been discarded.
    pub fn reset_count(&self) -> u64 {
        self.resets
    }

    pub fn register_finalized(&mut self, header: Header) {
        self.unfinalized.register_finalized(header);
    }

    pub fn update_chain(&mut self, finalized_height: u64, best_height: u64) {
        self.cursor.update_chain(finalized_height, best_height);
    }

    /// Mark heights up to `height` as planned without enqueueing them.
    pub fn advance_buffered(&mut self, height: u64) {
        self.cursor.advance_buffered(height);
    }

    /// Queue `heights` for fetching. Waits (processing blocks meanwhile) while
    /// the fetch-ahead window is full.
    pub async fn enqueue_heights(&mut self, heights: Vec<u64>) -> Result<(), IndexerError> {
        let floor = self.cursor.latest_buffered_height;
        let mut heights: Vec<u64> = heights
            .into_iter()
            .filter(|h| floor.map_or(true, |f| *h > f))
            .collect();
        heights.sort_unstable();
        heights.dedup();
        if heights.is_empty() {
            return Ok(());
        }

        let max_queue = self.config.max_queue_size.max(1);
        let resets = self.resets;
        for height in heights {
            while self.pending.len() >= max_queue {
                if !self.tick().await? {
                    break;
                }
            }
            if self.resets != resets {
                // The rest of this plan is stale; the caller re-plans from the cursor.
                return Ok(());
            }
            self.pending.push_back(height);
            self.to_fetch.push_back(height);
            self.cursor.advance_buffered(height);
            self.spawn_fetches();
        }
        Ok(())
    }

    /// Wait for one fetch batch and process whatever became ready.
    ///
    /// Returns `false` when there is nothing left to wait for.
    pub async fn tick(&mut self) -> Result<bool, IndexerError> {
        if self.config.workers > 0 {
            return self.index_round().await;
        }
        self.spawn_fetches();
        if self.process_ready().await? {
            return Ok(true);
        }
        let Some(joined) = self.in_flight.join_next().await else {
            return Ok(false);
        };
        let (heights, result) =
            joined.map_err(|e| IndexerError::Other(format!("fetch task failed: {e}")))?;
        let blocks = result?;
        self.observer.on_blocks_fetched(&heights);
        tracing::debug!(
            from = heights.first().copied().unwrap_or_default(),
            to = heights.last().copied().unwrap_or_default(),
            "Fetched blocks"
        );
        for block in blocks {
            self.fetched.insert(block.height(), block);
        }
        self.process_ready().await?;
        self.spawn_fetches();
        Ok(true)
    }

    /// Process everything enqueued so far.
    pub async fn drain(&mut self) -> Result<(), IndexerError> {
        while !self.pending.is_empty() {
            if !self.tick().await? {
                break;
            }
        }
        Ok(())
    }

    /// Discard all buffered and in-flight work and move the cursor back to `height`.
    pub fn flush_and_reset_to_height(&mut self, height: u64) {
        let dropped = self.pending.len();
        self.pending.clear();
        self.to_fetch.clear();
        self.fetched.clear();
        // Dropping the set aborts its tasks.
        self.in_flight = JoinSet::new();
        self.resets += 1;
        self.cursor.rewind_to(height);
        tracing::info!(height, dropped, "Reset dispatch queue");
    }

    /// Let in-flight fetches finish, process what is ready and persist the cursor.
    pub async fn shutdown(&mut self) -> Result<(), IndexerError> {
        self.to_fetch.clear();
        while let Some(joined) = self.in_flight.join_next().await {
            match joined {
                Ok((_, Ok(blocks))) => {
                    for block in blocks {
                        self.fetched.insert(block.height(), block);
                    }
                }
                Ok((heights, Err(e))) => {
                    tracing::warn!(count = heights.len(), error = %e, "Fetch failed during shutdown");
                }
                Err(e) => tracing::warn!(error = %e, "Fetch task failed during shutdown"),
            }
        }
        self.process_ready().await?;
        self.pending.clear();
        self.fetched.clear();
        if let Some(pool) = self.pool.take() {
            pool.shutdown().await;
        }
        self.checkpoints.force_save(self.checkpoint_state()).await?;
        tracing::info!(
            height = ?self.cursor.latest_processed_height,
            "Dispatcher stopped"
        );
        Ok(())
    }

    // ─── Internals ──────────────────────────────────────────────────────────

    fn spawn_fetches(&mut self) {
        if self.config.workers > 0 {
            return;
        }
        let batch_size = self.config.batch_size.max(1);
        let parallel = self.config.parallel_batches.max(1);
        while self.in_flight.len() < parallel && !self.to_fetch.is_empty() {
            let take = batch_size.min(self.to_fetch.len());
            let heights: Vec<u64> = self.to_fetch.drain(..take).collect();
            let api = self.api.clone();
            self.in_flight.spawn(async move {
                let result = match api.fetch_blocks(&heights).await {
                    Ok(blocks) => ensure_complete(&heights, blocks),
                    Err(e) => Err(e),
                };
                (heights, result)
            });
        }
    }

    /// Process buffered blocks in order. Returns whether any block was processed.
    async fn process_ready(&mut self) -> Result<bool, IndexerError> {
        let mut progressed = false;
        while let Some(&height) = self.pending.front() {
            let Some(block) = self.fetched.remove(&height) else {
                break;
            };
            self.pending.pop_front();
            self.process_block(block).await?;
            progressed = true;
        }
        Ok(progressed)
    }

    /// Index the next `batch_size` heights per worker and commit the result.
    async fn index_round(&mut self) -> Result<bool, IndexerError> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        if self.pool.is_none() {
            self.pool = Some(WorkerPool::spawn(
                self.config.workers,
                self.config.batch_size,
                self.api.clone(),
                self.manager.clone(),
                self.registry.clone(),
            ));
        }
        let Some(pool) = self.pool.as_ref() else {
            return Ok(false);
        };

        let take = (self.config.batch_size.max(1) * pool.len()).min(self.pending.len());
        let heights: Vec<u64> = self.pending.iter().take(take).copied().collect();
        let round = pool
            .index_heights(heights.clone(), self.registry.dynamic().params())
            .await?;
        self.observer.on_blocks_fetched(&heights);

        if let Some(height) = round.discarded_above {
            tracing::debug!(height, "Dropping worker results above new datasource");
            self.store.rewind(height).await?;
        }

        let progressed = !round.blocks.is_empty();
        let resets = self.resets;
        for indexed in round.blocks {
            if self.resets != resets {
                return Ok(true);
            }
            self.pending.pop_front();
            for params in &indexed.response.dynamic_ds_created {
                self.registry.dynamic_mut().create(params.clone())?;
            }
            self.commit(indexed.header, indexed.response).await?;
        }
        if let Some((height, e)) = round.error {
            if self.resets == resets {
                tracing::error!(height, error = %e, "Failed to index block");
                return Err(e);
            }
        }
        Ok(progressed)
    }

    async fn process_block(&mut self, block: Block) -> Result<(), IndexerError> {
        let height = block.height();
        let data_sources = self.registry.active_at(height);
        let response = self
            .manager
            .index_block(&block, data_sources, self.registry.dynamic_mut())
            .await
            .map_err(|e| {
                tracing::error!(height, error = %e, "Failed to index block");
                e
            })?;
        self.commit(block.header(), response).await
    }

    /// Flush, advance and check for forks once `header`'s handlers are done.
    async fn commit(
        &mut self,
        header: Header,
        response: ProcessBlockResponse,
    ) -> Result<(), IndexerError> {
        let height = header.height;
        if !response.dynamic_ds_created.is_empty() {
            self.observer.on_dynamic_ds_created(height);
            if let Some(callback) = self.on_dynamic_ds.as_mut() {
                callback(height);
            }
            self.flush_and_reset_to_height(height);
        }

        self.store.flush(height).await?;
        self.cursor.advance_processed(height)?;
        self.last_hash = header.hash.clone();
        self.observer
            .on_block_indexed(height, response.matched_handlers, response.duration);

        if self.config.unfinalized_blocks {
            let source = ApiHeaders(self.api.as_ref());
            let rewind_to = match self.unfinalized.process_block(header, &source).await {
                Ok(rewind_to) => rewind_to,
                Err(e) if !e.is_fatal() => {
                    let to = self
                        .unfinalized
                        .headers()
                        .first()
                        .map_or(height, |h| h.height)
                        .saturating_sub(1);
                    tracing::warn!(error = %e, rewind_to = to, "No processed block matches the finalized chain");
                    Some(to)
                }
                Err(e) => return Err(e),
            };
            if let Some(to) = rewind_to {
                return self.rewind(to).await;
            }
        }

        self.checkpoints.maybe_save(self.checkpoint_state()).await
    }

    async fn rewind(&mut self, to: u64) -> Result<(), IndexerError> {
        let from = self.cursor.latest_processed_height.unwrap_or_default();
        tracing::warn!(from, to, "Rewinding after fork");
        self.store.rewind(to).await?;
        self.registry.dynamic_mut().reset_after(to);
        self.unfinalized.rewind_to(to);
        self.flush_and_reset_to_height(to);
        self.last_hash.clear();
        self.observer.on_rewind(from, to);
        self.checkpoints.force_save(self.checkpoint_state()).await
    }

    fn checkpoint_state(&self) -> CheckpointState {
        CheckpointState {
            block_height: self.cursor.latest_processed_height.unwrap_or_default(),
            block_hash: self.last_hash.clone(),
            unfinalized: self.unfinalized.headers().to_vec(),
            dynamic_datasources: self
                .registry
                .dynamic()
                .params()
                .iter()
                .filter_map(|p| serde_json::to_value(p).ok())
                .collect(),
        }
    }
}

impl std::fmt::Debug for BlockDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDispatcher")
            .field("cursor", &self.cursor)
            .field("pending", &self.pending.len())
            .field("fetched", &self.fetched.len())
            .field("in_flight", &self.in_flight.len())
            .field("workers", &self.pool)
            .finish_non_exhaustive()
    }
}

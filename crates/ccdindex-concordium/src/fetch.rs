//! The fetch loop: polls chain heights and feeds the dispatcher.
//!
//! # Loop body
//! 1. Read the finalized header and best height; register the header for
//!    fork detection.
//! 2. Plan the next heights: a modulo plan when every handler is a modulo
//!    block handler, a dictionary plan when the dictionary can narrow the
//!    range, otherwise every height in the next window. Bypass blocks are
//!    removed from every plan.
//! 3. Enqueue the plan (waits while the fetch-ahead window is full).
//! 4. Once caught up, drain and sleep for the poll interval.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use ccdindex_core::error::IndexerError;
use ccdindex_core::indexer::{IndexerConfig, IndexerState};
use ccdindex_core::types::IndexPhase;

use crate::api::ChainApi;
use crate::dictionary::{build_dictionary_query_entries, DictionaryService, QueryEntry};
use crate::dispatcher::BlockDispatcher;
use crate::manifest::{Datasource, RuntimeHandler};
use crate::processor::DsProcessorRegistry;
use crate::project::ProjectDs;

/// Heights to enqueue, plus the last height the plan accounted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeightPlan {
    pub heights: Vec<u64>,
    pub scanned_to: u64,
}

/// Every height in `[next, min(next + size - 1, target)]`.
pub fn range_plan(next: u64, target: u64, size: usize) -> HeightPlan {
    let end = next
        .saturating_add(size.max(1) as u64 - 1)
        .min(target);
    HeightPlan {
        heights: (next..=end).collect(),
        scanned_to: end,
    }
}

/// Up to `limit` heights from `next` that are a multiple of any modulo.
pub fn modulo_plan(next: u64, target: u64, modulos: &[u64], limit: usize) -> HeightPlan {
    let widest = modulos.iter().copied().max().unwrap_or(1);
    let scan_end = next
        .saturating_add(widest.saturating_mul(limit.max(1) as u64))
        .min(target);
    let mut heights = Vec::new();
    for height in next..=scan_end {
        if modulos.iter().any(|m| height % m == 0) {
            heights.push(height);
            if heights.len() >= limit {
                return HeightPlan {
                    heights,
                    scanned_to: height,
                };
            }
        }
    }
    HeightPlan {
        heights,
        scanned_to: scan_end,
    }
}

/// The block modulos, if every handler of every datasource is a block
/// handler with a positive `modulo`.
pub fn modulos(data_sources: &[Arc<ProjectDs>]) -> Option<Vec<u64>> {
    let mut modulos = BTreeSet::new();
    for ds in data_sources {
        let Datasource::Runtime(runtime) = &ds.ds else {
            return None;
        };
        for handler in &runtime.mapping.handlers {
            match handler {
                RuntimeHandler::Block(h) => match h.filter.as_ref().and_then(|f| f.modulo) {
                    Some(m) if m > 0 => {
                        modulos.insert(m);
                    }
                    _ => return None,
                },
                _ => return None,
            }
        }
    }
    (!modulos.is_empty()).then(|| modulos.into_iter().collect())
}

/// Drives a [`BlockDispatcher`] from the chain's head.
pub struct FetchService {
    config: IndexerConfig,
    api: Arc<dyn ChainApi>,
    dispatcher: BlockDispatcher,
    processors: Arc<DsProcessorRegistry>,
    dictionary: Option<Arc<dyn DictionaryService>>,
    bypass: BTreeSet<u64>,
    entries: Vec<QueryEntry>,
    new_ds: mpsc::UnboundedReceiver<u64>,
    state: IndexerState,
    phase: IndexPhase,
}

impl FetchService {
    pub fn new(
        config: IndexerConfig,
        api: Arc<dyn ChainApi>,
        mut dispatcher: BlockDispatcher,
        processors: Arc<DsProcessorRegistry>,
    ) -> Self {
        let (tx, new_ds) = mpsc::unbounded_channel();
        dispatcher.init(Box::new(move |height| {
            // The receiver lives as long as the service.
            let _ = tx.send(height);
        }));
        let entries = build_dictionary_query_entries(&dispatcher.datasources(), &processors);
        Self {
            config,
            api,
            dispatcher,
            processors,
            dictionary: None,
            bypass: BTreeSet::new(),
            entries,
            new_ds,
            state: IndexerState::Idle,
            phase: IndexPhase::Backfill,
        }
    }

    pub fn with_dictionary(mut self, dictionary: Arc<dyn DictionaryService>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    pub fn with_bypass_blocks(mut self, heights: BTreeSet<u64>) -> Self {
        self.bypass = heights;
        self
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    pub fn phase(&self) -> IndexPhase {
        self.phase
    }

    pub fn dispatcher(&self) -> &BlockDispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut BlockDispatcher {
        &mut self.dispatcher
    }

    pub fn query_entries(&self) -> &[QueryEntry] {
        &self.entries
    }

    /// Connect and resume from the checkpoint, or from `start_height`.
    pub async fn start(&mut self, start_height: u64) -> Result<(), IndexerError> {
        self.api.init().await?;
        self.dispatcher.restore(start_height).await?;
        tracing::info!(
            chain_id = %self.api.chain_id(),
            next = self.dispatcher.cursor().next_process_height(),
            dictionary_entries = self.entries.len(),
            "Fetch service started"
        );
        Ok(())
    }

    /// One loop body. Returns whether there was anything to plan.
    pub async fn poll_once(&mut self) -> Result<bool, IndexerError> {
        self.state = IndexerState::Polling;
        let finalized = self.api.finalized_header().await?;
        let best = self.api.best_height().await?;
        let finalized_height = finalized.height;
        self.dispatcher.update_chain(finalized_height, best);
        self.dispatcher.register_finalized(finalized);
        self.handle_new_datasources();

        let target = self.target_height(finalized_height, best);
        let next = self.dispatcher.cursor().next_buffer_height();
        self.update_phase(next, target);
        if next > target {
            return Ok(false);
        }

        self.state = IndexerState::Fetching;
        let mut plan = self.plan(next, target).await;
        plan.heights.retain(|h| !self.bypass.contains(h));
        tracing::debug!(
            next,
            target,
            count = plan.heights.len(),
            scanned_to = plan.scanned_to,
            "Planned heights"
        );

        let resets = self.dispatcher.reset_count();
        self.dispatcher.enqueue_heights(plan.heights).await?;
        if self.dispatcher.reset_count() == resets {
            self.dispatcher.advance_buffered(plan.scanned_to);
        }
        Ok(true)
    }

    /// Run until `shutdown` turns true, then finish in-flight work and save.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), IndexerError> {
        let interval = self.config.poll_interval();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_once().await {
                Ok(true) => {
                    self.dispatcher.tick().await?;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    self.state = IndexerState::Error;
                    tracing::error!(error = %e, "Fetch loop failed");
                    return Err(e);
                }
            }

            self.state = IndexerState::Waiting;
            self.dispatcher.drain().await?;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.state = IndexerState::ShuttingDown;
        self.dispatcher.shutdown().await?;
        self.state = IndexerState::Stopped;
        Ok(())
    }

    fn target_height(&self, finalized: u64, best: u64) -> u64 {
        if self.config.unfinalized_blocks {
            best
        } else if self.config.supports_finalization {
            finalized
        } else {
            best.saturating_sub(self.config.block_confirmations)
        }
    }

    /// Live once the remaining range fits in one fetch window.
    fn update_phase(&mut self, next: u64, target: u64) {
        let window = (self.config.batch_size.max(1) * self.config.parallel_batches.max(1)) as u64;
        let phase = if target.saturating_sub(next) >= window {
            IndexPhase::Backfill
        } else {
            IndexPhase::Live
        };
        if phase != self.phase {
            tracing::info!(?phase, next, target, "Fetch phase changed");
            self.phase = phase;
        }
    }

    fn handle_new_datasources(&mut self) {
        let mut latest = None;
        while let Ok(height) = self.new_ds.try_recv() {
            latest = Some(height);
        }
        if let Some(height) = latest {
            self.entries =
                build_dictionary_query_entries(&self.dispatcher.datasources(), &self.processors);
            tracing::info!(
                height,
                dictionary_entries = self.entries.len(),
                "Re-planning after dynamic datasource"
            );
        }
    }

    async fn plan(&self, next: u64, target: u64) -> HeightPlan {
        let window = self.config.batch_size.max(1) * self.config.parallel_batches.max(1);

        if let Some(modulos) = modulos(&self.dispatcher.datasources()) {
            return modulo_plan(next, target, &modulos, window);
        }

        if let Some(dictionary) = self.dictionary.as_ref().filter(|_| !self.entries.is_empty()) {
            let end = next
                .saturating_add(self.config.dictionary_query_size)
                .min(target);
            match dictionary.query(next, end, window, &self.entries).await {
                Ok(Some(result)) if result.last_height >= next => {
                    let heights: Vec<u64> = result
                        .heights
                        .into_iter()
                        .filter(|h| (next..=target).contains(h))
                        .collect();
                    let scanned_to = match heights.last() {
                        Some(&last) if heights.len() >= window => last,
                        _ => result.last_height.min(target),
                    };
                    return HeightPlan {
                        heights,
                        scanned_to,
                    };
                }
                Ok(_) => {
                    tracing::debug!(next, "Dictionary cannot narrow range, fetching all heights");
                }
                Err(e) => {
                    tracing::warn!(next, error = %e, "Dictionary query failed, fetching all heights");
                }
            }
        }

        range_plan(next, target, window)
    }
}

impl std::fmt::Debug for FetchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchService")
            .field("state", &self.state)
            .field("phase", &self.phase)
            .field("dispatcher", &self.dispatcher)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::DictionaryResult;
    use crate::dynamic_ds::tests::pool_template;
    use crate::dynamic_ds::{DatasourceRegistry, DynamicDsService};
    use crate::indexer_manager::tests::{runtime_ds, sample_block, handler_def, RecordingRunner};
    use crate::indexer_manager::IndexerManager;
    use crate::manifest::{BlockFilter, TransactionEventFilter};
    use crate::types::Block;
    use async_trait::async_trait;
    use ccdindex_core::checkpoint::MemoryCheckpointStore;
    use ccdindex_core::store::StoreCache;
    use ccdindex_core::types::Header;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StaticChain {
        finalized: u64,
        best: u64,
    }

    #[async_trait]
    impl ChainApi for StaticChain {
        async fn init(&self) -> Result<(), IndexerError> {
            Ok(())
        }
        async fn finalized_header(&self) -> Result<Header, IndexerError> {
            Ok(sample_block(self.finalized).header())
        }
        async fn best_height(&self) -> Result<u64, IndexerError> {
            Ok(self.best)
        }
        async fn fetch_blocks(&self, heights: &[u64]) -> Result<Vec<Block>, IndexerError> {
            Ok(heights.iter().map(|h| sample_block(*h)).collect())
        }
        async fn header_by_hash(&self, hash: &str) -> Result<Header, IndexerError> {
            Err(IndexerError::chain_api(format!("unknown block {hash}")))
        }
        fn chain_id(&self) -> String {
            "test".into()
        }
        fn genesis_hash(&self) -> String {
            "h0".into()
        }
    }

    struct NoStore;

    #[async_trait]
    impl StoreCache for NoStore {
        async fn flush(&self, _up_to: u64) -> Result<(), IndexerError> {
            Ok(())
        }
        async fn rewind(&self, _to: u64) -> Result<(), IndexerError> {
            Ok(())
        }
    }

    struct FixedDictionary {
        queries: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl DictionaryService for FixedDictionary {
        async fn query(
            &self,
            start: u64,
            end: u64,
            _limit: usize,
            _entries: &[QueryEntry],
        ) -> Result<Option<DictionaryResult>, IndexerError> {
            self.queries.lock().unwrap().push((start, end));
            Ok(Some(DictionaryResult {
                heights: vec![3, 7],
                last_height: 10,
            }))
        }
    }

    fn service(
        handlers: Vec<RuntimeHandler>,
        runner: Arc<RecordingRunner>,
        chain: StaticChain,
        config: IndexerConfig,
    ) -> FetchService {
        let api: Arc<dyn ChainApi> = Arc::new(chain);
        let processors = Arc::new(DsProcessorRegistry::new());
        let registry = DatasourceRegistry::new(
            vec![Arc::new(runtime_ds(handlers))],
            DynamicDsService::new(vec![pool_template()], processors.clone()),
        );
        let dispatcher = BlockDispatcher::new(
            config.clone(),
            api.clone(),
            IndexerManager::new(runner, processors.clone()),
            registry,
            Arc::new(NoStore),
            Arc::new(MemoryCheckpointStore::new()),
        );
        FetchService::new(config, api, dispatcher, processors)
    }

    #[test]
    fn plans() {
        assert_eq!(range_plan(5, 100, 4).heights, vec![5, 6, 7, 8]);
        assert_eq!(range_plan(5, 6, 4).scanned_to, 6);

        let plan = modulo_plan(1, 100, &[10, 25], 3);
        assert_eq!(plan.heights, vec![10, 20, 25]);
        assert_eq!(plan.scanned_to, 25);

        let plan = modulo_plan(1, 15, &[10], 5);
        assert_eq!(plan.heights, vec![10]);
        assert_eq!(plan.scanned_to, 15);
    }

    #[test]
    fn modulos_require_only_modulo_block_handlers() {
        let modulo = |m| {
            RuntimeHandler::Block(handler_def(
                "handleBlock",
                Some(BlockFilter {
                    modulo: Some(m),
                    timestamp: None,
                }),
            ))
        };
        let all = vec![Arc::new(runtime_ds(vec![modulo(5), modulo(3)]))];
        assert_eq!(modulos(&all), Some(vec![3, 5]));

        let mixed = vec![Arc::new(runtime_ds(vec![
            modulo(5),
            RuntimeHandler::Transaction(handler_def("handleTx", None)),
        ]))];
        assert_eq!(modulos(&mixed), None);
        assert_eq!(modulos(&[]), None);
    }

    #[tokio::test]
    async fn indexes_up_to_finalized() {
        let runner = Arc::new(RecordingRunner::default());
        let mut fetch = service(
            vec![RuntimeHandler::Block(handler_def("handleBlock", None))],
            runner.clone(),
            StaticChain { finalized: 5, best: 9 },
            IndexerConfig::default(),
        );
        fetch.start(1).await.unwrap();
        assert!(fetch.poll_once().await.unwrap());
        fetch.dispatcher_mut().drain().await.unwrap();
        assert!(!fetch.poll_once().await.unwrap());

        let heights: Vec<u64> = runner.calls().into_iter().map(|(_, h, _)| h).collect();
        assert_eq!(heights, vec![1, 2, 3, 4, 5]);
        assert_eq!(fetch.dispatcher().cursor().finalized_height, 5);
        assert_eq!(fetch.phase(), IndexPhase::Live);
    }

    #[tokio::test]
    async fn confirmations_without_finalization() {
        let runner = Arc::new(RecordingRunner::default());
        let config = IndexerConfig {
            supports_finalization: false,
            block_confirmations: 3,
            ..Default::default()
        };
        let mut fetch = service(
            vec![RuntimeHandler::Block(handler_def("handleBlock", None))],
            runner.clone(),
            StaticChain { finalized: 0, best: 7 },
            config,
        );
        fetch.start(1).await.unwrap();
        fetch.poll_once().await.unwrap();
        fetch.dispatcher_mut().drain().await.unwrap();
        assert_eq!(fetch.dispatcher().cursor().latest_processed_height, Some(4));
    }

    #[tokio::test]
    async fn dictionary_narrows_and_bypass_skips() {
        let runner = Arc::new(RecordingRunner::default());
        let dictionary = Arc::new(FixedDictionary {
            queries: Mutex::new(Vec::new()),
        });
        let mut fetch = service(
            vec![RuntimeHandler::TransactionEvent(handler_def(
                "handleEvent",
                Some(TransactionEventFilter {
                    tag: Some("Updated".into()),
                    values: None,
                }),
            ))],
            runner.clone(),
            StaticChain { finalized: 50, best: 50 },
            IndexerConfig::default(),
        )
        .with_dictionary(dictionary.clone())
        .with_bypass_blocks(BTreeSet::from([7]));
        assert_eq!(fetch.query_entries().len(), 1);

        fetch.start(1).await.unwrap();
        fetch.poll_once().await.unwrap();
        fetch.dispatcher_mut().drain().await.unwrap();

        assert_eq!(dictionary.queries.lock().unwrap()[0], (1, 50));
        let heights: Vec<u64> = runner.calls().into_iter().map(|(_, h, _)| h).collect();
        // Two matching events at height 3; 7 is bypassed.
        assert_eq!(heights, vec![3, 3]);
        assert_eq!(fetch.dispatcher().cursor().latest_buffered_height, Some(10));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let runner = Arc::new(RecordingRunner::default());
        let mut fetch = service(
            vec![RuntimeHandler::Block(handler_def("handleBlock", None))],
            runner.clone(),
            StaticChain { finalized: 3, best: 3 },
            IndexerConfig::default(),
        );
        fetch.start(1).await.unwrap();

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });
        fetch.run(rx).await.unwrap();

        assert_eq!(fetch.state(), IndexerState::Stopped);
        assert_eq!(runner.calls().len(), 3);
        assert_eq!(fetch.dispatcher().cursor().latest_processed_height, Some(3));
    }
}

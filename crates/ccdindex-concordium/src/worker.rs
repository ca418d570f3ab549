//! Worker pool: independent pipelines over disjoint height ranges.
//!
//! Each worker owns its own [`IndexerManager`] and datasource registry and
//! indexes the heights it is sent strictly in order. A round splits heights
//! into contiguous, non-overlapping ranges, one per worker. Every request
//! carries the dispatcher's dynamic datasource set, so workers start each
//! round from the same view.
//!
//! Creating a datasource at height `H` ends the round at `H`: workers skip
//! what they have not started above `H` and anything already indexed above
//! it is dropped from the merged result. Committing stays with the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use ccdindex_core::error::IndexerError;
use ccdindex_core::types::Header;

use crate::api::{ensure_complete, ChainApi};
use crate::dynamic_ds::{DatasourceParams, DatasourceRegistry};
use crate::indexer_manager::{IndexerManager, ProcessBlockResponse};

/// A block indexed by a worker, waiting to be committed.
#[derive(Debug, Clone)]
pub struct IndexedBlock {
    pub header: Header,
    pub response: ProcessBlockResponse,
}

/// Merged outcome of one round across the pool.
#[derive(Debug, Default)]
pub struct Round {
    /// Contiguous from the first requested height, ascending.
    pub blocks: Vec<IndexedBlock>,
    /// Set when indexed work above this height was dropped.
    pub discarded_above: Option<u64>,
    /// The lowest failure not covered by a datasource creation below it.
    pub error: Option<(u64, IndexerError)>,
}

#[derive(Default)]
struct WorkerOutcome {
    blocks: Vec<IndexedBlock>,
    error: Option<(u64, IndexerError)>,
}

struct WorkerRequest {
    heights: Vec<u64>,
    dynamic: Vec<DatasourceParams>,
    stop_above: Arc<AtomicU64>,
    reply: oneshot::Sender<WorkerOutcome>,
}

/// A fixed set of dispatch workers.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<WorkerRequest>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers (at least one).
    pub fn spawn(
        count: usize,
        batch_size: usize,
        api: Arc<dyn ChainApi>,
        manager: IndexerManager,
        registry: DatasourceRegistry,
    ) -> Self {
        let count = count.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let (tx, rx) = mpsc::channel(4);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                id,
                rx,
                api.clone(),
                manager.clone(),
                registry.clone(),
                batch_size.max(1),
            )));
        }
        tracing::info!(workers = count, "Worker pool started");
        Self { senders, handles }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Index `heights` across the workers with `dynamic` as the dynamic
    /// datasource set.
    pub async fn index_heights(
        &self,
        mut heights: Vec<u64>,
        dynamic: &[DatasourceParams],
    ) -> Result<Round, IndexerError> {
        heights.sort_unstable();
        heights.dedup();

        let stop_above = Arc::new(AtomicU64::new(u64::MAX));
        let mut replies = Vec::new();
        for (id, (sender, range)) in self
            .senders
            .iter()
            .zip(partition(&heights, self.len()))
            .enumerate()
        {
            if range.is_empty() {
                continue;
            }
            let (reply, rx) = oneshot::channel();
            sender
                .send(WorkerRequest {
                    heights: range,
                    dynamic: dynamic.to_vec(),
                    stop_above: stop_above.clone(),
                    reply,
                })
                .await
                .map_err(|_| IndexerError::Aborted {
                    reason: format!("worker {id} stopped"),
                })?;
            replies.push(rx);
        }

        let outcomes = futures::future::try_join_all(replies)
            .await
            .map_err(|_| IndexerError::Aborted {
                reason: "worker dropped its reply".into(),
            })?;
        Ok(merge(outcomes))
    }

    /// Close the request channels and wait for every worker to exit.
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker exited abnormally");
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.senders.len())
            .finish_non_exhaustive()
    }
}

/// Split sorted `heights` into at most `parts` contiguous, non-overlapping ranges.
pub fn partition(heights: &[u64], parts: usize) -> Vec<Vec<u64>> {
    let parts = parts.max(1);
    let size = heights.len().div_ceil(parts).max(1);
    let mut ranges: Vec<Vec<u64>> = heights.chunks(size).map(<[u64]>::to_vec).collect();
    ranges.resize(parts, Vec::new());
    ranges
}

/// Cut the merged worker results at the first datasource creation or failure.
fn merge(outcomes: Vec<WorkerOutcome>) -> Round {
    let mut blocks = Vec::new();
    let mut error: Option<(u64, IndexerError)> = None;
    for outcome in outcomes {
        blocks.extend(outcome.blocks);
        if let Some((height, e)) = outcome.error {
            if error.as_ref().map_or(true, |(h, _)| height < *h) {
                error = Some((height, e));
            }
        }
    }
    blocks.sort_by_key(|b| b.header.height);

    let created_at = blocks
        .iter()
        .find(|b| !b.response.dynamic_ds_created.is_empty())
        .map(|b| b.header.height);
    if let (Some(created), Some((failed, _))) = (created_at, &error) {
        if *failed > created {
            error = None;
        }
    }
    let limit = match &error {
        Some((failed, _)) => failed.saturating_sub(1),
        None => created_at.unwrap_or(u64::MAX),
    };

    let indexed = blocks.len();
    blocks.retain(|b| b.header.height <= limit);
    let discarded_above = match created_at {
        Some(created) if blocks.len() < indexed && error.is_none() => Some(created),
        _ => None,
    };
    Round {
        blocks,
        discarded_above,
        error,
    }
}

async fn run_worker(
    id: usize,
    mut rx: mpsc::Receiver<WorkerRequest>,
    api: Arc<dyn ChainApi>,
    manager: IndexerManager,
    mut registry: DatasourceRegistry,
    batch_size: usize,
) {
    while let Some(request) = rx.recv().await {
        let first = request.heights.first().copied().unwrap_or_default();
        tracing::debug!(
            worker = id,
            from = first,
            to = request.heights.last().copied().unwrap_or_default(),
            "Worker received range"
        );
        let mut outcome = WorkerOutcome::default();
        if registry.dynamic().params() != request.dynamic.as_slice() {
            if let Err(e) = registry.dynamic_mut().restore(request.dynamic) {
                outcome.error = Some((first, e));
            }
        }
        if outcome.error.is_none() {
            index_range(
                &request.heights,
                &*api,
                &manager,
                &mut registry,
                batch_size,
                &request.stop_above,
                &mut outcome,
            )
            .await;
        }
        if let Some((height, e)) = &outcome.error {
            tracing::error!(worker = id, height, error = %e, "Worker failed to index range");
        }
        // The caller may have gone away; nothing to do then.
        let _ = request.reply.send(outcome);
    }
    tracing::debug!(worker = id, "Worker stopped");
}

async fn index_range(
    heights: &[u64],
    api: &dyn ChainApi,
    manager: &IndexerManager,
    registry: &mut DatasourceRegistry,
    batch_size: usize,
    stop_above: &AtomicU64,
    outcome: &mut WorkerOutcome,
) {
    for batch in heights.chunks(batch_size) {
        if batch[0] > stop_above.load(Ordering::Acquire) {
            return;
        }
        let blocks = match api.fetch_blocks(batch).await {
            Ok(blocks) => ensure_complete(batch, blocks),
            Err(e) => Err(e),
        };
        let blocks = match blocks {
            Ok(blocks) => blocks,
            Err(e) => {
                outcome.error = Some((batch[0], e));
                return;
            }
        };
        for block in &blocks {
            let height = block.height();
            if height > stop_above.load(Ordering::Acquire) {
                return;
            }
            let data_sources = registry.active_at(height);
            match manager
                .index_block(block, data_sources, registry.dynamic_mut())
                .await
            {
                Ok(response) => {
                    let created = !response.dynamic_ds_created.is_empty();
                    outcome.blocks.push(IndexedBlock {
                        header: block.header(),
                        response,
                    });
                    if created {
                        stop_above.fetch_min(height, Ordering::AcqRel);
                        return;
                    }
                }
                Err(e) => {
                    outcome.error = Some((height, e));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::ReversedApi;
    use crate::dynamic_ds::tests::pool_template;
    use crate::dynamic_ds::DynamicDsService;
    use crate::indexer_manager::tests::{handler_def, runtime_ds, RecordingRunner};
    use crate::manifest::RuntimeHandler;
    use crate::processor::DsProcessorRegistry;
    use std::sync::Mutex;

    fn pool(count: usize, batch_size: usize, handler: &str, runner: Arc<RecordingRunner>) -> WorkerPool {
        let processors = Arc::new(DsProcessorRegistry::new());
        let registry = DatasourceRegistry::new(
            vec![Arc::new(runtime_ds(vec![RuntimeHandler::Block(handler_def(handler, None))]))],
            DynamicDsService::new(vec![pool_template()], processors.clone()),
        );
        WorkerPool::spawn(
            count,
            batch_size,
            Arc::new(ReversedApi {
                fetches: Mutex::new(Vec::new()),
            }),
            IndexerManager::new(runner, processors),
            registry,
        )
    }

    fn heights(round: &Round) -> Vec<u64> {
        round.blocks.iter().map(|b| b.header.height).collect()
    }

    #[test]
    fn partitions_without_overlap() {
        let heights: Vec<u64> = (1..=7).collect();
        let ranges = partition(&heights, 3);
        assert_eq!(ranges, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
        assert_eq!(partition(&[1], 3), vec![vec![1], vec![], vec![]]);
        assert_eq!(partition(&[], 2), vec![Vec::<u64>::new(), vec![]]);
    }

    #[tokio::test]
    async fn pool_indexes_every_height_once() {
        let runner = Arc::new(RecordingRunner::default());
        let pool = pool(2, 2, "handleBlock", runner.clone());
        assert_eq!(pool.len(), 2);

        let round = pool.index_heights(vec![6, 1, 2, 3, 4, 5], &[]).await.unwrap();
        assert_eq!(heights(&round), vec![1, 2, 3, 4, 5, 6]);
        assert!(round.blocks.iter().all(|b| b.response.matched_handlers == 1));
        assert_eq!(round.blocks[2].header.hash, "h3");
        assert!(round.discarded_above.is_none());
        assert!(round.error.is_none());

        let mut seen: Vec<u64> = runner.calls().into_iter().map(|(_, h, _)| h).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn created_datasource_ends_the_round_and_applies_to_later_heights() {
        let runner = Arc::new(RecordingRunner::default());
        let pool = pool(2, 1, "handleSpawnAt2", runner.clone());

        let round = pool.index_heights(vec![1, 2, 3, 4], &[]).await.unwrap();
        assert_eq!(heights(&round), vec![1, 2]);
        let created = round.blocks[1].response.dynamic_ds_created.clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].start_block, 2);
        assert!(round.error.is_none());

        // Every worker receives the new set with the next round.
        let round = pool.index_heights(vec![3, 4], &created).await.unwrap();
        assert_eq!(heights(&round), vec![3, 4]);

        let pool_heights: Vec<u64> = runner
            .calls()
            .into_iter()
            .filter(|(h, _, _)| h == "handlePoolEvent")
            .map(|(_, h, _)| h)
            .collect();
        assert_eq!(pool_heights, vec![2, 2, 3, 3, 4, 4]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn failure_keeps_blocks_below_it() {
        let runner = Arc::new(RecordingRunner::default());
        let pool = pool(1, 2, "handleBlock", runner);
        let round = pool.index_heights(vec![1, 2], &[]).await.unwrap();
        assert_eq!(heights(&round), vec![1, 2]);

        let merged = merge(vec![
            WorkerOutcome {
                blocks: round.blocks.clone(),
                error: None,
            },
            WorkerOutcome {
                blocks: Vec::new(),
                error: Some((3, IndexerError::Other("boom".into()))),
            },
        ]);
        assert_eq!(heights(&merged), vec![1, 2]);
        assert_eq!(merged.error.map(|(h, _)| h), Some(3));

        pool.shutdown().await;
    }
}

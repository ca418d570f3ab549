//! Per-block matching and handler dispatch.
//!
//! For one block the manager walks, in chain order:
//!
//! 1. the block itself, against every datasource
//! 2. each transaction, followed by that transaction's events
//! 3. each special event
//!
//! and invokes every matching handler through the [`HandlerRunner`]. A
//! handler failure aborts the block. Datasources created by a handler join
//! the working set immediately, so later inputs of the same block see them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};

use ccdindex_core::error::IndexerError;

use crate::dynamic_ds::{DatasourceParams, DynamicDsService};
use crate::filter::{matches_any, matches_handler, HandlerInput};
use crate::manifest::{AnyFilter, CustomDatasource, CustomHandler, Datasource};
use crate::processor::DsProcessorRegistry;
use crate::project::ProjectDs;
use crate::types::Block;

// ─── Handler seam ─────────────────────────────────────────────────────────────

/// What a handler is invoked with.
#[derive(Debug, Clone)]
pub enum HandlerArg<'a> {
    /// A runtime datum, passed as-is.
    Input(HandlerInput<'a>),
    /// One output of a custom handler processor's transform.
    Transformed(Value),
}

/// Per-invocation context handed to handler code.
#[derive(Debug)]
pub struct HandlerContext<'a> {
    pub block: &'a Block,
    created: Vec<DatasourceParams>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(block: &'a Block) -> Self {
        Self {
            block,
            created: Vec::new(),
        }
    }

    /// Request a datasource from `template_name`, effective at the current block.
    pub fn create_dynamic_datasource(
        &mut self,
        template_name: impl Into<String>,
        args: Option<Map<String, Value>>,
    ) {
        self.created.push(DatasourceParams {
            template_name: template_name.into(),
            start_block: self.block.height(),
            args,
        });
    }
}

/// Executes user handler code.
#[async_trait]
pub trait HandlerRunner: Send + Sync {
    async fn invoke(
        &self,
        ds: &ProjectDs,
        handler: &str,
        arg: HandlerArg<'_>,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), IndexerError>;
}

// ─── Response ─────────────────────────────────────────────────────────────────

/// Summary of one indexed block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessBlockResponse {
    pub height: u64,
    pub matched_handlers: usize,
    pub dynamic_ds_created: Vec<DatasourceParams>,
    pub duration: Duration,
}

// ─── Manager ──────────────────────────────────────────────────────────────────

/// Runs the matching pipeline for one block at a time.
#[derive(Clone)]
pub struct IndexerManager {
    runner: Arc<dyn HandlerRunner>,
    processors: Arc<DsProcessorRegistry>,
}

struct BlockRun<'b> {
    block: &'b Block,
    data_sources: Vec<Arc<ProjectDs>>,
    response: ProcessBlockResponse,
}

impl IndexerManager {
    pub fn new(runner: Arc<dyn HandlerRunner>, processors: Arc<DsProcessorRegistry>) -> Self {
        Self { runner, processors }
    }

    /// Index `block` against `data_sources`, creating dynamic datasources
    /// through `dynamic` as handlers request them.
    pub async fn index_block(
        &self,
        block: &Block,
        data_sources: Vec<Arc<ProjectDs>>,
        dynamic: &mut DynamicDsService,
    ) -> Result<ProcessBlockResponse, IndexerError> {
        let started = Instant::now();
        let mut run = BlockRun {
            block,
            data_sources,
            response: ProcessBlockResponse {
                height: block.height(),
                ..Default::default()
            },
        };

        self.index_input(&mut run, HandlerInput::Block(block), dynamic)
            .await?;

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            self.index_input(&mut run, HandlerInput::Transaction(tx), dynamic)
                .await?;
            for event in block.events_of(tx_index) {
                self.index_input(&mut run, HandlerInput::TransactionEvent(event), dynamic)
                    .await?;
            }
        }

        for event in &block.special_events {
            self.index_input(&mut run, HandlerInput::SpecialEvent(event), dynamic)
                .await?;
        }

        let mut response = run.response;
        response.duration = started.elapsed();
        tracing::debug!(
            height = response.height,
            matched = response.matched_handlers,
            dynamic_ds = response.dynamic_ds_created.len(),
            elapsed_ms = response.duration.as_millis() as u64,
            "Indexed block"
        );
        Ok(response)
    }

    async fn index_input(
        &self,
        run: &mut BlockRun<'_>,
        input: HandlerInput<'_>,
        dynamic: &mut DynamicDsService,
    ) -> Result<(), IndexerError> {
        // The working set may grow while iterating.
        let mut i = 0;
        while i < run.data_sources.len() {
            let ds = run.data_sources[i].clone();
            match &ds.ds {
                Datasource::Runtime(runtime) => {
                    for handler in &runtime.mapping.handlers {
                        if matches_handler(handler, input) {
                            self.invoke(run, &ds, handler.handler(), HandlerArg::Input(input), dynamic)
                                .await?;
                            run.response.matched_handlers += 1;
                        }
                    }
                }
                Datasource::Custom(custom) => {
                    self.index_custom(run, &ds, custom, input, dynamic).await?;
                }
            }
            i += 1;
        }
        Ok(())
    }

    async fn index_custom(
        &self,
        run: &mut BlockRun<'_>,
        ds: &ProjectDs,
        custom: &CustomDatasource,
        input: HandlerInput<'_>,
        dynamic: &mut DynamicDsService,
    ) -> Result<(), IndexerError> {
        let processor = self.processors.for_ds(custom)?;
        if !processor.ds_filter(custom) {
            return Ok(());
        }
        for handler in &custom.mapping.handlers {
            let hp = self.processors.handler_processor(custom, &handler.kind)?;
            if hp.base_handler_kind() != input.kind() {
                continue;
            }
            if !base_filters_match(&hp.base_filter(), input, handler)? {
                continue;
            }
            if !hp.filter_processor(handler.filter.as_ref(), input, custom) {
                continue;
            }
            let outputs = hp.transform(input, custom, &ds.assets).await.map_err(|e| {
                IndexerError::Handler {
                    handler: handler.handler.clone(),
                    reason: format!("transform failed: {e}"),
                }
            })?;
            for output in outputs {
                self.invoke(run, ds, &handler.handler, HandlerArg::Transformed(output), dynamic)
                    .await?;
            }
            run.response.matched_handlers += 1;
        }
        Ok(())
    }

    async fn invoke(
        &self,
        run: &mut BlockRun<'_>,
        ds: &ProjectDs,
        handler: &str,
        arg: HandlerArg<'_>,
        dynamic: &mut DynamicDsService,
    ) -> Result<(), IndexerError> {
        let mut ctx = HandlerContext::new(run.block);
        self.runner
            .invoke(ds, handler, arg, &mut ctx)
            .await
            .map_err(|e| match e {
                e @ IndexerError::Handler { .. } => e,
                other => IndexerError::Handler {
                    handler: handler.to_string(),
                    reason: other.to_string(),
                },
            })?;

        for params in ctx.created {
            let created = dynamic.create(params.clone())?;
            run.data_sources.push(created);
            run.response.dynamic_ds_created.push(params);
        }
        Ok(())
    }
}

fn base_filters_match(
    filters: &[Value],
    input: HandlerInput<'_>,
    handler: &CustomHandler,
) -> Result<bool, IndexerError> {
    if filters.is_empty() {
        return Ok(true);
    }
    for raw in filters {
        let filter = AnyFilter::decode(input.kind(), raw.clone())
            .map_err(|e| IndexerError::validation(format!("{}: {e}", handler.kind)))?;
        if matches_any(input, &filter) {
            return Ok(true);
        }
    }
    Ok(false)
}

impl std::fmt::Debug for IndexerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexerManager")
            .field("processors", &self.processors)
            .finish_non_exhaustive()
    }
}

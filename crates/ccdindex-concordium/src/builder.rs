//! Fluent builder API for creating Concordium indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use ccdindex_concordium::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .id("pools")
//!     .chain("concordium-testnet")
//!     .batch_size(20)
//!     .parallel_batches(4)
//!     .unfinalized_blocks(true)
//!     .build_config();
//! ```

use std::sync::Arc;

use ccdindex_core::checkpoint::CheckpointStore;
use ccdindex_core::error::IndexerError;
use ccdindex_core::indexer::IndexerConfig;
use ccdindex_core::observer::IndexerObserver;
use ccdindex_core::store::StoreCache;

use crate::api::ChainApi;
use crate::dictionary::DictionaryService;
use crate::dispatcher::BlockDispatcher;
use crate::dynamic_ds::{DatasourceRegistry, DynamicDsService};
use crate::fetch::FetchService;
use crate::indexer_manager::{HandlerRunner, IndexerManager};
use crate::processor::DsProcessorRegistry;
use crate::project::Project;

/// Fluent builder for `IndexerConfig` and the fetch pipeline around it.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    dictionary: Option<Arc<dyn DictionaryService>>,
    observer: Option<Arc<dyn IndexerObserver>>,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing config (e.g. loaded from YAML).
    pub fn from_config(config: IndexerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Set the indexer ID (used for checkpoint keys).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Blocks per fetch batch.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Fetch batches allowed in flight at once.
    pub fn parallel_batches(mut self, n: usize) -> Self {
        self.config.parallel_batches = n;
        self
    }

    /// Fetched-but-unprocessed blocks allowed before enqueueing waits.
    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.config.max_queue_size = n;
        self
    }

    pub fn block_confirmations(mut self, n: u64) -> Self {
        self.config.block_confirmations = n;
        self
    }

    /// Index past the finalized height, rewinding on forks.
    pub fn unfinalized_blocks(mut self, enabled: bool) -> Self {
        self.config.unfinalized_blocks = enabled;
        self
    }

    pub fn supports_finalization(mut self, supported: bool) -> Self {
        self.config.supports_finalization = supported;
        self
    }

    /// Set checkpoint save interval (every N blocks).
    pub fn checkpoint_interval(mut self, n: u64) -> Self {
        self.config.checkpoint_interval = n;
        self
    }

    pub fn chain_interval_ms(mut self, ms: u64) -> Self {
        self.config.chain_interval_ms = ms;
        self
    }

    pub fn dictionary_query_size(mut self, n: u64) -> Self {
        self.config.dictionary_query_size = n;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n;
        self
    }

    pub fn dictionary(mut self, dictionary: Arc<dyn DictionaryService>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn IndexerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Validate `project` against `processors` and assemble a fetch service
    /// over its datasources.
    pub fn build(
        self,
        project: &Project,
        api: Arc<dyn ChainApi>,
        runner: Arc<dyn HandlerRunner>,
        processors: Arc<DsProcessorRegistry>,
        store: Arc<dyn StoreCache>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<FetchService, IndexerError> {
        let mut config = self.config;
        if config.chain.is_empty() {
            config.chain = project.network.chain_id.clone();
        }
        config.validate()?;
        processors.validate_custom_ds(
            project
                .data_sources
                .iter()
                .map(|ds| &**ds)
                .chain(project.templates.iter().map(|t| &t.ds)),
        )?;

        let registry = DatasourceRegistry::new(
            project.data_sources.clone(),
            DynamicDsService::new(project.templates.clone(), processors.clone()),
        );
        let mut dispatcher = BlockDispatcher::new(
            config.clone(),
            api.clone(),
            IndexerManager::new(runner, processors.clone()),
            registry,
            store,
            checkpoints,
        );
        if let Some(observer) = self.observer {
            dispatcher = dispatcher.with_observer(observer);
        }

        let mut fetch = FetchService::new(config, api, dispatcher, processors)
            .with_bypass_blocks(project.network.bypass_heights());
        if let Some(dictionary) = self.dictionary {
            fetch = fetch.with_dictionary(dictionary);
        }
        Ok(fetch)
    }
}

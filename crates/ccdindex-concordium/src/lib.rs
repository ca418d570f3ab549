//! ccdindex-concordium: manifest resolution, filter matching, block dispatch
//! and the fetch loop for Concordium projects.

pub mod api;
pub mod builder;
pub mod dictionary;
pub mod dispatcher;
pub mod dynamic_ds;
pub mod fetch;
pub mod filter;
pub mod indexer_manager;
pub mod manifest;
pub mod processor;
pub mod project;
pub mod retry;
pub mod types;
pub mod worker;

pub use api::{ApiHeaders, ChainApi};
pub use builder::IndexerBuilder;
pub use dictionary::{
    build_dictionary_query_entries, DictionaryResult, DictionaryService, QueryEntry,
};
pub use dispatcher::BlockDispatcher;
pub use dynamic_ds::{DatasourceParams, DatasourceRegistry, DynamicDsService};
pub use fetch::FetchService;
pub use filter::HandlerInput;
pub use indexer_manager::{
    HandlerArg, HandlerContext, HandlerRunner, IndexerManager, ProcessBlockResponse,
};
pub use manifest::ProjectManifest;
pub use processor::{DsProcessor, DsProcessorRegistry, HandlerProcessor};
pub use project::{LocalReader, NetworkOverrides, Project, ProjectDs, Reader};
pub use retry::{RetryConfig, RetryPolicy, RetryingChainApi};
pub use types::{Block, SpecialEvent, Transaction, TransactionEvent};
pub use worker::{IndexedBlock, Round, WorkerPool};

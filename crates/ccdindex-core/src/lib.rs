//! ccdindex-core: chain-agnostic pieces of the ccdindex pipeline.
//!
//! # Architecture
//!
//! ```text
//! FetchService → BlockDispatcher → IndexerManager → HandlerRunner
//!                     ├── DispatchCursor     (processed / buffered heights)
//!                     ├── UnfinalizedBlocks  (fork detection past finality)
//!                     ├── CheckpointManager  (crash recovery)
//!                     ├── StoreCache         (commit boundary)
//!                     └── IndexerObserver    (diagnostic hooks)
//! ```

pub mod checkpoint;
pub mod cursor;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod observer;
pub mod store;
pub mod types;
pub mod unfinalized;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointState, CheckpointStore};
pub use cursor::DispatchCursor;
pub use error::{ChainApiErrorKind, IndexerError};
pub use indexer::{IndexerConfig, IndexerState};
pub use logging::{init_tracing, LogConfig};
pub use observer::{IndexerObserver, NoopObserver};
pub use store::StoreCache;
pub use types::{Header, IndexPhase};
pub use unfinalized::{HeaderSource, UnfinalizedBlocks};

//! Indexer configuration and state types.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::logging::LogConfig;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this indexer (used for checkpoint keys).
    pub id: String,
    /// Chain id (genesis hash) being indexed.
    pub chain: String,
    /// Blocks per fetch batch.
    pub batch_size: usize,
    /// Fetch batches allowed in flight at once.
    pub parallel_batches: usize,
    /// Maximum fetched-but-unprocessed heights held by the dispatcher.
    pub max_queue_size: usize,
    /// Blocks to lag behind the best height on chains without fast finality.
    pub block_confirmations: u64,
    /// Index blocks above the finalized height and track them for forks.
    pub unfinalized_blocks: bool,
    /// Whether the chain reports a finalized head at all.
    pub supports_finalization: bool,
    /// How often to save a checkpoint (every N blocks).
    pub checkpoint_interval: u64,
    /// Upper bound on the fetch loop's sleep (milliseconds).
    pub block_time_variance_ms: u64,
    /// Expected chain block interval (milliseconds).
    pub chain_interval_ms: u64,
    /// Height span covered by one dictionary query.
    pub dictionary_query_size: u64,
    /// Worker tasks indexing each round of pending heights; 0 indexes in the dispatcher.
    pub workers: usize,
    pub log: LogConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            chain: String::new(),
            batch_size: 10,
            parallel_batches: 2,
            max_queue_size: 100,
            block_confirmations: 0,
            unfinalized_blocks: false,
            supports_finalization: true,
            checkpoint_interval: 1,
            block_time_variance_ms: 5000,
            chain_interval_ms: 2000,
            dictionary_query_size: 10_000,
            workers: 0,
            log: LogConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// Parse a YAML document; missing fields take their defaults.
    pub fn from_yaml(raw: &str) -> Result<Self, IndexerError> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| IndexerError::Config(format!("invalid indexer config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        let mut errors = Vec::new();
        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if self.parallel_batches == 0 {
            errors.push("parallel_batches must be greater than 0".to_string());
        }
        if self.max_queue_size < self.batch_size {
            errors.push("max_queue_size must be at least batch_size".to_string());
        }
        if self.dictionary_query_size == 0 {
            errors.push("dictionary_query_size must be greater than 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(IndexerError::Validation(errors))
        }
    }

    /// Sleep between fetch-loop iterations.
    pub fn poll_interval(&self) -> std::time::Duration {
        let chain = (self.chain_interval_ms as f64 * 0.9) as u64;
        std::time::Duration::from_millis(self.block_time_variance_ms.min(chain))
    }
}

/// Runtime state of the fetch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Querying the chain for best / finalized heights.
    Polling,
    /// Handing heights to the dispatcher.
    Fetching,
    /// Sleeping until the next poll.
    Waiting,
    /// Shutdown requested; draining in-flight work.
    ShuttingDown,
    /// Terminated.
    Stopped,
    /// Encountered an unrecoverable error.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Polling => write!(f, "polling"),
            Self::Fetching => write!(f, "fetching"),
            Self::Waiting => write!(f, "waiting"),
            Self::ShuttingDown => write!(f, "shutting-down"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

//! Error types for the ccdindex pipeline.

use thiserror::Error;

/// Classification of a chain API failure, derived from the transport's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainApiErrorKind {
    Timeout,
    Disconnection,
    RateLimit,
    LargeResponse,
    Default,
}

impl ChainApiErrorKind {
    /// Classify a raw transport error message.
    pub fn classify(message: &str) -> Self {
        if message.starts_with("No response received from RPC endpoint in") {
            Self::Timeout
        } else if message.starts_with("disconnected from ") {
            Self::Disconnection
        } else if message.starts_with("Rate Limited at endpoint") {
            Self::RateLimit
        } else if message.contains("Exceeded max limit of") {
            Self::LargeResponse
        } else {
            Self::Default
        }
    }

    /// Transient failures the connection layer may retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Disconnection | Self::RateLimit)
    }
}

impl std::fmt::Display for ChainApiErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Disconnection => write!(f, "disconnection"),
            Self::RateLimit => write!(f, "rate limit"),
            Self::LargeResponse => write!(f, "large response"),
            Self::Default => write!(f, "api error"),
        }
    }
}

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Validation failed:\n{}", .0.join("\n"))]
    Validation(Vec<String>),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Chain API {kind}: {message}")]
    ChainApi {
        kind: ChainApiErrorKind,
        message: String,
    },

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("Reorg detected at block {height}: expected hash {expected}, got {actual}")]
    ReorgDetected {
        height: u64,
        expected: String,
        actual: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Single-message validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    /// Build a chain API error from a raw transport message.
    pub fn chain_api(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::ChainApi {
            kind: ChainApiErrorKind::classify(&message),
            message,
        }
    }

    /// Returns `true` if the error is a reorg (recoverable).
    pub fn is_reorg(&self) -> bool {
        matches!(self, Self::ReorgDetected { .. })
    }

    /// Returns `true` for transient chain API errors.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ChainApi { kind, .. } if kind.is_retryable())
    }

    /// Errors that must stop the process.
    pub fn is_fatal(&self) -> bool {
        !self.is_reorg()
    }
}

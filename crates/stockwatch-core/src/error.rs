//! Error types for StockWatch.

use thiserror::Error;

/// Crate-wide error for configuration, storage and channel plumbing.
#[derive(Debug, Error)]
pub enum StockWatchError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StockWatchError>;

/// The availability prober failed for one product.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("invalid product url: {0}")]
    InvalidUrl(String),

    #[error("page request timed out")]
    Timeout,

    #[error("page returned HTTP {0}")]
    Status(u16),

    #[error("page request failed: {0}")]
    Http(String),
}

/// Outbound message delivery failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport asked us to slow down (HTTP 429).
    #[error("throttled by transport (retry after {retry_after:?}s)")]
    Throttled { retry_after: Option<u64> },

    #[error("transport API error {code}: {description}")]
    Api { code: u16, description: String },

    #[error("transport network error: {0}")]
    Network(String),
}

impl TransportError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, TransportError::Throttled { .. })
    }
}

impl From<TransportError> for StockWatchError {
    fn from(e: TransportError) -> Self {
        StockWatchError::Channel(e.to_string())
    }
}

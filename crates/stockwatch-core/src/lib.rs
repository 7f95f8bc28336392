//! # StockWatch Core
//! Shared configuration, error taxonomy, domain types and collaborator traits.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::StockWatchConfig;
pub use error::{ProbeError, Result, StockWatchError, TransportError};
pub use types::{Availability, Fingerprint, ProductWatch, RecipientId, WatchKey};

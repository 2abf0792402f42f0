//! Error types for Strata
//!
//! Provides a unified error type for all operations.

use thiserror::Error;
use uuid::Uuid;

use crate::bstore::BlockAddr;

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

/// Unified error type for Strata operations
#[derive(Debug, Error)]
pub enum StrataError {
    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    #[error("No such stream: {0}")]
    NoSuchStream(Uuid),

    #[error("No such generation {generation} for stream {stream}")]
    NoSuchGeneration { stream: Uuid, generation: u64 },

    #[error("Block not found: address {0}")]
    BlockNotFound(BlockAddr),

    #[error("No such point")]
    NoSuchPoint,

    // -------------------------------------------------------------------------
    // Argument Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Invariant Violations
    // -------------------------------------------------------------------------
    #[error("Internal error: {0}")]
    Internal(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StrataError {
    /// True for every flavour of "does not exist" (stream, generation, block)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StrataError::NoSuchStream(_)
                | StrataError::NoSuchGeneration { .. }
                | StrataError::BlockNotFound(_)
        )
    }

    /// True for durable-storage failures (I/O, torn or corrupt data)
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            StrataError::Io(_) | StrataError::Storage(_) | StrataError::Corruption(_)
        )
    }
}

impl From<bincode::Error> for StrataError {
    fn from(e: bincode::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

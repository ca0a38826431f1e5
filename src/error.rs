//! Error types for StrataKV
//!
//! Provides a unified error type for all operations.
//!
//! Point-lookup misses are NOT errors: lookups return `Option` because a
//! missing id is a routine result. Errors here are structural: I/O failures,
//! on-disk corruption, catalog inconsistencies, and shutdown signals.

use thiserror::Error;

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

/// Unified error type for StrataKV operations
#[derive(Debug, Error)]
pub enum StrataError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // On-disk structure errors
    // -------------------------------------------------------------------------
    /// On-disk structure does not match expected tag/size invariants.
    /// Always fatal to the operation that detected it.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A Mapping references a generation the catalog no longer knows.
    #[error("generation {0} not found in catalog")]
    GenerationNotFound(u64),

    // -------------------------------------------------------------------------
    // Catalog / serialization errors
    // -------------------------------------------------------------------------
    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Resource errors
    // -------------------------------------------------------------------------
    /// Block reservation or buffer growth failed. Callers on the compaction
    /// path treat this as fatal because partially-written state cannot be
    /// rolled back mid-stream.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    // -------------------------------------------------------------------------
    // Lifecycle errors
    // -------------------------------------------------------------------------
    /// Cooperative shutdown observed during an in-flight operation.
    /// Swallowed only by the top-level shutdown path.
    #[error("service shutting down")]
    Shutdown,
}

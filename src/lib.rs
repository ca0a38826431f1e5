//! # StrataKV
//!
//! A log-structured, multi-generation key/value storage core with:
//! - In-memory absorption of high-rate writes (MemoryLayer)
//! - Durable flushes to immutable, hash-indexed sorted files (SortedFile)
//! - Size-tiered background compaction with tombstone/retention semantics
//! - Snapshot-isolated reads over reference-counted layer mappings (View)
//! - A parallel durable-object store sharing the same file mechanics
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       RepoManager                           │
//! │      (Writer / Merger / LayerCleaner background tasks)      │
//! └──────────┬─────────────────────┬────────────────────────────┘
//!            │                     │
//!            ▼                     ▼
//!     ┌─────────────┐      ┌──────────────┐
//!     │ MemoryLayer │      │   Mapping    │◄── View (snapshot)
//!     │  (pending)  │      │ (layer list) │
//!     └──────┬──────┘      └──────┬───────┘
//!            │ flush              │ merge
//!            ▼                    ▼
//!     ┌─────────────────────────────────┐
//!     │     SortedFile generations      │
//!     │  (meta | blockmap | entries |   │
//!     │        hash index)              │
//!     └──────────────┬──────────────────┘
//!                    ▼
//!     ┌─────────────────────────────────┐
//!     │   BlockStore (blocks+catalog)   │
//!     └─────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod block;
pub mod memlayer;
pub mod sorted;
pub mod mapping;
pub mod repo;
pub mod durable;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StrataError};
pub use config::Config;
pub use repo::RepoManager;
pub use durable::DurableManager;
pub use mapping::View;
pub use memlayer::{Entry, MemoryLayer, Update};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of StrataKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

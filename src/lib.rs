//! # Strata
//!
//! An embedded time-series storage engine with:
//! - Per-stream copy-on-write trees with immutable, numbered generations
//! - Precomputed statistics for fast aggregate queries at any resolution
//! - Coalesced commits that batch concurrent inserts per stream
//! - Reachability-based garbage collection of old generations
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │            (inserts, queries, delete, GC, inspect)           │
//! └───────────────┬─────────────────────────────┬───────────────┘
//!                 │ inserts / flush              │ queries
//!                 ▼                              │
//!   ┌───────────────────────────┐                │
//!   │        Coalescer          │                │
//!   │ (per-stream open buffers) │                │
//!   └─────────────┬─────────────┘                │
//!                 │ commit                       │
//!                 ▼                              ▼
//!   ┌───────────────────────────┐  ┌───────────────────────────┐
//!   │        WriteTree          │  │         ReadTree          │
//!   │     (copy-on-write)       │  │   (generation snapshot)   │
//!   └─────────────┬─────────────┘  └─────────────┬─────────────┘
//!                 └──────────────┬───────────────┘
//!                                ▼
//!                 ┌───────────────────────────────┐
//!                 │          BlockStore           │
//!                 │ blocks.dat · superblocks.log  │
//!                 │        (LRU block cache)      │
//!                 └───────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod record;

pub mod bstore;
pub mod coalesce;
pub mod engine;
pub mod qtree;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use bstore::BlockReport;
pub use config::{Config, ConfigBuilder, SyncStrategy};
pub use engine::Engine;
pub use error::{Result, StrataError};
pub use record::{ChangedRange, Record, StatRecord, MAXIMUM_TIME, MINIMUM_TIME};
pub use uuid::Uuid;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of Strata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

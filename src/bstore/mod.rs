//! Block Store Module
//!
//! Durable, cached storage for fixed-format tree blocks plus the superblock
//! registry that names each stream generation.
//!
//! ## Responsibilities
//! - Allocate block addresses stamped with a strictly increasing MIBID
//! - Persist blocks and serve them through a bounded LRU cache
//! - Publish superblocks only after their blocks are durable
//! - Reclaim blocks that no live generation can reach
//!
//! ## File Format
//! ```text
//! blocks.dat / superblocks.log
//! ┌────────────────────────────────────────┐
//! │ Header: Magic (4) | Version: u16 (2)   │
//! ├────────────────────────────────────────┤
//! │ Frame                                  │
//! │ ┌─────────┬─────────┬────────────────┐ │
//! │ │ Len (4) │ CRC (4) │ bincode payload│ │
//! │ └─────────┴─────────┴────────────────┘ │
//! │ ... (repeated, append-only)            │
//! └────────────────────────────────────────┘
//! ```
//!
//! Block frames carry either a written block (address, MIBID, stream, node)
//! or a free marker. Replaying the log rebuilds the allocation table.

mod block;
mod cache;
mod datafile;
mod frame;
mod journal;
mod store;

pub use block::{Block, ChildRef, CoreNode, VectorNode, KFACTOR, KSHIFT, VSIZE};
pub use cache::BlockCache;
pub use journal::{JournalSuperblockStore, MemorySuperblockStore, SuperblockStore};
pub use store::BlockStore;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque block address; 0 is never allocated
pub type BlockAddr = u64;

/// Sentinel generation meaning "the newest published generation"
pub const LATEST_GENERATION: u64 = u64::MAX;

/// Root pointer record for one stream generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub stream: Uuid,
    pub generation: u64,
    /// Root block, `None` for an empty tree
    pub root: Option<BlockAddr>,
    /// Allocation watermark: every block in this generation has a smaller MIBID
    pub mibid: u64,
}

impl Superblock {
    /// The implicit, empty generation 0 every stream starts from
    pub fn empty(stream: Uuid) -> Self {
        Self {
            stream,
            generation: 0,
            root: None,
            mibid: 0,
        }
    }
}

/// Result of a full-store consistency scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockReport {
    /// Blocks written and not freed
    pub allocated: u64,
    /// Addresses on the free list
    pub free: u64,
    /// References from live generations that do not resolve to a valid block
    pub inconsistent: u64,
    /// Written blocks no live generation can reach
    pub leaked: u64,
}

//! Block definitions
//!
//! The two node kinds a tree is built from. Core nodes fan out to `KFACTOR`
//! children and carry a summary for each; vector nodes hold raw records.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::record::{Record, Summary};

use super::BlockAddr;

/// log2 of the core node fan-out
pub const KSHIFT: u8 = 6;

/// Children per core node
pub const KFACTOR: usize = 1 << KSHIFT;

/// Maximum records in a vector node before it splits
pub const VSIZE: usize = 1024;

/// Pointer from a core node to one child, with the child's statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
    pub addr: BlockAddr,
    pub summary: Summary,
}

/// Interior node covering `2^pw` nanoseconds starting at `start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreNode {
    pub start: i64,
    pub pw: u8,
    /// Exactly `KFACTOR` slots; slot `i` covers `start + i * 2^(pw - KSHIFT)`
    pub children: Vec<Option<ChildRef>>,
}

/// Leaf node holding records in strictly increasing time order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorNode {
    pub start: i64,
    pub pw: u8,
    pub records: Vec<Record>,
}

/// A tree block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Block {
    Core(CoreNode),
    Vector(VectorNode),
}

impl Block {
    pub fn start(&self) -> i64 {
        match self {
            Block::Core(n) => n.start,
            Block::Vector(n) => n.start,
        }
    }

    pub fn pw(&self) -> u8 {
        match self {
            Block::Core(n) => n.pw,
            Block::Vector(n) => n.pw,
        }
    }

    /// Addresses of every direct child
    pub fn child_addrs(&self) -> impl Iterator<Item = BlockAddr> + '_ {
        let children: &[Option<ChildRef>] = match self {
            Block::Core(n) => &n.children,
            Block::Vector(_) => &[],
        };
        children.iter().flatten().map(|c| c.addr)
    }

    /// Statistics over everything below this block
    pub fn summary(&self) -> Option<Summary> {
        match self {
            Block::Core(n) => Summary::combine(n.children.iter().flatten().map(|c| &c.summary)),
            Block::Vector(n) => Summary::of_records(&n.records),
        }
    }

    /// Check the structural invariants a block must satisfy before it is
    /// persisted or after it is decoded
    pub fn validate(&self) -> Result<()> {
        match self {
            Block::Core(n) => {
                if n.children.len() != KFACTOR {
                    return Err(StrataError::Internal(format!(
                        "core node at {} has {} child slots, expected {}",
                        n.start,
                        n.children.len(),
                        KFACTOR
                    )));
                }
                if n.pw < KSHIFT {
                    return Err(StrataError::Internal(format!(
                        "core node at {} has point width {} below fan-out shift",
                        n.start, n.pw
                    )));
                }
            }
            Block::Vector(n) => {
                if n.records.windows(2).any(|w| w[0].time >= w[1].time) {
                    return Err(StrataError::Internal(format!(
                        "vector node at {} is not strictly time ordered",
                        n.start
                    )));
                }
            }
        }
        Ok(())
    }
}

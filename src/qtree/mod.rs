//! Versioned Tree Module
//!
//! Per-stream copy-on-write multiway tree over block store addresses.
//!
//! ## Geometry
//! ```text
//! root (pw 62, spans the whole time domain)
//!  ├── child 0   (pw 56)        core nodes: 64 children, one Summary each
//!  ├── child 1   (pw 56)
//!  │    ├── ...  (pw 50)
//!  │    └── leaf (vector node)  up to 1024 raw records
//!  └── child 63  (pw 56)
//! ```
//!
//! A node with point width `pw` starting at `start` covers
//! `[start, start + 2^pw)`. Child `i` of a core node starts at
//! `start + i * 2^(pw - 6)`. Vector nodes that overflow split into a core
//! node at the same position, so tree depth adapts to local density.
//!
//! ## Versioning
//! A commit rewrites only the root-to-leaf paths touched by the staged
//! mutations; every untouched subtree is shared with the previous generation
//! by address. Published blocks are never modified, which is what makes read
//! handles snapshot-isolated.

mod diff;
mod read;
mod write;

pub use read::ReadTree;
pub use write::WriteTree;

use crate::bstore::KSHIFT;
use crate::record::MINIMUM_TIME;

/// Start of the root node's span
pub(crate) const ROOT_START: i64 = MINIMUM_TIME;

/// Exclusive end of a node's span
pub(crate) fn node_end(start: i64, pw: u8) -> i64 {
    start + (1i64 << pw)
}

pub(crate) fn child_pw(pw: u8) -> u8 {
    pw - KSHIFT
}

pub(crate) fn child_start(start: i64, pw: u8, index: usize) -> i64 {
    start + ((index as i64) << child_pw(pw))
}

/// Index of the child slot containing `time`; `time` must lie in the node
pub(crate) fn child_index(start: i64, pw: u8, time: i64) -> usize {
    ((time - start) >> child_pw(pw)) as usize
}

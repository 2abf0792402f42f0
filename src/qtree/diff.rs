//! Version diff
//!
//! Structural comparison of two generations. Shared subtrees have identical
//! addresses and are skipped without being read, so the cost tracks the
//! size of the change rather than the size of the stream.

use crate::bstore::{Block, BlockAddr, ChildRef, KFACTOR};
use crate::error::Result;
use crate::record::{ChangedRange, Record, ROOT_PW};

use super::read::ReadTree;
use super::{child_pw, child_start, ROOT_START};

/// A differing span and the number of timestamps that differ inside it
#[derive(Debug, Clone, Copy)]
struct Divergence {
    start: i64,
    end: i64,
    points: u64,
}

impl ReadTree {
    /// Time ranges whose contents differ between `from_generation` and this
    /// generation
    ///
    /// Adjacent or overlapping ranges are merged, and merged ranges with
    /// `threshold` or fewer differing points are dropped. Generation 0 is
    /// the empty generation.
    pub fn query_changed_ranges(
        &self,
        from_generation: u64,
        threshold: u64,
    ) -> Result<Vec<ChangedRange>> {
        let from = ReadTree::open(self.bs.clone(), self.sb.stream, from_generation)?;

        let mut found = Vec::new();
        self.diff(from.sb.root, self.sb.root, ROOT_START, ROOT_PW, &mut found)?;

        let mut merged: Vec<Divergence> = Vec::with_capacity(found.len());
        for d in found {
            match merged.last_mut() {
                Some(last) if d.start <= last.end => {
                    last.end = last.end.max(d.end);
                    last.points += d.points;
                }
                _ => merged.push(d),
            }
        }

        tracing::debug!(
            "Changed ranges of {} between {} and {}: {} before threshold {}",
            self.sb.stream,
            from.generation(),
            self.generation(),
            merged.len(),
            threshold
        );

        Ok(merged
            .into_iter()
            .filter(|d| d.points > threshold)
            .map(|d| ChangedRange {
                start: d.start,
                end: d.end,
            })
            .collect())
    }

    fn diff(
        &self,
        old: Option<BlockAddr>,
        new: Option<BlockAddr>,
        start: i64,
        pw: u8,
        out: &mut Vec<Divergence>,
    ) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let old_block = old.map(|a| self.bs.read_block(a)).transpose()?;
        let new_block = new.map(|a| self.bs.read_block(a)).transpose()?;

        match (old_block.as_deref(), new_block.as_deref()) {
            (Some(Block::Core(a)), Some(Block::Core(b))) => self.diff_children(
                Some(a.children.as_slice()),
                Some(b.children.as_slice()),
                start,
                pw,
                out,
            ),
            (Some(Block::Core(a)), None) => {
                self.diff_children(Some(a.children.as_slice()), None, start, pw, out)
            }
            (None, Some(Block::Core(b))) => {
                self.diff_children(None, Some(b.children.as_slice()), start, pw, out)
            }
            // At least one side is a leaf: compare record by record
            _ => {
                let before = self.records_of(old, old_block.as_deref())?;
                let after = self.records_of(new, new_block.as_deref())?;
                if let Some(d) = compare_records(&before, &after) {
                    out.push(d);
                }
                Ok(())
            }
        }
    }

    fn diff_children(
        &self,
        old: Option<&[Option<ChildRef>]>,
        new: Option<&[Option<ChildRef>]>,
        start: i64,
        pw: u8,
        out: &mut Vec<Divergence>,
    ) -> Result<()> {
        let slot = |side: Option<&[Option<ChildRef>]>, i: usize| {
            side.and_then(|children| children[i]).map(|c| c.addr)
        };
        for i in 0..KFACTOR {
            let (a, b) = (slot(old, i), slot(new, i));
            if a != b {
                self.diff(a, b, child_start(start, pw, i), child_pw(pw), out)?;
            }
        }
        Ok(())
    }

    fn records_of(&self, addr: Option<BlockAddr>, block: Option<&Block>) -> Result<Vec<Record>> {
        match (addr, block) {
            (_, Some(Block::Vector(node))) => Ok(node.records.clone()),
            (Some(addr), Some(Block::Core(_))) => {
                let mut out = Vec::new();
                self.collect_values(addr, i64::MIN, i64::MAX, &mut out)?;
                Ok(out)
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// Span from the first to just past the last differing timestamp
fn compare_records(before: &[Record], after: &[Record]) -> Option<Divergence> {
    let mut first = None;
    let mut last = 0;
    let mut points = 0u64;
    let mut mark = |t: i64| {
        first.get_or_insert(t);
        last = t;
        points += 1;
    };

    let (mut i, mut j) = (0, 0);
    while i < before.len() || j < after.len() {
        match (before.get(i), after.get(j)) {
            (Some(a), Some(b)) if a.time == b.time => {
                if a.value.to_bits() != b.value.to_bits() {
                    mark(a.time);
                }
                i += 1;
                j += 1;
            }
            (Some(a), Some(b)) if a.time < b.time => {
                mark(a.time);
                i += 1;
            }
            (Some(a), None) => {
                mark(a.time);
                i += 1;
            }
            (_, Some(b)) => {
                mark(b.time);
                j += 1;
            }
            (None, None) => break,
        }
    }

    first.map(|start| Divergence {
        start,
        end: last + 1,
        points,
    })
}

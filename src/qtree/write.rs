//! Write Handle
//!
//! Stages inserts and deletions against the latest generation of a stream
//! and materializes them into a new generation on commit.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::bstore::{
    Block, BlockAddr, BlockStore, ChildRef, CoreNode, Superblock, VectorNode, KFACTOR, KSHIFT,
    LATEST_GENERATION, VSIZE,
};
use crate::error::{Result, StrataError};
use crate::record::{check_time, Record, MAXIMUM_TIME, MINIMUM_TIME, ROOT_PW};

use super::{child_pw, child_start, node_end, ROOT_START};

/// A half-open deletion range
type Span = (i64, i64);

/// Open write generation of one stream
///
/// Callers must not run two write handles for the same stream at once; the
/// coalescer guarantees this. A second concurrent commit fails at publish
/// rather than corrupting the stream.
pub struct WriteTree {
    bs: Arc<BlockStore>,
    stream: Uuid,
    base: Superblock,
    /// Staged records; a later insert at the same time replaces the earlier one
    inserts: BTreeMap<i64, f64>,
    deletes: Vec<Span>,
    pending: Vec<(BlockAddr, Block)>,
}

impl WriteTree {
    /// Open a write handle on top of the latest generation
    pub fn open(bs: Arc<BlockStore>, stream: Uuid) -> Result<Self> {
        let base = bs
            .load_superblock(&stream, LATEST_GENERATION)?
            .unwrap_or_else(|| Superblock::empty(stream));
        Ok(Self {
            bs,
            stream,
            base,
            inserts: BTreeMap::new(),
            deletes: Vec::new(),
            pending: Vec::new(),
        })
    }

    /// Generation this handle builds on
    pub fn generation(&self) -> u64 {
        self.base.generation
    }

    pub fn stream(&self) -> Uuid {
        self.stream
    }

    /// Number of distinct staged timestamps
    pub fn staged_len(&self) -> usize {
        self.inserts.len()
    }

    /// Stage records; nothing is persisted until [`commit`](WriteTree::commit)
    ///
    /// The whole batch is rejected if any time is outside the domain.
    pub fn insert_values(&mut self, records: &[Record]) -> Result<()> {
        for r in records {
            check_time(r.time)?;
        }
        for r in records {
            self.inserts.insert(r.time, r.value);
        }
        Ok(())
    }

    /// Stage removal of `[start, end)`, including records staged before it
    pub fn delete_range(&mut self, start: i64, end: i64) -> Result<()> {
        if start > end {
            return Err(StrataError::InvalidArgument(format!(
                "delete range start {} after end {}",
                start, end
            )));
        }
        let start = start.max(MINIMUM_TIME);
        let end = end.min(MAXIMUM_TIME + 1);
        if start >= end {
            return Ok(());
        }

        let doomed: Vec<i64> = self.inserts.range(start..end).map(|(t, _)| *t).collect();
        for t in doomed {
            self.inserts.remove(&t);
        }
        self.deletes.push((start, end));
        Ok(())
    }

    /// Build the new tree copy-on-write, persist it and publish its superblock
    ///
    /// Returns the new generation number.
    pub fn commit(mut self) -> Result<u64> {
        let records: Vec<Record> = self
            .inserts
            .iter()
            .map(|(t, v)| Record::new(*t, *v))
            .collect();
        let deletes = normalize(std::mem::take(&mut self.deletes));

        let root = if records.is_empty() && deletes.is_empty() {
            self.base.root
        } else {
            match self.rewrite(self.base.root, ROOT_START, ROOT_PW, &records, &deletes) {
                Ok(root) => root.map(|c| c.addr),
                Err(e) => {
                    self.abandon();
                    return Err(e);
                }
            }
        };

        let generation = self.base.generation + 1;
        let block_count = self.pending.len();
        let addrs: Vec<BlockAddr> = self.pending.iter().map(|(addr, _)| *addr).collect();
        let blocks = std::mem::take(&mut self.pending);

        let _gate = self.bs.commit_guard();
        if let Err(e) = self.bs.write_blocks(self.stream, blocks) {
            self.bs.abandon_blocks(&addrs);
            return Err(e);
        }
        self.bs.publish_superblock(Superblock {
            stream: self.stream,
            generation,
            root,
            mibid: self.bs.current_mibid(),
        })?;

        tracing::debug!(
            "Committed generation {} of {}: {} records, {} deletions, {} new blocks",
            generation,
            self.stream,
            records.len(),
            deletes.len(),
            block_count
        );
        Ok(generation)
    }

    // =========================================================================
    // Copy-on-write construction
    // =========================================================================

    /// Produce the replacement for the node at `existing` after applying
    /// `inserts` (sorted, unique, inside the node) and `deletes`
    fn rewrite(
        &mut self,
        existing: Option<BlockAddr>,
        start: i64,
        pw: u8,
        inserts: &[Record],
        deletes: &[Span],
    ) -> Result<Option<ChildRef>> {
        let end = node_end(start, pw);
        let wiped = deletes.iter().any(|&(s, e)| s <= start && e >= end);
        let existing = if wiped { None } else { existing };

        let Some(addr) = existing else {
            return self.build(start, pw, inserts);
        };

        let block = self.bs.read_block(addr)?;
        match &*block {
            Block::Vector(node) => {
                let merged = merge_records(&node.records, inserts, deletes);
                self.build(start, pw, &merged)
            }
            Block::Core(node) => {
                let cpw = child_pw(pw);
                let mut children = Vec::with_capacity(KFACTOR);
                let mut rest = inserts;
                for (i, child) in node.children.iter().enumerate() {
                    let cs = child_start(start, pw, i);
                    let ce = node_end(cs, cpw);
                    let (mine, tail) = rest.split_at(rest.partition_point(|r| r.time < ce));
                    rest = tail;
                    let dels: Vec<Span> = deletes
                        .iter()
                        .filter(|&&(s, e)| s < ce && e > cs)
                        .copied()
                        .collect();

                    if mine.is_empty() && (dels.is_empty() || child.is_none()) {
                        children.push(*child);
                        continue;
                    }
                    children.push(self.rewrite(child.map(|c| c.addr), cs, cpw, mine, &dels)?);
                }

                if children.iter().all(Option::is_none) {
                    return Ok(None);
                }
                self.stage(Block::Core(CoreNode {
                    start,
                    pw,
                    children,
                }))
                .map(Some)
            }
        }
    }

    /// Build a brand-new subtree holding exactly `records`
    fn build(&mut self, start: i64, pw: u8, records: &[Record]) -> Result<Option<ChildRef>> {
        if records.is_empty() {
            return Ok(None);
        }
        if records.len() <= VSIZE || pw < KSHIFT {
            return self
                .stage(Block::Vector(VectorNode {
                    start,
                    pw,
                    records: records.to_vec(),
                }))
                .map(Some);
        }

        let cpw = child_pw(pw);
        let mut children = Vec::with_capacity(KFACTOR);
        let mut rest = records;
        for i in 0..KFACTOR {
            let ce = node_end(child_start(start, pw, i), cpw);
            let (mine, tail) = rest.split_at(rest.partition_point(|r| r.time < ce));
            rest = tail;
            children.push(self.build(child_start(start, pw, i), cpw, mine)?);
        }
        self.stage(Block::Core(CoreNode {
            start,
            pw,
            children,
        }))
        .map(Some)
    }

    /// Allocate an address for a finished block and queue it for writing
    fn stage(&mut self, block: Block) -> Result<ChildRef> {
        block.validate()?;
        let summary = block.summary().ok_or_else(|| {
            StrataError::Internal(format!("refusing to stage empty block at {}", block.start()))
        })?;
        let addr = self.bs.allocate_block(self.stream);
        self.pending.push((addr, block));
        Ok(ChildRef { addr, summary })
    }

    fn abandon(&mut self) {
        let addrs: Vec<BlockAddr> = self.pending.drain(..).map(|(addr, _)| addr).collect();
        self.bs.abandon_blocks(&addrs);
    }
}

impl Drop for WriteTree {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            self.abandon();
        }
    }
}

/// Sort and coalesce overlapping deletion ranges
fn normalize(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_unstable();
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for (s, e) in spans {
        match merged.last_mut() {
            Some(last) if s <= last.1 => last.1 = last.1.max(e),
            _ => merged.push((s, e)),
        }
    }
    merged
}

/// Merge stored records with staged ones; staged values win on equal times
fn merge_records(stored: &[Record], inserts: &[Record], deletes: &[Span]) -> Vec<Record> {
    let deleted = |t: i64| deletes.iter().any(|&(s, e)| t >= s && t < e);
    let mut out = Vec::with_capacity(stored.len() + inserts.len());
    let (mut i, mut j) = (0, 0);
    while i < stored.len() || j < inserts.len() {
        match (stored.get(i), inserts.get(j)) {
            (Some(a), Some(b)) if a.time == b.time => {
                out.push(*b);
                i += 1;
                j += 1;
            }
            (Some(a), Some(b)) if a.time < b.time => {
                if !deleted(a.time) {
                    out.push(*a);
                }
                i += 1;
            }
            (Some(_), Some(b)) | (None, Some(b)) => {
                out.push(*b);
                j += 1;
            }
            (Some(a), None) => {
                if !deleted(a.time) {
                    out.push(*a);
                }
                i += 1;
            }
            (None, None) => break,
        }
    }
    out
}

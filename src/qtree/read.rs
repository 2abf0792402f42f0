//! Read Handle
//!
//! Snapshot view of one published generation. Every query walks the tree
//! from the generation's root and only touches blocks overlapping the
//! requested range.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::bstore::{Block, BlockAddr, BlockStore, Superblock, LATEST_GENERATION};
use crate::error::{Result, StrataError};
use crate::record::{
    check_point_width, Accumulator, Record, StatRecord, Summary, MAXIMUM_TIME, MINIMUM_TIME,
    ROOT_PW,
};

use super::{child_index, child_pw, child_start, node_end, ROOT_START};

/// Immutable view of one generation of a stream
pub struct ReadTree {
    pub(super) bs: Arc<BlockStore>,
    pub(super) sb: Superblock,
}

impl ReadTree {
    /// Open a generation; `LATEST_GENERATION` selects the newest
    ///
    /// A stream that was never committed reads as the empty generation 0,
    /// both at `LATEST_GENERATION` and at generation 0 itself.
    pub fn open(bs: Arc<BlockStore>, stream: Uuid, generation: u64) -> Result<Self> {
        let sb = match bs.load_superblock(&stream, generation)? {
            Some(sb) => sb,
            None if generation == LATEST_GENERATION || generation == 0 => {
                Superblock::empty(stream)
            }
            None => return Err(StrataError::NoSuchGeneration { stream, generation }),
        };
        Ok(Self { bs, sb })
    }

    pub fn generation(&self) -> u64 {
        self.sb.generation
    }

    pub fn stream(&self) -> Uuid {
        self.sb.stream
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    // =========================================================================
    // Raw values
    // =========================================================================

    /// Every record with `start <= time < end`, ascending
    pub fn read_standard_values_block(&self, start: i64, end: i64) -> Result<Vec<Record>> {
        let Some((start, end)) = clamp_range(start, end)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        if let Some(root) = self.sb.root {
            self.collect_values(root, start, end, &mut out)?;
        }
        Ok(out)
    }

    pub(super) fn collect_values(
        &self,
        addr: BlockAddr,
        start: i64,
        end: i64,
        out: &mut Vec<Record>,
    ) -> Result<()> {
        let block = self.bs.read_block(addr)?;
        match &*block {
            Block::Vector(node) => {
                let lo = node.records.partition_point(|r| r.time < start);
                let hi = node.records.partition_point(|r| r.time < end);
                out.extend_from_slice(&node.records[lo..hi]);
            }
            Block::Core(node) => {
                let cpw = child_pw(node.pw);
                for (i, child) in node.children.iter().enumerate() {
                    let Some(child) = child else { continue };
                    let cs = child_start(node.start, node.pw, i);
                    if cs >= end || node_end(cs, cpw) <= start {
                        continue;
                    }
                    self.collect_values(child.addr, start, end, out)?;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Statistical aggregates
    // =========================================================================

    /// Aggregate records into buckets of width `2^pw`
    ///
    /// `start` is rounded down and `end` rounded up to the bucket grid; empty
    /// buckets are omitted. Subtrees that fit entirely inside one bucket are
    /// answered from their stored summary without being read.
    pub fn query_statistical_values_block(
        &self,
        start: i64,
        end: i64,
        pw: u8,
    ) -> Result<Vec<StatRecord>> {
        check_point_width(pw)?;
        let Some((start, end)) = clamp_range(start, end)? else {
            return Ok(Vec::new());
        };
        let mask = (1i64 << pw) - 1;
        let start = start & !mask;
        let end = (end + mask) & !mask;

        let mut buckets = Buckets::new(mask);
        if let Some(root) = self.sb.root {
            self.collect_stats(root, ROOT_START, ROOT_PW, start, end, pw, &mut buckets)?;
        }
        Ok(buckets.finish())
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_stats(
        &self,
        addr: BlockAddr,
        node_start: i64,
        node_pw: u8,
        start: i64,
        end: i64,
        pw: u8,
        buckets: &mut Buckets,
    ) -> Result<()> {
        let block = self.bs.read_block(addr)?;
        match &*block {
            Block::Vector(node) => {
                let lo = node.records.partition_point(|r| r.time < start);
                let hi = node.records.partition_point(|r| r.time < end);
                for r in &node.records[lo..hi] {
                    buckets.add_value(r.time, r.value);
                }
            }
            Block::Core(node) => {
                let cpw = child_pw(node_pw);
                for (i, child) in node.children.iter().enumerate() {
                    let Some(child) = child else { continue };
                    let cs = child_start(node_start, node_pw, i);
                    if cs >= end || node_end(cs, cpw) <= start {
                        continue;
                    }
                    // Bucket-aligned query bounds mean a child no wider than a
                    // bucket is either fully inside or fully outside the range
                    if cpw <= pw {
                        buckets.add_summary(cs, &child.summary);
                    } else {
                        self.collect_stats(child.addr, cs, cpw, start, end, pw, buckets)?;
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Nearest value
    // =========================================================================

    /// Closest record at or after `time`, or at or before it when `backwards`
    pub fn find_nearest_value(&self, time: i64, backwards: bool) -> Result<Record> {
        let Some(root) = self.sb.root else {
            return Err(StrataError::NoSuchPoint);
        };
        let time = if backwards {
            if time < MINIMUM_TIME {
                return Err(StrataError::NoSuchPoint);
            }
            time.min(MAXIMUM_TIME)
        } else {
            if time > MAXIMUM_TIME {
                return Err(StrataError::NoSuchPoint);
            }
            time.max(MINIMUM_TIME)
        };
        self.nearest(root, time, backwards)?
            .ok_or(StrataError::NoSuchPoint)
    }

    fn nearest(&self, addr: BlockAddr, time: i64, backwards: bool) -> Result<Option<Record>> {
        let block = self.bs.read_block(addr)?;
        match &*block {
            Block::Vector(node) => {
                let found = if backwards {
                    let idx = node.records.partition_point(|r| r.time <= time);
                    idx.checked_sub(1).map(|i| node.records[i])
                } else {
                    let idx = node.records.partition_point(|r| r.time < time);
                    node.records.get(idx).copied()
                };
                Ok(found)
            }
            Block::Core(node) => {
                let here = if time < node.start {
                    0
                } else if time >= node_end(node.start, node.pw) {
                    node.children.len() - 1
                } else {
                    child_index(node.start, node.pw, time)
                };
                let order: Box<dyn Iterator<Item = usize>> = if backwards {
                    Box::new((0..=here).rev())
                } else {
                    Box::new(here..node.children.len())
                };
                for i in order {
                    let Some(child) = &node.children[i] else { continue };
                    if let Some(found) = self.nearest(child.addr, time, backwards)? {
                        return Ok(Some(found));
                    }
                }
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Reachability
    // =========================================================================

    /// Every block address reachable from this generation's root
    pub fn get_all_referenced_vaddrs(&self) -> Result<HashSet<BlockAddr>> {
        let mut reached = HashSet::new();
        let Some(root) = self.sb.root else {
            return Ok(reached);
        };
        let mut stack = vec![root];
        while let Some(addr) = stack.pop() {
            if reached.insert(addr) {
                stack.extend(self.bs.read_block(addr)?.child_addrs());
            }
        }
        Ok(reached)
    }
}

/// Clamp a query range to the time domain; `None` when it is empty
fn clamp_range(start: i64, end: i64) -> Result<Option<(i64, i64)>> {
    if start > end {
        return Err(StrataError::InvalidArgument(format!(
            "query start {} after end {}",
            start, end
        )));
    }
    let start = start.max(MINIMUM_TIME);
    let end = end.min(MAXIMUM_TIME + 1);
    Ok((start < end).then_some((start, end)))
}

/// Output buckets filled in ascending time order
struct Buckets {
    mask: i64,
    current: Option<Accumulator>,
    out: Vec<StatRecord>,
}

impl Buckets {
    fn new(mask: i64) -> Self {
        Self {
            mask,
            current: None,
            out: Vec::new(),
        }
    }

    fn bucket(&mut self, time: i64) -> &mut Accumulator {
        let bucket = time & !self.mask;
        if self.current.map_or(true, |acc| acc.time != bucket) {
            if let Some(done) = self.current.take().and_then(|acc| acc.finish()) {
                self.out.push(done);
            }
            self.current = Some(Accumulator::new(bucket));
        }
        self.current.get_or_insert_with(|| Accumulator::new(bucket))
    }

    fn add_value(&mut self, time: i64, value: f64) {
        self.bucket(time).add_value(value);
    }

    fn add_summary(&mut self, time: i64, summary: &Summary) {
        self.bucket(time).add_summary(summary);
    }

    fn finish(mut self) -> Vec<StatRecord> {
        if let Some(done) = self.current.take().and_then(|acc| acc.finish()) {
            self.out.push(done);
        }
        self.out
    }
}

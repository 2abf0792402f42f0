//! Engine Module
//!
//! The public facade that coordinates all components.
//!
//! ## Responsibilities
//! - Route inserts through the coalescer and queries to read handles
//! - Resolve the API's generation 0 to "latest"
//! - Run deletions and garbage collection as the stream's exclusive writer
//! - Recover every committed generation on startup

use std::sync::Arc;

use uuid::Uuid;

use crate::bstore::{BlockReport, BlockStore, SuperblockStore, LATEST_GENERATION};
use crate::coalesce::Coalescer;
use crate::config::Config;
use crate::error::{Result, StrataError};
use crate::qtree::{ReadTree, WriteTree};
use crate::record::{ChangedRange, Record, StatRecord};

/// The main storage engine
///
/// ## Concurrency Model
///
/// - **Inserts**: many concurrent callers; per-stream buffers are guarded by
///   a short map lock inside the coalescer, never held across a commit
/// - **Commits**: at most one per stream at a time, handed off through the
///   coalescer's expired-buffer token
/// - **Queries**: lock-free with respect to commits; each opens a snapshot of
///   one published generation
/// - **Delete / GC**: claim the stream like a commit does
pub struct Engine {
    config: Config,
    bs: Arc<BlockStore>,
    coalescer: Arc<Coalescer>,
}

impl Engine {
    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Validate the config
    /// 2. Replay the block log and superblock journal
    /// 3. Ready to serve requests
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let bs = Arc::new(BlockStore::open(&config)?);
        Self::assemble(config, bs)
    }

    /// Open with superblocks kept in an external registry
    pub fn with_superblock_store(
        config: Config,
        superblocks: Box<dyn SuperblockStore>,
    ) -> Result<Self> {
        config.validate()?;
        let bs = Arc::new(BlockStore::with_superblock_store(&config, superblocks)?);
        Self::assemble(config, bs)
    }

    fn assemble(config: Config, bs: Arc<BlockStore>) -> Result<Self> {
        let coalescer = Coalescer::new(Arc::clone(&bs), &config)?;
        tracing::info!(
            "Engine open at {} (coalescing {})",
            config.data_dir.display(),
            if config.transaction_coalesce_enable {
                "enabled"
            } else {
                "disabled"
            }
        );
        Ok(Self {
            config,
            bs,
            coalescer,
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert records into a stream
    ///
    /// With `sync` the call returns only once the records are committed.
    pub fn insert_values(&self, stream: Uuid, records: &[Record], sync: bool) -> Result<()> {
        match self.coalescer.insert_values(stream, records)? {
            Some(pending) if sync => self.coalescer.commit_pending(stream, pending),
            _ => Ok(()),
        }
    }

    /// Commit any buffered records of a stream
    pub fn flush(&self, stream: Uuid) -> Result<()> {
        self.coalescer.flush(stream)
    }

    /// Remove records in `[start, end)`; returns the new generation
    pub fn delete_range(&self, stream: Uuid, start: i64, end: i64) -> Result<u64> {
        self.coalescer.with_stream_exclusive(stream, || {
            let mut tree = WriteTree::open(Arc::clone(&self.bs), stream)?;
            tree.delete_range(start, end)?;
            tree.commit()
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Records with `start <= time < end`, and the generation they came from
    pub fn query_values(
        &self,
        stream: Uuid,
        start: i64,
        end: i64,
        generation: u64,
    ) -> Result<(Vec<Record>, u64)> {
        let tree = self.read_tree(stream, generation)?;
        Ok((tree.read_standard_values_block(start, end)?, tree.generation()))
    }

    /// Aggregates over buckets of width `2^pw`
    pub fn query_statistical_values(
        &self,
        stream: Uuid,
        start: i64,
        end: i64,
        generation: u64,
        pw: u8,
    ) -> Result<(Vec<StatRecord>, u64)> {
        let tree = self.read_tree(stream, generation)?;
        Ok((
            tree.query_statistical_values_block(start, end, pw)?,
            tree.generation(),
        ))
    }

    pub fn query_nearest_value(
        &self,
        stream: Uuid,
        time: i64,
        backwards: bool,
        generation: u64,
    ) -> Result<(Record, u64)> {
        let tree = self.read_tree(stream, generation)?;
        Ok((tree.find_nearest_value(time, backwards)?, tree.generation()))
    }

    /// Latest committed generation of a stream
    pub fn query_generation(&self, stream: Uuid) -> Result<u64> {
        self.bs
            .load_superblock(&stream, LATEST_GENERATION)?
            .map(|sb| sb.generation)
            .ok_or(StrataError::NoSuchStream(stream))
    }

    /// Ranges that differ between `from_generation` (0 = empty) and
    /// `to_generation` (0 = latest)
    pub fn query_changed_ranges(
        &self,
        stream: Uuid,
        from_generation: u64,
        to_generation: u64,
        threshold: u64,
    ) -> Result<(Vec<ChangedRange>, u64)> {
        let tree = self.read_tree(stream, to_generation)?;
        Ok((
            tree.query_changed_ranges(from_generation, threshold)?,
            tree.generation(),
        ))
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Drop generations `[start_generation, end_generation)` of a stream and
    /// free the blocks only they referenced; returns the number freed
    ///
    /// `end_generation` 0 means latest. Blocks reachable from
    /// `end_generation` or from any older surviving generation are kept.
    pub fn unlink_blocks(
        &self,
        stream: Uuid,
        start_generation: u64,
        end_generation: u64,
    ) -> Result<u64> {
        self.coalescer.with_stream_exclusive(stream, || {
            let end = self
                .bs
                .load_superblock(&stream, resolve(end_generation))?
                .ok_or_else(|| match end_generation {
                    0 => StrataError::NoSuchStream(stream),
                    generation => StrataError::NoSuchGeneration { stream, generation },
                })?;
            if start_generation >= end.generation {
                return Ok(0);
            }

            let mut keep =
                ReadTree::open(Arc::clone(&self.bs), stream, end.generation)?
                    .get_all_referenced_vaddrs()?;
            for sb in self.bs.generations(&stream)? {
                if sb.generation < start_generation {
                    keep.extend(
                        ReadTree::open(Arc::clone(&self.bs), stream, sb.generation)?
                            .get_all_referenced_vaddrs()?,
                    );
                }
            }

            let unlinked =
                self.bs
                    .unlink_generations(&stream, start_generation, end.generation)?;
            let freed = self.bs.unlink_blocks(&stream, 0, end.mibid, &keep)?;
            tracing::info!(
                "GC of {}: unlinked {} generations in [{}, {}), freed {} blocks",
                stream,
                unlinked,
                start_generation,
                end.generation,
                freed
            );
            Ok(freed)
        })
    }

    /// Allocation and reachability counts across the whole store
    pub fn inspect_blocks(&self) -> Result<BlockReport> {
        self.bs.inspect_blocks()
    }

    /// Free written blocks no live generation references
    pub fn unlink_leaks(&self) -> Result<u64> {
        self.bs.unlink_leaks()
    }

    /// Close the engine gracefully
    ///
    /// Commits every open buffer and syncs storage to disk
    pub fn close(self) -> Result<()> {
        self.coalescer.flush_all()?;
        self.bs.sync()?;
        tracing::info!("Engine at {} closed", self.config.data_dir.display());
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.bs
    }

    /// Streams with a buffer open or a commit in flight
    pub fn buffered_streams(&self) -> usize {
        self.coalescer.buffered_streams()
    }

    fn read_tree(&self, stream: Uuid, generation: u64) -> Result<ReadTree> {
        ReadTree::open(Arc::clone(&self.bs), stream, resolve(generation))
    }
}

/// Map the API's generation 0 to the latest generation
fn resolve(generation: u64) -> u64 {
    if generation == 0 {
        LATEST_GENERATION
    } else {
        generation
    }
}

//! Block Store
//!
//! Allocation, caching and reclamation of tree blocks, plus superblock
//! bookkeeping.
//!
//! ## Commit ordering
//! A commit allocates addresses (pending, invisible to readers), writes the
//! finished blocks with [`BlockStore::write_blocks`] and only then publishes
//! its superblock. Readers resolve addresses exclusively through published
//! superblocks, so they can never reach a block that is not yet durable.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, StrataError};

use super::datafile::{BlockFile, LogEntry, LogEntryRef, Location};
use super::journal::{JournalSuperblockStore, SuperblockStore};
use super::{Block, BlockAddr, BlockCache, BlockReport, Superblock};

/// Allocation metadata for one address
#[derive(Debug, Clone, Copy)]
struct BlockMeta {
    mibid: u64,
    stream: Uuid,
    /// `None` while the allocating commit is still building the block
    location: Option<Location>,
}

#[derive(Default)]
struct AllocTable {
    blocks: HashMap<BlockAddr, BlockMeta>,
    /// Reusable addresses
    free: Vec<BlockAddr>,
    next_addr: BlockAddr,
    next_mibid: u64,
}

/// Durable, cached block storage shared by every stream
///
/// ## Concurrency:
/// - `table`: RwLock; held only for metadata bookkeeping, never across I/O
/// - `cache`: internal Mutex, safe for concurrent readers
/// - `commit_gate`: commits hold it shared from block write to publish;
///   store-wide scans hold it exclusively so unpublished blocks are never
///   mistaken for leaks
pub struct BlockStore {
    data_dir: PathBuf,
    file: BlockFile,
    table: RwLock<AllocTable>,
    cache: BlockCache,
    superblocks: Box<dyn SuperblockStore>,
    commit_gate: RwLock<()>,
}

impl BlockStore {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const BLOCK_FILENAME: &'static str = "blocks.dat";
    const SUPERBLOCK_FILENAME: &'static str = "superblocks.log";

    /// Open or create a block store under `config.data_dir`, with superblocks
    /// kept in the journal next to the block log
    pub fn open(config: &Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let journal = JournalSuperblockStore::open(
            &config.data_dir.join(Self::SUPERBLOCK_FILENAME),
            config.sync_on_commit(),
        )?;
        Self::with_superblock_store(config, Box::new(journal))
    }

    /// Open the block log under `config.data_dir` with an external superblock store
    pub fn with_superblock_store(
        config: &Config,
        superblocks: Box<dyn SuperblockStore>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let (file, entries) = BlockFile::open(
            &config.data_dir.join(Self::BLOCK_FILENAME),
            config.sync_on_commit(),
        )?;

        // Rebuild the allocation table from the log
        let mut table = AllocTable::default();
        let mut max_addr: BlockAddr = 0;
        let mut max_mibid: u64 = 0;
        for (location, entry) in entries {
            match entry {
                LogEntry::Write {
                    addr,
                    mibid,
                    stream,
                    ..
                } => {
                    max_addr = max_addr.max(addr);
                    max_mibid = max_mibid.max(mibid);
                    table.blocks.insert(
                        addr,
                        BlockMeta {
                            mibid,
                            stream,
                            location: Some(location),
                        },
                    );
                }
                LogEntry::Free { addr } => {
                    max_addr = max_addr.max(addr);
                    table.blocks.remove(&addr);
                }
            }
        }

        // Superblock watermarks may run ahead of the last written block
        for sb in superblocks.live()? {
            max_mibid = max_mibid.max(sb.mibid);
        }

        table.free = (1..=max_addr)
            .rev()
            .filter(|addr| !table.blocks.contains_key(addr))
            .collect();
        table.next_addr = max_addr + 1;
        table.next_mibid = max_mibid + 1;

        tracing::info!(
            "Block store {}: {} blocks, {} free addresses, next MIBID {}",
            config.data_dir.display(),
            table.blocks.len(),
            table.free.len(),
            table.next_mibid
        );

        Ok(Self {
            data_dir: config.data_dir.clone(),
            file,
            table: RwLock::new(table),
            cache: BlockCache::new(config.datablock_cache_size),
            superblocks,
            commit_gate: RwLock::new(()),
        })
    }

    // =========================================================================
    // Allocation and I/O
    // =========================================================================

    /// Reserve an address for a block `stream` is about to build
    ///
    /// The address stays pending (unreadable) until [`write_blocks`] persists
    /// it, and receives a MIBID larger than any handed out before.
    ///
    /// [`write_blocks`]: BlockStore::write_blocks
    pub fn allocate_block(&self, stream: Uuid) -> BlockAddr {
        let mut table = self.table.write();
        let addr = match table.free.pop() {
            Some(addr) => addr,
            None => {
                let addr = table.next_addr;
                table.next_addr += 1;
                addr
            }
        };
        let mibid = table.next_mibid;
        table.next_mibid += 1;
        table.blocks.insert(
            addr,
            BlockMeta {
                mibid,
                stream,
                location: None,
            },
        );
        addr
    }

    /// Return pending addresses of a commit that will not complete
    pub fn abandon_blocks(&self, addrs: &[BlockAddr]) {
        let mut table = self.table.write();
        for addr in addrs {
            let pending = matches!(table.blocks.get(addr), Some(meta) if meta.location.is_none());
            if pending {
                table.blocks.remove(addr);
                table.free.push(*addr);
            }
        }
    }

    /// Persist freshly built blocks; durable on return when syncing is enabled
    pub fn write_blocks(&self, stream: Uuid, blocks: Vec<(BlockAddr, Block)>) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut entries = Vec::with_capacity(blocks.len());
        {
            let table = self.table.read();
            for (addr, block) in &blocks {
                let meta = table.blocks.get(addr).ok_or_else(|| {
                    StrataError::Internal(format!("write to unallocated block {}", addr))
                })?;
                if meta.location.is_some() {
                    return Err(StrataError::Internal(format!(
                        "block {} is already written and immutable",
                        addr
                    )));
                }
                if meta.stream != stream {
                    return Err(StrataError::Internal(format!(
                        "block {} belongs to stream {}, not {}",
                        addr, meta.stream, stream
                    )));
                }
                entries.push(LogEntryRef::Write {
                    addr: *addr,
                    mibid: meta.mibid,
                    stream,
                    block,
                });
            }
        }

        let locations = self.file.append(&entries)?;
        drop(entries);

        let mut table = self.table.write();
        for ((addr, block), location) in blocks.into_iter().zip(locations) {
            if let Some(meta) = table.blocks.get_mut(&addr) {
                meta.location = Some(location);
            }
            self.cache.insert(addr, Arc::new(block));
        }
        Ok(())
    }

    /// Fetch a block from the cache, loading it from disk on a miss
    pub fn read_block(&self, addr: BlockAddr) -> Result<Arc<Block>> {
        if let Some(block) = self.cache.get(addr) {
            return Ok(block);
        }

        let (mibid, location) = self
            .meta(addr)
            .and_then(|meta| Some((meta.mibid, meta.location?)))
            .ok_or(StrataError::BlockNotFound(addr))?;

        let block = Arc::new(self.file.read(addr, location)?);

        // The address may have been freed and reused during the read
        let table = self.table.read();
        if matches!(table.blocks.get(&addr), Some(meta) if meta.mibid == mibid) {
            self.cache.insert(addr, Arc::clone(&block));
        }
        Ok(block)
    }

    /// Allocation sequence number the next block will receive
    pub fn current_mibid(&self) -> u64 {
        self.table.read().next_mibid
    }

    /// MIBID a live block was stamped with
    pub fn block_mibid(&self, addr: BlockAddr) -> Option<u64> {
        self.meta(addr).map(|meta| meta.mibid)
    }

    // =========================================================================
    // Superblocks
    // =========================================================================

    /// Resolve a generation (or `LATEST_GENERATION`) to its superblock
    pub fn load_superblock(&self, stream: &Uuid, generation: u64) -> Result<Option<Superblock>> {
        self.superblocks.load(stream, generation)
    }

    /// Every live generation of one stream, oldest first
    pub fn generations(&self, stream: &Uuid) -> Result<Vec<Superblock>> {
        self.superblocks.generations(stream)
    }

    /// Make a generation visible; its root must already be durably written
    pub fn publish_superblock(&self, superblock: Superblock) -> Result<()> {
        if let Some(root) = superblock.root {
            match self.meta(root) {
                Some(meta) if meta.location.is_some() && meta.mibid < superblock.mibid => {}
                _ => {
                    return Err(StrataError::Internal(format!(
                        "generation {} of {} points at unwritten root {}",
                        superblock.generation, superblock.stream, root
                    )))
                }
            }
        }
        self.superblocks.publish(superblock)
    }

    /// Drop superblocks in `[from, to)`; their blocks stay until swept
    pub fn unlink_generations(&self, stream: &Uuid, from: u64, to: u64) -> Result<u64> {
        let removed = self.superblocks.unlink(stream, from, to)?;
        tracing::debug!(
            "Unlinked {} generations of {} in [{}, {})",
            removed,
            stream,
            from,
            to
        );
        Ok(removed)
    }

    /// Shared guard a commit holds from its first block write until publish
    pub(crate) fn commit_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read()
    }

    // =========================================================================
    // Reclamation
    // =========================================================================

    /// Free every written block of `stream` with MIBID in `[mibid_low, mibid_high)`
    /// whose address is not in `keep`; returns the number freed
    pub fn unlink_blocks(
        &self,
        stream: &Uuid,
        mibid_low: u64,
        mibid_high: u64,
        keep: &HashSet<BlockAddr>,
    ) -> Result<u64> {
        let _gate = self.commit_gate.write();

        let doomed: Vec<BlockAddr> = {
            let table = self.table.read();
            table
                .blocks
                .iter()
                .filter(|(addr, meta)| {
                    meta.stream == *stream
                        && meta.location.is_some()
                        && meta.mibid >= mibid_low
                        && meta.mibid < mibid_high
                        && !keep.contains(addr)
                })
                .map(|(addr, _)| *addr)
                .collect()
        };

        self.free_blocks(&doomed)
    }

    /// Cross-check allocation metadata against reachability from every live
    /// superblock
    pub fn inspect_blocks(&self) -> Result<BlockReport> {
        let _gate = self.commit_gate.write();
        let (report, _) = self.scan()?;
        Ok(report)
    }

    /// Free every block [`inspect_blocks`] would report as leaked
    ///
    /// [`inspect_blocks`]: BlockStore::inspect_blocks
    pub fn unlink_leaks(&self) -> Result<u64> {
        let _gate = self.commit_gate.write();
        let (_, leaked) = self.scan()?;
        let freed = self.free_blocks(&leaked)?;
        tracing::info!("Freed {} leaked blocks", freed);
        Ok(freed)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Force block log and superblock registry to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync()?;
        self.superblocks.sync()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn meta(&self, addr: BlockAddr) -> Option<BlockMeta> {
        self.table.read().blocks.get(&addr).copied()
    }

    /// Durably record frees, then release the addresses
    fn free_blocks(&self, addrs: &[BlockAddr]) -> Result<u64> {
        if addrs.is_empty() {
            return Ok(0);
        }
        let entries: Vec<LogEntryRef<'_>> = addrs
            .iter()
            .map(|addr| LogEntryRef::Free { addr: *addr })
            .collect();
        self.file.append(&entries)?;

        let mut table = self.table.write();
        let mut freed = 0;
        for addr in addrs {
            if table.blocks.remove(addr).is_some() {
                table.free.push(*addr);
                freed += 1;
            }
            self.cache.invalidate(*addr);
        }
        Ok(freed)
    }

    /// Walk every live generation; returns the report and the leaked addresses
    fn scan(&self) -> Result<(BlockReport, Vec<BlockAddr>)> {
        let mut reached: HashSet<BlockAddr> = HashSet::new();
        let mut inconsistent = 0u64;

        for sb in self.superblocks.live()? {
            let Some(root) = sb.root else {
                continue;
            };
            let mut stack = vec![root];
            while let Some(addr) = stack.pop() {
                if !reached.insert(addr) {
                    continue;
                }
                let valid = matches!(
                    self.meta(addr),
                    Some(meta) if meta.location.is_some()
                        && meta.stream == sb.stream
                        && meta.mibid < sb.mibid
                );
                if !valid {
                    inconsistent += 1;
                    continue;
                }
                match self.read_block(addr) {
                    Ok(block) => stack.extend(block.child_addrs()),
                    Err(StrataError::Corruption(msg)) => {
                        tracing::warn!("Block {} unreadable during scan: {}", addr, msg);
                        inconsistent += 1;
                    }
                    Err(e) if e.is_not_found() => inconsistent += 1,
                    Err(e) => return Err(e),
                }
            }
        }

        let table = self.table.read();
        let mut allocated = 0u64;
        let mut leaked = Vec::new();
        for (addr, meta) in &table.blocks {
            if meta.location.is_none() {
                continue;
            }
            allocated += 1;
            if !reached.contains(addr) {
                leaked.push(*addr);
            }
        }

        let report = BlockReport {
            allocated,
            free: table.free.len() as u64,
            inconsistent,
            leaked: leaked.len() as u64,
        };
        Ok((report, leaked))
    }
}

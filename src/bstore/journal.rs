//! Superblock Registry
//!
//! Superblocks live apart from data blocks. The registry is a trait so the
//! root pointers can sit in any store with atomic single-key registration;
//! the default implementation is an fsync'd append-only journal.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Seek;
use std::path::Path;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StrataError};

use super::frame::{append_at, encode_frame, open_framed};
use super::{Superblock, LATEST_GENERATION};

/// Magic bytes identifying a Strata superblock journal
const JOURNAL_MAGIC: &[u8; 4] = b"STSB";

/// Storage for generation root pointers
pub trait SuperblockStore: Send + Sync {
    /// Look up `(stream, generation)`; `LATEST_GENERATION` selects the newest
    fn load(&self, stream: &Uuid, generation: u64) -> Result<Option<Superblock>>;

    /// Register a new generation; it must be newer than every existing one
    fn publish(&self, superblock: Superblock) -> Result<()>;

    /// Remove generations in `[from, to)`; returns how many were removed
    fn unlink(&self, stream: &Uuid, from: u64, to: u64) -> Result<u64>;

    /// Every live generation of one stream, oldest first
    fn generations(&self, stream: &Uuid) -> Result<Vec<Superblock>>;

    /// Every live generation of every stream
    fn live(&self) -> Result<Vec<Superblock>>;

    /// Make all registrations durable
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// In-memory index shared by both implementations
// =============================================================================

#[derive(Default)]
struct SuperblockIndex {
    entries: BTreeMap<(Uuid, u64), Superblock>,
}

impl SuperblockIndex {
    fn load(&self, stream: &Uuid, generation: u64) -> Option<Superblock> {
        if generation == LATEST_GENERATION {
            return self
                .entries
                .range((*stream, 0)..=(*stream, u64::MAX))
                .next_back()
                .map(|(_, sb)| *sb);
        }
        self.entries.get(&(*stream, generation)).copied()
    }

    fn check_publish(&self, sb: &Superblock) -> Result<()> {
        if sb.generation == 0 || sb.generation == LATEST_GENERATION {
            return Err(StrataError::Internal(format!(
                "cannot publish reserved generation {}",
                sb.generation
            )));
        }
        if let Some(latest) = self.load(&sb.stream, LATEST_GENERATION) {
            if sb.generation <= latest.generation {
                return Err(StrataError::Internal(format!(
                    "generation {} of {} already superseded by {}",
                    sb.generation, sb.stream, latest.generation
                )));
            }
        }
        Ok(())
    }

    fn insert(&mut self, sb: Superblock) {
        self.entries.insert((sb.stream, sb.generation), sb);
    }

    fn unlink(&mut self, stream: &Uuid, from: u64, to: u64) -> u64 {
        if from >= to {
            return 0;
        }
        let doomed: Vec<(Uuid, u64)> = self
            .entries
            .range((*stream, from)..(*stream, to))
            .map(|(k, _)| *k)
            .collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        doomed.len() as u64
    }

    fn generations(&self, stream: &Uuid) -> Vec<Superblock> {
        self.entries
            .range((*stream, 0)..=(*stream, u64::MAX))
            .map(|(_, sb)| *sb)
            .collect()
    }

    fn live(&self) -> Vec<Superblock> {
        self.entries.values().copied().collect()
    }
}

// =============================================================================
// Memory store
// =============================================================================

/// Volatile registry, for embedding and tests
#[derive(Default)]
pub struct MemorySuperblockStore {
    index: RwLock<SuperblockIndex>,
}

impl MemorySuperblockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SuperblockStore for MemorySuperblockStore {
    fn load(&self, stream: &Uuid, generation: u64) -> Result<Option<Superblock>> {
        Ok(self.index.read().load(stream, generation))
    }

    fn publish(&self, superblock: Superblock) -> Result<()> {
        let mut index = self.index.write();
        index.check_publish(&superblock)?;
        index.insert(superblock);
        Ok(())
    }

    fn unlink(&self, stream: &Uuid, from: u64, to: u64) -> Result<u64> {
        Ok(self.index.write().unlink(stream, from, to))
    }

    fn generations(&self, stream: &Uuid) -> Result<Vec<Superblock>> {
        Ok(self.index.read().generations(stream))
    }

    fn live(&self) -> Result<Vec<Superblock>> {
        Ok(self.index.read().live())
    }
}

// =============================================================================
// Journal store
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
enum JournalEntry {
    Publish(Superblock),
    Unlink { stream: Uuid, from: u64, to: u64 },
}

/// Durable registry backed by an append-only journal file
///
/// An entry becomes visible in the index only after it has been written
/// (and, when syncing, fsync'd) to the journal.
pub struct JournalSuperblockStore {
    index: RwLock<SuperblockIndex>,
    file: Mutex<JournalFile>,
    sync: bool,
}

struct JournalFile {
    file: File,
    /// End of the last complete frame
    end: u64,
}

impl JournalSuperblockStore {
    /// Open or create the journal and rebuild the index from it
    pub fn open(path: &Path, sync: bool) -> Result<Self> {
        let (mut file, frames) = open_framed(path, JOURNAL_MAGIC)?;
        let end = file.stream_position()?;

        let mut index = SuperblockIndex::default();
        for frame in &frames {
            match bincode::deserialize::<JournalEntry>(&frame.payload)? {
                JournalEntry::Publish(sb) => index.insert(sb),
                JournalEntry::Unlink { stream, from, to } => {
                    index.unlink(&stream, from, to);
                }
            }
        }

        tracing::debug!(
            "Superblock journal {}: {} entries replayed, {} live generations",
            path.display(),
            frames.len(),
            index.entries.len()
        );

        Ok(Self {
            index: RwLock::new(index),
            file: Mutex::new(JournalFile { file, end }),
            sync,
        })
    }

    fn append(&self, entry: &JournalEntry) -> Result<()> {
        let frame = encode_frame(&bincode::serialize(entry)?);
        let mut journal = self.file.lock();
        let start = journal.end;
        match append_at(&mut journal.file, start, &frame, self.sync) {
            Ok(end) => {
                journal.end = end;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Superblock journal append failed, rolled back to {}: {}", start, e);
                Err(e.into())
            }
        }
    }
}

impl SuperblockStore for JournalSuperblockStore {
    fn load(&self, stream: &Uuid, generation: u64) -> Result<Option<Superblock>> {
        Ok(self.index.read().load(stream, generation))
    }

    fn publish(&self, superblock: Superblock) -> Result<()> {
        // Held across the append so concurrent publishes cannot interleave
        let mut index = self.index.write();
        index.check_publish(&superblock)?;
        self.append(&JournalEntry::Publish(superblock))?;
        index.insert(superblock);
        Ok(())
    }

    fn unlink(&self, stream: &Uuid, from: u64, to: u64) -> Result<u64> {
        let mut index = self.index.write();
        self.append(&JournalEntry::Unlink {
            stream: *stream,
            from,
            to,
        })?;
        Ok(index.unlink(stream, from, to))
    }

    fn generations(&self, stream: &Uuid) -> Result<Vec<Superblock>> {
        Ok(self.index.read().generations(stream))
    }

    fn live(&self) -> Result<Vec<Superblock>> {
        Ok(self.index.read().live())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().file.sync_all()?;
        Ok(())
    }
}

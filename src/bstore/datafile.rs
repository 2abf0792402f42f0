//! Block Log
//!
//! Append-only file of block writes and frees. Reads go through a separate
//! handle so cache misses do not queue behind commits.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StrataError};

use super::frame::{append_at, decode_frame, encode_frame, open_framed};
use super::{Block, BlockAddr};

/// Magic bytes identifying a Strata block log
const BLOCK_MAGIC: &[u8; 4] = b"STBK";

/// Where a frame lives in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Location {
    pub offset: u64,
    pub len: u32,
}

/// Log entry as decoded from disk
#[derive(Debug, Deserialize)]
pub(crate) enum LogEntry {
    Write {
        addr: BlockAddr,
        mibid: u64,
        stream: Uuid,
        block: Block,
    },
    Free {
        addr: BlockAddr,
    },
}

/// Borrowed twin of [`LogEntry`]; encodes identically
#[derive(Debug, Serialize)]
pub(crate) enum LogEntryRef<'a> {
    Write {
        addr: BlockAddr,
        mibid: u64,
        stream: Uuid,
        block: &'a Block,
    },
    Free {
        addr: BlockAddr,
    },
}

struct Appender {
    file: File,
    end: u64,
}

/// Append-only block log
pub(crate) struct BlockFile {
    path: PathBuf,
    appender: Mutex<Appender>,
    reader: Mutex<File>,
    sync: bool,
}

impl BlockFile {
    /// Open the log and replay every intact entry in order
    pub fn open(path: &Path, sync: bool) -> Result<(Self, Vec<(Location, LogEntry)>)> {
        let (mut file, frames) = open_framed(path, BLOCK_MAGIC)?;

        let mut entries = Vec::with_capacity(frames.len());
        for frame in frames {
            let entry: LogEntry = bincode::deserialize(&frame.payload)?;
            let location = Location {
                offset: frame.offset,
                len: frame.len,
            };
            entries.push((location, entry));
        }

        let end = file.stream_position()?;
        let reader = File::open(path)?;

        Ok((
            Self {
                path: path.to_path_buf(),
                appender: Mutex::new(Appender { file, end }),
                reader: Mutex::new(reader),
                sync,
            },
            entries,
        ))
    }

    /// Append entries as one batch; durable on return when syncing is enabled
    ///
    /// A failed append is cut back off the log so later offsets stay exact.
    pub fn append(&self, entries: &[LogEntryRef<'_>]) -> Result<Vec<Location>> {
        let mut batch = BytesMut::new();
        let mut lens = Vec::with_capacity(entries.len());
        for entry in entries {
            if let LogEntryRef::Write { block, .. } = entry {
                block.validate()?;
            }
            let frame = encode_frame(&bincode::serialize(entry)?);
            lens.push(frame.len() as u32);
            batch.extend_from_slice(&frame);
        }

        let mut appender = self.appender.lock();
        let start = appender.end;
        match append_at(&mut appender.file, start, &batch, self.sync) {
            Ok(end) => appender.end = end,
            Err(e) => {
                tracing::error!(
                    "{}: append of {} bytes failed, rolled back to {}: {}",
                    self.path.display(),
                    batch.len(),
                    start,
                    e
                );
                return Err(e.into());
            }
        }

        let mut offset = start;
        Ok(lens
            .into_iter()
            .map(|len| {
                let location = Location { offset, len };
                offset += len as u64;
                location
            })
            .collect())
    }

    /// Read the block written at `location`, checking it belongs to `addr`
    pub fn read(&self, addr: BlockAddr, location: Location) -> Result<Block> {
        let mut frame = vec![0u8; location.len as usize];
        {
            let mut reader = self.reader.lock();
            reader.seek(SeekFrom::Start(location.offset))?;
            reader.read_exact(&mut frame)?;
        }

        let payload = decode_frame(&frame)?;
        match bincode::deserialize::<LogEntry>(payload)? {
            LogEntry::Write {
                addr: found, block, ..
            } if found == addr => {
                block.validate()?;
                Ok(block)
            }
            _ => Err(StrataError::Corruption(format!(
                "{}: offset {} does not hold block {}",
                self.path.display(),
                location.offset,
                addr
            ))),
        }
    }

    /// Force everything appended so far to disk
    pub fn sync(&self) -> Result<()> {
        self.appender.lock().file.sync_all()?;
        Ok(())
    }
}

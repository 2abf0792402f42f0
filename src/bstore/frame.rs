//! Framed append-only files
//!
//! Shared by the block log and the superblock journal. Every record is
//! `[len: u32][crc32: u32][payload]`, little endian. Opening a file replays
//! all intact frames and cuts off a torn or corrupt tail.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, StrataError};

/// Magic (4) + Version (2)
pub(crate) const FILE_HEADER_SIZE: u64 = 6;

/// Len (4) + CRC (4)
pub(crate) const FRAME_HEADER_SIZE: usize = 8;

/// Current on-disk format version
pub(crate) const FORMAT_VERSION: u16 = 1;

/// Upper bound on a single frame payload (64 MB)
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// A frame recovered during replay
pub(crate) struct RecoveredFrame {
    /// Offset of the frame header in the file
    pub offset: u64,
    /// Total frame size including header
    pub len: u32,
    pub payload: Vec<u8>,
}

/// Wrap a payload in a checksummed frame
pub(crate) fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(crc32fast::hash(payload));
    buf.put_slice(payload);
    buf.freeze()
}

/// Verify a complete frame and return its payload
pub(crate) fn decode_frame(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(StrataError::Corruption(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
    let payload = &frame[FRAME_HEADER_SIZE..];
    if payload.len() != len {
        return Err(StrataError::Corruption(format!(
            "frame length mismatch: header says {}, have {}",
            len,
            payload.len()
        )));
    }
    let actual = crc32fast::hash(payload);
    if actual != crc {
        return Err(StrataError::Corruption(format!(
            "frame checksum mismatch: expected {:08x}, got {:08x}",
            crc, actual
        )));
    }
    Ok(payload)
}

/// Append side of a framed file
pub(crate) trait FrameSink: Write + Seek {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync_data(&mut self) -> io::Result<()>;
}

impl FrameSink for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }
}

/// Write `bytes` at `end` and return the new end
///
/// A failed or partial write is cut back off and the cursor returned to
/// `end`, so the next append never lands behind a torn frame.
pub(crate) fn append_at<S: FrameSink>(
    sink: &mut S,
    end: u64,
    bytes: &[u8],
    sync: bool,
) -> io::Result<u64> {
    let written = sink.write_all(bytes).and_then(|()| {
        if sync {
            sink.sync_data()
        } else {
            Ok(())
        }
    });
    match written {
        Ok(()) => Ok(end + bytes.len() as u64),
        Err(e) => {
            sink.truncate(end)?;
            sink.seek(SeekFrom::Start(end))?;
            Err(e)
        }
    }
}

/// Open (or create) a framed file and replay it
///
/// Returns the file positioned at the end of the last intact frame, together
/// with every recovered frame in file order.
pub(crate) fn open_framed(path: &Path, magic: &[u8; 4]) -> Result<(File, Vec<RecoveredFrame>)> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let file_size = file.metadata()?.len();

    if file_size < FILE_HEADER_SIZE {
        // New (or never completed) file: start over with a fresh header
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(magic)?;
        file.write_all(&FORMAT_VERSION.to_le_bytes())?;
        file.sync_all()?;
        return Ok((file, Vec::new()));
    }

    let mut header = [0u8; FILE_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    if &header[0..4] != magic {
        return Err(StrataError::Corruption(format!(
            "{}: invalid magic {:?}",
            path.display(),
            &header[0..4]
        )));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(StrataError::Corruption(format!(
            "{}: unsupported format version {}",
            path.display(),
            version
        )));
    }

    let mut frames = Vec::new();
    let mut offset = FILE_HEADER_SIZE;
    {
        let mut reader = BufReader::new(&mut file);
        reader.seek(SeekFrom::Start(offset))?;
        while let Some(payload) = read_next_frame(&mut reader)? {
            let len = (FRAME_HEADER_SIZE + payload.len()) as u32;
            frames.push(RecoveredFrame {
                offset,
                len,
                payload,
            });
            offset += len as u64;
        }
    }

    if offset < file_size {
        tracing::warn!(
            "{}: truncating {} bytes of torn or corrupt tail at offset {}",
            path.display(),
            file_size - offset,
            offset
        );
        file.set_len(offset)?;
        file.sync_all()?;
    }
    file.seek(SeekFrom::Start(offset))?;

    Ok((file, frames))
}

/// Read one frame; `None` at a clean end of file or at the first bad frame
fn read_next_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len as usize];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if crc32fast::hash(&payload) != crc {
        return Ok(None);
    }
    Ok(Some(payload))
}

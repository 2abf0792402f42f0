//! Transaction Coalescer Module
//!
//! Batches concurrent inserts per stream into one tree commit.
//!
//! ## Buffer lifecycle
//! ```text
//!            insert                 timer / early trip / flush
//!  absent ──────────▶ open ─────────────────────────────────▶ expired
//!    ▲                 │ insert (append)                         │
//!    │                 ◀─┘                                       │
//!    └──────────────────── commit finished, entry removed ◀──────┘
//! ```
//!
//! The map lock guards only state transitions. Whoever moves a buffer from
//! open to expired owns its records and commits them with the lock released;
//! the expired entry is the per-stream "one writer" token. Callers that find
//! an expired entry wait on its signal and retry.

mod buffer;
mod timer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::bstore::{BlockStore, LATEST_GENERATION};
use crate::config::Config;
use crate::error::{Result, StrataError};
use crate::qtree::WriteTree;
use crate::record::{check_time, Record};

pub use buffer::PendingCommit;

use buffer::{CommitSignal, OpenBuffer, Slot};
use timer::CoalesceTimer;

/// Per-engine registry of open insert buffers
pub struct Coalescer {
    bs: Arc<BlockStore>,
    enabled: bool,
    early_trip: usize,
    buffers: Mutex<HashMap<Uuid, Slot>>,
    next_epoch: AtomicU64,
    timer: CoalesceTimer,
}

impl Coalescer {
    /// Create the coalescer and, when coalescing is enabled, its timer thread
    pub fn new(bs: Arc<BlockStore>, config: &Config) -> Result<Arc<Self>> {
        let (timer, deadlines) =
            CoalesceTimer::new(Duration::from_millis(config.transaction_coalesce_interval_ms));
        let coalescer = Arc::new(Self {
            bs,
            enabled: config.transaction_coalesce_enable,
            early_trip: config.transaction_coalesce_early_trip,
            buffers: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
            timer,
        });

        if coalescer.enabled {
            // Weak, so a pending deadline never keeps the engine alive
            let this = Arc::downgrade(&coalescer);
            timer::spawn(deadlines, move |stream, epoch| match this.upgrade() {
                Some(coalescer) => {
                    coalescer.on_timeout(stream, epoch);
                    true
                }
                None => false,
            })?;
        }
        Ok(coalescer)
    }

    // =========================================================================
    // Inserts
    // =========================================================================

    /// Buffer records for a later commit
    ///
    /// Commits synchronously when the buffer reaches the early-trip size, or
    /// immediately when coalescing is disabled; both return `None`. Otherwise
    /// returns the handle of the buffer now holding the records. Every time
    /// is validated before anything is buffered.
    pub fn insert_values(
        &self,
        stream: Uuid,
        records: &[Record],
    ) -> Result<Option<PendingCommit>> {
        for r in records {
            check_time(r.time)?;
        }
        if records.is_empty() {
            return Ok(None);
        }
        if !self.enabled {
            return self
                .with_stream_exclusive(stream, || self.commit_records(stream, records))
                .map(|_| None);
        }

        loop {
            let mut buffers = self.buffers.lock();
            match buffers.get_mut(&stream) {
                Some(Slot::Expired(signal)) => {
                    let signal = Arc::clone(signal);
                    drop(buffers);
                    // A failed predecessor does not stop this insert
                    let _ = signal.wait();
                }
                Some(Slot::Open(buf)) => {
                    buf.records.extend_from_slice(records);
                    if buf.records.len() < self.early_trip {
                        return Ok(Some(PendingCommit {
                            signal: Arc::clone(&buf.signal),
                        }));
                    }
                    let buf = expire(&mut buffers, stream)?;
                    drop(buffers);
                    tracing::debug!(
                        "Coalesce early trip on {}: {} records",
                        stream,
                        buf.records.len()
                    );
                    return self.commit_buffer(stream, buf).map(|_| None);
                }
                None if records.len() >= self.early_trip => {
                    drop(buffers);
                    tracing::debug!(
                        "Coalesce early trip on {}: {} records",
                        stream,
                        records.len()
                    );
                    return self
                        .with_stream_exclusive(stream, || self.commit_records(stream, records))
                        .map(|_| None);
                }
                None => {
                    let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                    let mut buf = OpenBuffer::new(epoch, self.timer.arm(stream, epoch)?);
                    buf.records.extend_from_slice(records);
                    let pending = PendingCommit {
                        signal: Arc::clone(&buf.signal),
                    };
                    buffers.insert(stream, Slot::Open(buf));
                    return Ok(Some(pending));
                }
            }
        }
    }

    /// Commit the buffer behind `pending` now and report how it went
    ///
    /// If another committer already claimed that buffer, waits for it
    /// instead; either way the outcome is that of the commit which carried
    /// the caller's records.
    pub fn commit_pending(&self, stream: Uuid, pending: PendingCommit) -> Result<()> {
        let mut buffers = self.buffers.lock();
        match buffers.get(&stream) {
            Some(Slot::Open(buf)) if Arc::ptr_eq(&buf.signal, &pending.signal) => {
                let buf = expire(&mut buffers, stream)?;
                drop(buffers);
                self.commit_buffer(stream, buf).map(|_| ())
            }
            _ => {
                drop(buffers);
                pending.signal.wait()
            }
        }
    }

    fn on_timeout(&self, stream: Uuid, epoch: u64) {
        let buf = {
            let mut buffers = self.buffers.lock();
            match buffers.get(&stream) {
                Some(Slot::Open(buf)) if buf.epoch == epoch => {}
                _ => return,
            }
            match expire(&mut buffers, stream) {
                Ok(buf) => buf,
                Err(_) => return,
            }
        };

        tracing::debug!(
            "Coalesce timeout on {}: {} records",
            stream,
            buf.records.len()
        );
        if let Err(e) = self.commit_buffer(stream, buf) {
            tracing::error!("Coalesced commit of {} failed: {}", stream, e);
        }
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Commit whatever is buffered for `stream` and wait for it
    ///
    /// Succeeds without committing when nothing is buffered but the stream
    /// already has a generation; fails with `NoSuchStream` when the stream
    /// has neither.
    pub fn flush(&self, stream: Uuid) -> Result<()> {
        let mut buffers = self.buffers.lock();
        match buffers.get(&stream) {
            Some(Slot::Expired(signal)) => {
                let signal = Arc::clone(signal);
                drop(buffers);
                signal.wait()
            }
            Some(Slot::Open(_)) => {
                let buf = expire(&mut buffers, stream)?;
                drop(buffers);
                self.commit_buffer(stream, buf).map(|_| ())
            }
            None => {
                drop(buffers);
                match self.bs.load_superblock(&stream, LATEST_GENERATION)? {
                    Some(_) => Ok(()),
                    None => Err(StrataError::NoSuchStream(stream)),
                }
            }
        }
    }

    /// Flush every stream with buffered records; returns the first failure
    pub fn flush_all(&self) -> Result<()> {
        let streams: Vec<Uuid> = self.buffers.lock().keys().copied().collect();
        let mut first_err = None;
        for stream in streams {
            match self.flush(stream) {
                Ok(()) => {}
                Err(StrataError::NoSuchStream(_)) => {}
                Err(e) => {
                    tracing::error!("Flush of {} failed: {}", stream, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Number of streams with an open or in-flight buffer
    pub fn buffered_streams(&self) -> usize {
        self.buffers.lock().len()
    }

    // =========================================================================
    // Exclusive access
    // =========================================================================

    /// Run `op` as the stream's only writer
    ///
    /// Any open buffer is committed first, so `op` observes every insert that
    /// preceded it. Inserts arriving meanwhile wait for `op` to finish.
    pub fn with_stream_exclusive<T>(
        &self,
        stream: Uuid,
        op: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let (signal, pending) = loop {
            let mut buffers = self.buffers.lock();
            match buffers.get(&stream) {
                Some(Slot::Expired(signal)) => {
                    let signal = Arc::clone(signal);
                    drop(buffers);
                    let _ = signal.wait();
                }
                Some(Slot::Open(_)) => {
                    let buf = expire(&mut buffers, stream)?;
                    break (buf.signal, buf.records);
                }
                None => {
                    let signal = Arc::new(CommitSignal::default());
                    buffers.insert(stream, Slot::Expired(Arc::clone(&signal)));
                    break (signal, Vec::new());
                }
            }
        };

        // Waiters on the signal care about the buffered records, not `op`
        let claim = Claim::new(self, stream, signal);
        if !pending.is_empty() {
            if let Err(e) = self.commit_records(stream, &pending) {
                claim.release(Err(&e));
                return Err(e);
            }
        }
        let result = op();
        claim.release(Ok(()));
        result
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn commit_buffer(&self, stream: Uuid, buf: OpenBuffer) -> Result<u64> {
        let OpenBuffer {
            records,
            timer,
            signal,
            ..
        } = buf;
        drop(timer);
        let claim = Claim::new(self, stream, signal);
        let result = self.commit_records(stream, &records);
        claim.release(result.as_ref().map(|_| ()));
        result
    }

    fn commit_records(&self, stream: Uuid, records: &[Record]) -> Result<u64> {
        let mut tree = WriteTree::open(Arc::clone(&self.bs), stream)?;
        tree.insert_values(records)?;
        tree.commit()
    }

    /// Drop the expired entry and wake everyone waiting on it
    fn release(
        &self,
        stream: Uuid,
        signal: &Arc<CommitSignal>,
        outcome: std::result::Result<(), &StrataError>,
    ) {
        {
            let mut buffers = self.buffers.lock();
            if matches!(buffers.get(&stream), Some(Slot::Expired(s)) if Arc::ptr_eq(s, signal)) {
                buffers.remove(&stream);
            }
        }
        signal.complete(outcome.map_err(|e| e.to_string()));
    }
}

/// Ownership of a stream's expired entry
///
/// Released explicitly with the commit outcome. If the commit unwinds
/// instead, dropping the claim still removes the entry and wakes waiters
/// with an error.
struct Claim<'a> {
    coalescer: &'a Coalescer,
    stream: Uuid,
    signal: Arc<CommitSignal>,
    released: bool,
}

impl<'a> Claim<'a> {
    fn new(coalescer: &'a Coalescer, stream: Uuid, signal: Arc<CommitSignal>) -> Self {
        Self {
            coalescer,
            stream,
            signal,
            released: false,
        }
    }

    fn release(mut self, outcome: std::result::Result<(), &StrataError>) {
        self.released = true;
        self.coalescer.release(self.stream, &self.signal, outcome);
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.released {
            tracing::error!("Commit of {} aborted without an outcome", self.stream);
            let err = StrataError::Internal(format!("commit of {} aborted", self.stream));
            self.coalescer.release(self.stream, &self.signal, Err(&err));
        }
    }
}

/// Move an open buffer to expired and hand its contents to the caller
fn expire(buffers: &mut HashMap<Uuid, Slot>, stream: Uuid) -> Result<OpenBuffer> {
    match buffers.remove(&stream) {
        Some(Slot::Open(buf)) => {
            buffers.insert(stream, Slot::Expired(Arc::clone(&buf.signal)));
            Ok(buf)
        }
        other => {
            if let Some(slot) = other {
                buffers.insert(stream, slot);
            }
            Err(StrataError::Internal(format!(
                "buffer for {} is not open",
                stream
            )))
        }
    }
}

//! Per-stream buffer states

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StrataError};
use crate::record::Record;

use super::timer::ArmedTimer;

/// State of one stream in the coalescer map; absence means no buffer
pub(super) enum Slot {
    /// Accepting records, deadline armed
    Open(OpenBuffer),
    /// Claimed by a committer; late arrivals wait on the signal and retry
    Expired(Arc<CommitSignal>),
}

pub(super) struct OpenBuffer {
    /// Distinguishes this buffer from later ones for the same stream, so a
    /// stale timer cannot commit a successor
    pub(super) epoch: u64,
    pub(super) records: Vec<Record>,
    /// Dropped when the buffer leaves the open state
    pub(super) timer: ArmedTimer,
    pub(super) signal: Arc<CommitSignal>,
}

impl OpenBuffer {
    pub(super) fn new(epoch: u64, timer: ArmedTimer) -> Self {
        Self {
            epoch,
            records: Vec::new(),
            timer,
            signal: Arc::new(CommitSignal::default()),
        }
    }
}

/// Handle on the buffer that took a caller's records
///
/// Returned by an insert that was buffered rather than committed inline;
/// [`Coalescer::commit_pending`] commits that buffer and reports its outcome.
///
/// [`Coalescer::commit_pending`]: super::Coalescer::commit_pending
pub struct PendingCommit {
    pub(super) signal: Arc<CommitSignal>,
}

/// One-shot completion notice for an in-flight commit
#[derive(Default)]
pub(super) struct CommitSignal {
    outcome: Mutex<Option<std::result::Result<(), String>>>,
    done: Condvar,
}

impl CommitSignal {
    pub(super) fn complete(&self, outcome: std::result::Result<(), String>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    /// Block until the commit finishes and report how it went
    pub(super) fn wait(&self) -> Result<()> {
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            self.done.wait(&mut outcome);
        }
        match outcome.as_ref() {
            Some(Err(msg)) => Err(StrataError::Storage(format!(
                "concurrent commit failed: {}",
                msg
            ))),
            _ => Ok(()),
        }
    }
}

//! Coalesce timer thread
//!
//! One thread per coalescer keeps a heap of buffer deadlines and fires them
//! in order. Each open buffer owns an [`ArmedTimer`]; dropping it when the
//! buffer leaves the open state cancels its deadline. The thread exits once
//! the coalescer drops its sender.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use uuid::Uuid;

use crate::error::{Result, StrataError};

/// When a stream's buffer of a given epoch is due
pub(super) struct Deadline {
    at: Instant,
    stream: Uuid,
    epoch: u64,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.epoch).cmp(&(other.at, other.epoch))
    }
}

/// Cancels its deadline when dropped
pub(super) struct ArmedTimer {
    cancelled: Arc<AtomicBool>,
}

impl Drop for ArmedTimer {
    fn drop(&mut self) {
        self.cancelled.store(true, atomic::Ordering::Release);
    }
}

/// Arming handle owned by the coalescer
pub(super) struct CoalesceTimer {
    deadlines: Sender<Deadline>,
    interval: Duration,
}

impl CoalesceTimer {
    pub(super) fn new(interval: Duration) -> (Self, Receiver<Deadline>) {
        let (deadlines, rx) = channel::unbounded();
        (
            Self {
                deadlines,
                interval,
            },
            rx,
        )
    }

    /// Schedule a firing for `(stream, epoch)` one interval from now
    pub(super) fn arm(&self, stream: Uuid, epoch: u64) -> Result<ArmedTimer> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.deadlines
            .send(Deadline {
                at: Instant::now() + self.interval,
                stream,
                epoch,
                cancelled: Arc::clone(&cancelled),
            })
            .map_err(|_| StrataError::Internal("coalesce timer thread has stopped".to_string()))?;
        Ok(ArmedTimer { cancelled })
    }
}

/// Start the timer thread
///
/// `on_fire` runs on the timer thread for every due deadline; returning
/// `false` stops the thread.
pub(super) fn spawn<F>(deadlines: Receiver<Deadline>, on_fire: F) -> Result<()>
where
    F: FnMut(Uuid, u64) -> bool + Send + 'static,
{
    thread::Builder::new()
        .name("strata-coalesce-timer".to_string())
        .spawn(move || run(deadlines, on_fire))
        .map_err(|e| StrataError::Internal(format!("failed to spawn coalesce timer: {}", e)))?;
    Ok(())
}

fn run<F>(deadlines: Receiver<Deadline>, mut on_fire: F)
where
    F: FnMut(Uuid, u64) -> bool,
{
    let mut pending: BinaryHeap<Reverse<Deadline>> = BinaryHeap::new();
    loop {
        let next = match pending.peek() {
            Some(Reverse(due)) => deadlines.recv_deadline(due.at),
            None => deadlines
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(deadline) => pending.push(Reverse(deadline)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        while matches!(pending.peek(), Some(Reverse(due)) if due.at <= now) {
            if let Some(Reverse(due)) = pending.pop() {
                if due.cancelled.load(atomic::Ordering::Acquire) {
                    continue;
                }
                if !on_fire(due.stream, due.epoch) {
                    return;
                }
            }
        }
    }
}

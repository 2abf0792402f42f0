//! Record types shared by every layer
//!
//! Raw readings, statistical summaries and the bounded time domain.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

// =============================================================================
// Time Domain
// =============================================================================

/// Earliest storable timestamp (inclusive)
pub const MINIMUM_TIME: i64 = -(16 << 56);

/// Latest storable timestamp (inclusive)
pub const MAXIMUM_TIME: i64 = (48 << 56) - 1;

/// Point width of the root node: it spans `[MINIMUM_TIME, MAXIMUM_TIME]` exactly
pub const ROOT_PW: u8 = 62;

/// Largest point width accepted by statistical queries
pub const MAX_POINT_WIDTH: u8 = ROOT_PW;

/// Check that a timestamp lies in the storable domain
pub fn check_time(time: i64) -> Result<()> {
    if !(MINIMUM_TIME..=MAXIMUM_TIME).contains(&time) {
        return Err(StrataError::InvalidArgument(format!(
            "time {} outside [{}, {}]",
            time, MINIMUM_TIME, MAXIMUM_TIME
        )));
    }
    Ok(())
}

/// Check that a statistical point width is supported
pub fn check_point_width(pw: u8) -> Result<()> {
    if pw > MAX_POINT_WIDTH {
        return Err(StrataError::InvalidArgument(format!(
            "point width {} exceeds maximum {}",
            pw, MAX_POINT_WIDTH
        )));
    }
    Ok(())
}

// =============================================================================
// Records
// =============================================================================

/// A single reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub time: i64,
    pub value: f64,
}

impl Record {
    pub fn new(time: i64, value: f64) -> Self {
        Self { time, value }
    }
}

/// One bucket of a statistical query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatRecord {
    /// Bucket start (aligned to the query point width)
    pub time: i64,
    pub count: u64,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

/// A half-open `[start, end)` time range reported by a version diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedRange {
    pub start: i64,
    pub end: i64,
}

// =============================================================================
// Summaries
// =============================================================================

/// Precomputed statistics over a subtree, stored alongside every child pointer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: u64,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

impl Summary {
    /// Summarize a non-empty run of records; `None` when empty
    pub fn of_records(records: &[Record]) -> Option<Self> {
        let first = records.first()?;
        let mut acc = Accumulator::new(first.time);
        for r in records {
            acc.add_value(r.value);
        }
        acc.finish().map(|s| Summary {
            count: s.count,
            min: s.min,
            mean: s.mean,
            max: s.max,
        })
    }

    /// Combine child summaries; `None` when all are absent
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a Summary>) -> Option<Self> {
        let mut acc = Accumulator::new(0);
        for s in parts {
            acc.add_summary(s);
        }
        acc.finish().map(|s| Summary {
            count: s.count,
            min: s.min,
            mean: s.mean,
            max: s.max,
        })
    }
}

/// Running count/min/sum/max for one output bucket
#[derive(Debug, Clone, Copy)]
pub(crate) struct Accumulator {
    pub(crate) time: i64,
    count: u64,
    min: f64,
    sum: f64,
    max: f64,
}

impl Accumulator {
    pub(crate) fn new(time: i64) -> Self {
        Self {
            time,
            count: 0,
            min: f64::INFINITY,
            sum: 0.0,
            max: f64::NEG_INFINITY,
        }
    }

    pub(crate) fn add_value(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub(crate) fn add_summary(&mut self, s: &Summary) {
        if s.count == 0 {
            return;
        }
        self.count += s.count;
        self.sum += s.mean * s.count as f64;
        self.min = self.min.min(s.min);
        self.max = self.max.max(s.max);
    }

    pub(crate) fn finish(&self) -> Option<StatRecord> {
        if self.count == 0 {
            return None;
        }
        Some(StatRecord {
            time: self.time,
            count: self.count,
            min: self.min,
            mean: self.sum / self.count as f64,
            max: self.max,
        })
    }
}

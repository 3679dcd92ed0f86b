use std::sync::Mutex;

use serde::Serialize;
use tracing::trace;

use crate::error::{PipelineError, Result};
use crate::offsets::interval::{Insertion, IntervalSet, OffsetInterval};

/// Point-in-time view of a tracker, used by the observability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub begin: i64,
    pub current: i64,
    pub intervals: Vec<OffsetInterval>,
}

struct TrackerState {
    /// Highest offset such that everything in [begin, current] is
    /// acknowledged. Starts at begin - 1 and never decreases.
    current: i64,
    /// Acknowledged offsets strictly above `current`, disjoint and
    /// non-adjacent.
    pending: IntervalSet,
}

/// Per-partition acknowledgment tracker.
///
/// Accepts out-of-order acknowledgments and exposes the largest contiguous
/// prefix that is safe to commit. All mutation goes through one mutex; the
/// begin offset is immutable for the life of the assignment and read
/// lock-free.
pub struct OffsetTracker {
    begin: i64,
    state: Mutex<TrackerState>,
}

impl OffsetTracker {
    /// `start_offset` is the first offset this assignment will read.
    pub fn new(start_offset: i64) -> Self {
        Self {
            begin: start_offset,
            state: Mutex::new(TrackerState {
                current: start_offset - 1,
                pending: IntervalSet::new(),
            }),
        }
    }

    pub fn begin_offset(&self) -> i64 {
        self.begin
    }

    pub fn current_offset(&self) -> i64 {
        self.state.lock().unwrap().current
    }

    /// Record that `offset` has been processed.
    ///
    /// Returns the newly committable interval when the acknowledgment extends
    /// the contiguous prefix, `None` otherwise. Re-acknowledging an already
    /// covered offset is a no-op; acknowledging below the begin offset is
    /// rejected.
    pub fn acknowledge(&self, offset: i64) -> Result<Option<OffsetInterval>> {
        if offset < self.begin {
            return Err(PipelineError::InvalidArgument(format!(
                "offset {offset} is below the begin offset {}",
                self.begin
            )));
        }

        let mut state = self.state.lock().unwrap();
        if offset <= state.current {
            return Ok(None);
        }

        match state.pending.insert(offset) {
            Insertion::AlreadyCovered => Ok(None),
            Insertion::Inserted(merged) => {
                if merged.first == state.current + 1 {
                    // The merged range extends the contiguous prefix; absorb
                    // the whole thing.
                    state.pending.remove(&merged);
                    state.current = merged.last;
                    trace!(
                        offset,
                        current = state.current,
                        "acknowledgment advanced the committable prefix"
                    );
                    Ok(Some(merged))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Absorb the lowest pending interval, jumping the prefix over the gap
    /// below it. Used by forced flushes; returns the absorbed interval.
    pub fn absorb_first_pending(&self) -> Option<OffsetInterval> {
        let mut state = self.state.lock().unwrap();
        let first = state.pending.pop_first()?;
        state.current = first.last;
        Some(first)
    }

    /// Bounds of the acknowledged-but-not-committable region: the first and
    /// last pending offsets, if any.
    pub fn pending_margins(&self) -> Option<(i64, i64)> {
        let state = self.state.lock().unwrap();
        match (state.pending.first(), state.pending.last()) {
            (Some(first), Some(last)) => Some((first.first, last.last)),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.state.lock().unwrap();
        TrackerSnapshot {
            begin: self.begin,
            current: state.current,
            intervals: state.pending.iter().collect(),
        }
    }
}

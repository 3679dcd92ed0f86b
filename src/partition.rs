use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Where a partition is in its assignment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentPhase {
    Unassigned,
    Assigned,
    Paused,
    Revoking,
}

impl AssignmentPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AssignmentPhase::Assigned,
            2 => AssignmentPhase::Paused,
            3 => AssignmentPhase::Revoking,
            _ => AssignmentPhase::Unassigned,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            AssignmentPhase::Unassigned => 0,
            AssignmentPhase::Assigned => 1,
            AssignmentPhase::Paused => 2,
            AssignmentPhase::Revoking => 3,
        }
    }
}

/// Per-partition runtime flags. All fields are atomic; no lock is needed for
/// pause/resume or EOF checks on the hot path.
pub struct PartitionState {
    phase: AtomicU8,
    eof_seen: AtomicBool,
    auto_reset_at_end: bool,
}

impl PartitionState {
    pub fn new(paused: bool, auto_reset_at_end: bool) -> Self {
        let phase = if paused {
            AssignmentPhase::Paused
        } else {
            AssignmentPhase::Assigned
        };
        Self {
            phase: AtomicU8::new(phase.as_u8()),
            eof_seen: AtomicBool::new(false),
            auto_reset_at_end,
        }
    }

    pub fn phase(&self) -> AssignmentPhase {
        AssignmentPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn set_phase(&self, phase: AssignmentPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    /// Messages are only dispatched for partitions in the `Assigned` phase.
    pub fn accepts_messages(&self) -> bool {
        self.phase() == AssignmentPhase::Assigned
    }

    pub fn is_paused(&self) -> bool {
        self.phase() == AssignmentPhase::Paused
    }

    /// Record that the high watermark was reached; returns true on the first
    /// sighting in this assignment.
    pub fn mark_eof(&self) -> bool {
        !self.eof_seen.swap(true, Ordering::SeqCst)
    }

    pub fn eof_seen(&self) -> bool {
        self.eof_seen.load(Ordering::SeqCst)
    }

    pub fn auto_reset_at_end(&self) -> bool {
        self.auto_reset_at_end
    }
}

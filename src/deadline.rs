//! Timeout policy and resolved deadlines.
//!
//! A [`Timeout`] expresses how long a caller is willing to wait for the
//! lock. At acquisition time it resolves to a [`Deadline`], the concrete
//! point on the monotonic clock shared by both the blocking and the async
//! path.

use std::time::{Duration, Instant};

/// How long an acquisition call may wait for the lock.
///
/// `Immediate` is exactly the uncontended fast path: the call never
/// enqueues a waiter. `After(Duration::ZERO)` is normalized to
/// `Immediate` at resolution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail immediately unless the lock is free right now.
    Immediate,
    /// Wait indefinitely.
    Never,
    /// Wait for at most the given duration.
    After(Duration),
}

impl Timeout {
    /// Resolves this timeout against the current instant.
    pub(crate) fn deadline(self) -> Deadline {
        match self {
            Self::Immediate => Deadline::Immediate,
            Self::Never => Deadline::Never,
            Self::After(d) if d.is_zero() => Deadline::Immediate,
            // Saturate to "wait forever" if the deadline is not representable.
            Self::After(d) => Instant::now()
                .checked_add(d)
                .map_or(Deadline::Never, Deadline::At),
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::Never
    }
}

/// A resolved deadline on the monotonic clock.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Deadline {
    Immediate,
    Never,
    At(Instant),
}

impl Deadline {
    /// Time left before expiry: `None` means "wait forever", a zero
    /// duration means the deadline has already passed.
    pub(crate) fn remaining(self) -> Option<Duration> {
        match self {
            Self::Immediate => Some(Duration::ZERO),
            Self::Never => None,
            Self::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }
}

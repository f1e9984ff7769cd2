//! Cross-cutting identifier types for the LoamDB MVCC subsystem.
//!
//! This crate defines the small copyable types the rest of the engine
//! passes around: logical timestamps, intra-transaction steps, packed
//! version handles, read snapshots, and the two contract enums the
//! transaction index answers with ([`CommitStatus`] and [`WwProbe`]).

use std::fmt;

/// Number of low bits of a [`VersionHandle`] that carry the step counter.
pub const STEP_BITS: u32 = 8;

/// Logical timestamp dispensed by the engine's timestamp allocator.
///
/// Domain: `0..=MAX_RAW`. Zero is reserved for primordial versions and is
/// never dispensed; the allocator starts at 1. [`Timestamp::MAX`] is never
/// dispensed either — it doubles as the "latest committed state" observer
/// in a [`Snapshot`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Maximum raw value a timestamp can carry and still pack into a
    /// [`VersionHandle`] alongside the step bits.
    pub const MAX_RAW: u64 = (1_u64 << (64 - STEP_BITS)) - 1;

    /// The primordial timestamp: predates every transaction.
    pub const PRIMORDIAL: Self = Self(0);

    /// The unreachable upper bound of the timestamp domain.
    pub const MAX: Self = Self(Self::MAX_RAW);

    /// Construct a timestamp if `raw` is in-domain.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        if raw > Self::MAX_RAW {
            return None;
        }
        Some(Self(raw))
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Return the next timestamp if it stays in-domain.
    #[inline]
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        Self::new(self.0.wrapping_add(1))
    }

    /// Whether this is the primordial timestamp.
    #[inline]
    #[must_use]
    pub const fn is_primordial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts#{}", self.0)
    }
}

/// Step counter within a transaction.
///
/// Statements within one transaction bump the step so later statements can
/// observe versions written by earlier ones. The counter occupies the low
/// [`STEP_BITS`] bits of a [`VersionHandle`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Step(u8);

impl Step {
    /// Step 0: the state of a transaction before any statement ran.
    pub const ZERO: Self = Self(0);

    /// The largest step a transaction may reach.
    pub const MAX: Self = Self(u8::MAX);

    /// Construct a step from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Return the next step if the counter has room.
    #[inline]
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step#{}", self.0)
    }
}

/// Packed (timestamp, step) identity of one version in a chain.
///
/// The packing preserves ordering: comparing handles compares first by
/// start timestamp, then by step. The all-zero handle is the primordial
/// handle, carried only by a version that predates all live transactions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct VersionHandle(u64);

impl VersionHandle {
    /// Handle of a primordial, universally visible version.
    pub const PRIMORDIAL: Self = Self(0);

    /// Pack a timestamp and step into a handle.
    #[inline]
    #[must_use]
    pub const fn pack(ts: Timestamp, step: Step) -> Self {
        Self(ts.get() << STEP_BITS | step.get() as u64)
    }

    /// Pack a timestamp with step 0.
    #[inline]
    #[must_use]
    pub const fn from_ts(ts: Timestamp) -> Self {
        Self::pack(ts, Step::ZERO)
    }

    /// The start timestamp of the transaction that created this version.
    #[inline]
    #[must_use]
    pub const fn ts(self) -> Timestamp {
        Timestamp(self.0 >> STEP_BITS)
    }

    /// The step at which the version was created.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn step(self) -> Step {
        Step((self.0 & ((1 << STEP_BITS) - 1)) as u8)
    }

    /// Get the raw packed value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the primordial handle.
    #[inline]
    #[must_use]
    pub const fn is_primordial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for VersionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_primordial() {
            f.write_str("vh#primordial")
        } else {
            write!(f, "vh#{}.{}", self.ts().get(), self.step().get())
        }
    }
}

/// The `(ts, step)` pair a read observes by.
///
/// An active transaction reads at `(start timestamp, current step)`. A
/// caller outside any transaction reads at [`Snapshot::latest`], which
/// sees every committed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub ts: Timestamp,
    pub step: Step,
}

impl Snapshot {
    /// Snapshot of a transaction at the given start timestamp and step.
    #[inline]
    #[must_use]
    pub const fn new(ts: Timestamp, step: Step) -> Self {
        Self { ts, step }
    }

    /// The "latest committed state" observer: sees every committed
    /// version and nothing uncommitted.
    #[inline]
    #[must_use]
    pub const fn latest() -> Self {
        Self {
            ts: Timestamp::MAX,
            step: Step::ZERO,
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snap({}, {})", self.ts, self.step)
    }
}

/// Effective commit status of a version, filtered for a snapshot observer.
///
/// Answered by the transaction index's `commit_status`. Each reserved
/// sentinel timestamp is its own variant, so the sentinel spaces cannot
/// collide by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// The version predates all live transactions and is universally
    /// visible.
    Primordial,
    /// The creating transaction committed at the carried timestamp, and
    /// that commit is visible to the observing snapshot.
    Committed(Timestamp),
    /// The creating transaction is still in flight, or committed too late
    /// for the observing snapshot to see.
    Uncommitted,
    /// The creating transaction rolled back.
    Aborted,
}

impl CommitStatus {
    /// Whether a version with this status is observable by the snapshot
    /// the status was computed for.
    #[inline]
    #[must_use]
    pub const fn is_visible(self) -> bool {
        matches!(self, Self::Primordial | Self::Committed(_))
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primordial => f.write_str("primordial"),
            Self::Committed(tc) => write!(f, "committed@{}", tc.get()),
            Self::Uncommitted => f.write_str("uncommitted"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Outcome of a write-write dependency probe.
///
/// Answered by the transaction index's `ww_dependency` when a writer asks
/// whether a chain entry stands in its way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WwProbe {
    /// No dependency: the entry's creator is the waiter itself, aborted
    /// long ago, or committed before the waiter started.
    Clear,
    /// The creator is active and has not begun committing.
    Uncommitted,
    /// The creator committed at the carried timestamp after the waiter
    /// started.
    Committed(Timestamp),
    /// The creator aborted.
    Aborted,
    /// The creator's outcome could not be decided within the wait budget.
    TimedOut,
}

impl WwProbe {
    /// Whether this outcome lets the probing writer proceed.
    #[inline]
    #[must_use]
    pub const fn is_clear(self) -> bool {
        matches!(self, Self::Clear | Self::Aborted)
    }
}

impl fmt::Display for WwProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clear => f.write_str("clear"),
            Self::Uncommitted => f.write_str("uncommitted"),
            Self::Committed(tc) => write!(f, "committed@{}", tc.get()),
            Self::Aborted => f.write_str("aborted"),
            Self::TimedOut => f.write_str("timed-out"),
        }
    }
}

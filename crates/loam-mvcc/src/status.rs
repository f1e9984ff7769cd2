//! Per-transaction status records.
//!
//! A [`TxnStatus`] holds everything other transactions need to know about
//! one transaction: its start timestamp, its step counter, its commit
//! state, and the wait primitive a write-write dependent blocks on. The
//! record also carries the count of chain entries the transaction created,
//! so the index can retire an aborted record once its last version has
//! been pruned from every chain.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use loam_error::{LoamError, Result};
use loam_types::{Snapshot, Step, Timestamp, VersionHandle};

/// How long a blocked ww-dependency wait sleeps between checks of the
/// waiter's interrupt flag.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Lifecycle state of a transaction.
///
/// `Committing` is the window in which a commit timestamp has been
/// proposed but the outcome is not yet decided; dependents that need the
/// final outcome block on the status until the state leaves this window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Running; no commit decision yet.
    Active,
    /// A commit timestamp is proposed; outcome undecided.
    Committing(Timestamp),
    /// Committed at the carried timestamp.
    Committed(Timestamp),
    /// Rolled back.
    Aborted,
}

impl TxnState {
    /// Whether the transaction may still produce or retract versions.
    #[inline]
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Committing(_))
    }
}

/// Status record for one transaction.
pub struct TxnStatus {
    ts: Timestamp,
    step: AtomicU8,
    state: Mutex<TxnState>,
    /// Notified when the state leaves `Active`/`Committing`.
    resolved: Condvar,
    /// Chain entries created by this transaction that are still linked.
    version_count: AtomicU64,
    /// Start timestamp of the transaction this one is ww-waiting on
    /// (0 = none). Used to refuse waits that would close a cycle.
    ww_depends_on: AtomicU64,
    /// Cooperative interruption of this transaction's blocking waits.
    interrupted: AtomicBool,
}

impl TxnStatus {
    /// Create an active status with the given start timestamp.
    #[must_use]
    pub fn new(ts: Timestamp) -> Self {
        Self {
            ts,
            step: AtomicU8::new(Step::ZERO.get()),
            state: Mutex::new(TxnState::Active),
            resolved: Condvar::new(),
            version_count: AtomicU64::new(0),
            ww_depends_on: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Start timestamp; unique per transaction.
    #[inline]
    #[must_use]
    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    /// Current step counter.
    #[must_use]
    pub fn step(&self) -> Step {
        Step::new(self.step.load(Ordering::Acquire))
    }

    /// Advance the step counter, returning the new step.
    pub fn increment_step(&self) -> Result<Step> {
        let raw = self
            .step
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Step::new(raw).checked_next().map(Step::get)
            })
            .map_err(|_| LoamError::invalid_argument("transaction step counter exhausted"))?;
        Ok(Step::new(raw + 1))
    }

    /// The snapshot this transaction currently reads at.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.ts, self.step())
    }

    /// The handle a version created by this transaction right now carries.
    #[must_use]
    pub fn version_handle(&self) -> VersionHandle {
        VersionHandle::pack(self.ts, self.step())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    /// Whether the transaction may still produce or retract versions.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Enter the committing window with the proposed commit timestamp.
    pub fn begin_commit(&self, tc: Timestamp) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            TxnState::Active => {
                *state = TxnState::Committing(tc);
                Ok(())
            }
            other => Err(LoamError::invalid_argument(format!(
                "cannot begin commit of {} in state {other:?}",
                self.ts
            ))),
        }
    }

    /// Finalize the proposed commit and wake every ww-dependent.
    pub fn finish_commit(&self) -> Result<Timestamp> {
        let mut state = self.state.lock();
        match *state {
            TxnState::Committing(tc) => {
                *state = TxnState::Committed(tc);
                drop(state);
                self.resolved.notify_all();
                Ok(tc)
            }
            other => Err(LoamError::invalid_argument(format!(
                "cannot finish commit of {} in state {other:?}",
                self.ts
            ))),
        }
    }

    /// Abort the transaction and wake every ww-dependent.
    ///
    /// Aborting an already-aborted transaction is a no-op.
    pub fn abort(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            TxnState::Active | TxnState::Committing(_) => {
                *state = TxnState::Aborted;
                drop(state);
                self.resolved.notify_all();
                Ok(())
            }
            TxnState::Aborted => Ok(()),
            TxnState::Committed(tc) => Err(LoamError::invalid_argument(format!(
                "cannot abort {}: already committed at {tc}",
                self.ts
            ))),
        }
    }

    /// Block until this transaction's outcome is decided, up to `budget`.
    ///
    /// Returns the state observed last: a final state when the outcome was
    /// decided in time, otherwise whatever undecided state the deadline
    /// expired on. Observes `waiter`'s interrupt flag between slices.
    pub(crate) fn await_outcome(&self, budget: Duration, waiter: &TxnStatus) -> Result<TxnState> {
        let deadline = Instant::now() + budget;
        let mut state = self.state.lock();
        loop {
            match *state {
                TxnState::Committed(_) | TxnState::Aborted => return Ok(*state),
                TxnState::Active | TxnState::Committing(_) => {
                    if waiter.clear_interrupt() {
                        return Err(LoamError::Interrupted);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(*state);
                    }
                    let slice = WAIT_SLICE.min(deadline.saturating_duration_since(now));
                    let _ = self.resolved.wait_for(&mut state, slice);
                }
            }
        }
    }

    /// Note a chain entry created by this transaction.
    pub fn retain_version(&self) {
        self.version_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Note a chain entry unlinked; returns the remaining count.
    pub fn release_version(&self) -> u64 {
        let previous = self
            .version_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        match previous {
            Ok(count) => count - 1,
            Err(_) => 0,
        }
    }

    /// Linked chain entries created by this transaction.
    #[must_use]
    pub fn version_count(&self) -> u64 {
        self.version_count.load(Ordering::Acquire)
    }

    /// Request interruption of this transaction's blocking waits.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Consume a pending interrupt request.
    pub(crate) fn clear_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Publish or clear the ww-depends-on edge.
    pub(crate) fn set_ww_depends_on(&self, on: Option<Timestamp>) {
        let raw = on.map_or(0, Timestamp::get);
        self.ww_depends_on.store(raw, Ordering::Release);
    }

    /// The transaction this one is currently ww-waiting on, if any.
    #[must_use]
    pub fn ww_depends_on(&self) -> Option<Timestamp> {
        match self.ww_depends_on.load(Ordering::Acquire) {
            0 => None,
            raw => Timestamp::new(raw),
        }
    }
}

impl std::fmt::Debug for TxnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnStatus")
            .field("ts", &self.ts)
            .field("step", &self.step())
            .field("state", &self.state())
            .field("version_count", &self.version_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn ts(raw: u64) -> Timestamp {
        Timestamp::new(raw).expect("in-domain timestamp")
    }

    #[test]
    fn commit_walks_through_the_committing_window() {
        let status = TxnStatus::new(ts(10));
        assert_eq!(status.state(), TxnState::Active);
        status.begin_commit(ts(11)).unwrap();
        assert_eq!(status.state(), TxnState::Committing(ts(11)));
        assert!(status.is_live());
        assert_eq!(status.finish_commit().unwrap(), ts(11));
        assert_eq!(status.state(), TxnState::Committed(ts(11)));
        assert!(!status.is_live());
    }

    #[test]
    fn abort_is_final_and_idempotent() {
        let status = TxnStatus::new(ts(10));
        status.abort().unwrap();
        status.abort().unwrap();
        assert_eq!(status.state(), TxnState::Aborted);
        assert!(status.begin_commit(ts(11)).is_err());
    }

    #[test]
    fn committed_transaction_cannot_abort() {
        let status = TxnStatus::new(ts(10));
        status.begin_commit(ts(11)).unwrap();
        status.finish_commit().unwrap();
        assert!(status.abort().is_err());
    }

    #[test]
    fn step_increments_update_snapshot_and_handle() {
        let status = TxnStatus::new(ts(7));
        assert_eq!(status.snapshot(), Snapshot::new(ts(7), Step::ZERO));
        let step = status.increment_step().unwrap();
        assert_eq!(step, Step::new(1));
        assert_eq!(status.version_handle(), VersionHandle::pack(ts(7), step));
    }

    #[test]
    fn step_counter_is_bounded() {
        let status = TxnStatus::new(ts(7));
        for _ in 0..u8::MAX {
            status.increment_step().unwrap();
        }
        assert!(status.increment_step().is_err());
    }

    #[test]
    fn version_count_saturates_at_zero() {
        let status = TxnStatus::new(ts(3));
        status.retain_version();
        assert_eq!(status.release_version(), 0);
        assert_eq!(status.release_version(), 0);
        assert_eq!(status.version_count(), 0);
    }

    #[test]
    fn await_outcome_observes_a_finishing_commit() {
        let creator = Arc::new(TxnStatus::new(ts(10)));
        let waiter = TxnStatus::new(ts(12));
        creator.begin_commit(ts(13)).unwrap();

        let handle = {
            let creator = Arc::clone(&creator);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                creator.finish_commit().unwrap();
            })
        };

        let state = creator
            .await_outcome(Duration::from_secs(5), &waiter)
            .unwrap();
        assert_eq!(state, TxnState::Committed(ts(13)));
        handle.join().unwrap();
    }

    #[test]
    fn await_outcome_times_out_on_an_undecided_commit() {
        let creator = TxnStatus::new(ts(10));
        let waiter = TxnStatus::new(ts(12));
        creator.begin_commit(ts(13)).unwrap();
        let state = creator
            .await_outcome(Duration::from_millis(40), &waiter)
            .unwrap();
        assert_eq!(state, TxnState::Committing(ts(13)));
    }

    #[test]
    fn await_outcome_honors_the_waiter_interrupt() {
        let creator = TxnStatus::new(ts(10));
        let waiter = TxnStatus::new(ts(12));
        creator.begin_commit(ts(13)).unwrap();
        waiter.interrupt();
        let err = creator
            .await_outcome(Duration::from_secs(5), &waiter)
            .unwrap_err();
        assert!(matches!(err, LoamError::Interrupted));
        // the interrupt request was consumed
        assert!(!waiter.clear_interrupt());
    }
}

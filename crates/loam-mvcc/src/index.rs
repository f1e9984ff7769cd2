//! Process-wide transaction index.
//!
//! Maps a version handle's start timestamp to the creating transaction's
//! status record and answers the three questions the version chains ask:
//! what a snapshot observer should treat a version's commit status as
//! ([`TransactionIndex::commit_status`]), whether a writer may overwrite a
//! version ([`TransactionIndex::ww_dependency`]), and whether any live
//! transaction could still observe an interval of commit timestamps
//! ([`TransactionIndex::has_concurrent`]).
//!
//! Status records of committed transactions are retired by the
//! journal/commit-floor manager through [`TransactionIndex::evict_resolved`];
//! aborted records retire themselves once their last version is unlinked.
//! A version whose creator is unknown to the index is therefore one that
//! resolved long ago (or an auto-commit version that never had a record)
//! and is treated as committed at its own start timestamp.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use loam_error::Result;
use loam_types::{CommitStatus, Snapshot, Timestamp, VersionHandle, WwProbe};

use crate::status::{TxnState, TxnStatus};

/// Upper bound on the ww-depends-on walk; a longer chain of waiters is
/// treated as a cycle.
const MAX_WW_EDGE_HOPS: usize = 64;

/// Registry of transaction status records, keyed by start timestamp.
#[derive(Debug, Default)]
pub struct TransactionIndex {
    statuses: RwLock<BTreeMap<Timestamp, Arc<TxnStatus>>>,
}

impl TransactionIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly begun transaction.
    pub fn register(&self, status: Arc<TxnStatus>) {
        let previous = self.statuses.write().insert(status.ts(), status);
        debug_assert!(
            previous.is_none(),
            "start timestamps are unique per transaction"
        );
    }

    /// Look up the status record for a start timestamp.
    #[must_use]
    pub fn get(&self, ts: Timestamp) -> Option<Arc<TxnStatus>> {
        self.statuses.read().get(&ts).cloned()
    }

    /// Number of registered records whose transaction is still live.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.statuses
            .read()
            .values()
            .filter(|status| status.is_live())
            .count()
    }

    /// Effective commit status of the version `vh`, filtered for the
    /// snapshot observer `snap`.
    ///
    /// A version authored by the observer itself is visible once its step
    /// is at or below the observer's current step, regardless of the
    /// observer's own commit state. A commit that happened after the
    /// observer's start timestamp reports as uncommitted: the observer
    /// cannot see it.
    #[must_use]
    pub fn commit_status(&self, vh: VersionHandle, snap: Snapshot) -> CommitStatus {
        if vh.is_primordial() {
            return CommitStatus::Primordial;
        }
        let ts = vh.ts();
        if ts == snap.ts {
            return if vh.step() <= snap.step {
                CommitStatus::Committed(ts)
            } else {
                CommitStatus::Uncommitted
            };
        }
        match self.get(ts).map(|status| status.state()) {
            None => {
                if ts <= snap.ts {
                    CommitStatus::Committed(ts)
                } else {
                    CommitStatus::Uncommitted
                }
            }
            Some(TxnState::Active | TxnState::Committing(_)) => CommitStatus::Uncommitted,
            Some(TxnState::Aborted) => CommitStatus::Aborted,
            Some(TxnState::Committed(tc)) => {
                if tc <= snap.ts {
                    CommitStatus::Committed(tc)
                } else {
                    CommitStatus::Uncommitted
                }
            }
        }
    }

    /// Probe whether the version `vh` stands in the way of `waiter`
    /// publishing a new version on the same chain.
    ///
    /// With a zero budget the probe never blocks: an idle active creator
    /// reports as [`WwProbe::Uncommitted`] and one inside its committing
    /// window as [`WwProbe::TimedOut`] (the outcome cannot be decided
    /// without waiting). With a non-zero budget the probe blocks on the
    /// creator's wait primitive for the final outcome, refusing waits that
    /// would close a ww-dependency cycle.
    pub fn ww_dependency(
        &self,
        vh: VersionHandle,
        waiter: &TxnStatus,
        budget: Duration,
    ) -> Result<WwProbe> {
        if vh.is_primordial() {
            return Ok(WwProbe::Clear);
        }
        let ts = vh.ts();
        if ts == waiter.ts() {
            return Ok(WwProbe::Clear);
        }
        let Some(creator) = self.get(ts) else {
            return Ok(WwProbe::Clear);
        };
        match creator.state() {
            TxnState::Committed(tc) => Ok(Self::classify_commit(tc, waiter)),
            TxnState::Aborted => Ok(WwProbe::Aborted),
            TxnState::Active => Ok(WwProbe::Uncommitted),
            TxnState::Committing(_) => {
                if budget.is_zero() {
                    return Ok(WwProbe::TimedOut);
                }
                waiter.set_ww_depends_on(Some(ts));
                if self.would_deadlock(ts, waiter.ts()) {
                    waiter.set_ww_depends_on(None);
                    tracing::debug!(
                        waiter = %waiter.ts(),
                        creator = %ts,
                        "refusing ww-dependency wait that would close a cycle"
                    );
                    return Ok(WwProbe::Uncommitted);
                }
                let outcome = creator.await_outcome(budget, waiter);
                waiter.set_ww_depends_on(None);
                match outcome? {
                    TxnState::Committed(tc) => Ok(Self::classify_commit(tc, waiter)),
                    TxnState::Aborted => Ok(WwProbe::Aborted),
                    TxnState::Active | TxnState::Committing(_) => Ok(WwProbe::TimedOut),
                }
            }
        }
    }

    /// Whether any live transaction's snapshot falls in `[from, upto)`
    /// (`upto = None` meaning unbounded).
    ///
    /// Pruning keeps an older committed version exactly as long as this
    /// holds for the interval between its commit and the next newer one.
    #[must_use]
    pub fn has_concurrent(&self, from: Timestamp, upto: Option<Timestamp>) -> bool {
        let statuses = self.statuses.read();
        match upto {
            Some(hi) if from >= hi => false,
            Some(hi) => statuses.range(from..hi).any(|(_, s)| s.is_live()),
            None => statuses.range(from..).any(|(_, s)| s.is_live()),
        }
    }

    /// Note that a chain entry created by the transaction behind `vh` was
    /// unlinked. An aborted record whose last version goes away is retired
    /// from the index — nothing can name it any more.
    pub fn release_version(&self, vh: VersionHandle) {
        if vh.is_primordial() {
            return;
        }
        let ts = vh.ts();
        let retire = match self.statuses.read().get(&ts) {
            None => false,
            Some(status) => {
                status.release_version() == 0 && matches!(status.state(), TxnState::Aborted)
            }
        };
        if retire {
            let mut statuses = self.statuses.write();
            let gone = statuses
                .get(&ts)
                .is_some_and(|s| s.version_count() == 0 && matches!(s.state(), TxnState::Aborted));
            if gone {
                statuses.remove(&ts);
                tracing::trace!(ts = %ts, "retired aborted transaction status");
            }
        }
    }

    /// Retire committed records below the commit floor.
    ///
    /// The floor is maintained by the journal manager, outside this
    /// subsystem; versions of retired transactions report as committed at
    /// their own start timestamp from then on. Aborted records with no
    /// linked versions left are retired opportunistically as well.
    pub fn evict_resolved(&self, floor: Timestamp) {
        let mut statuses = self.statuses.write();
        let before = statuses.len();
        statuses.retain(|_, status| match status.state() {
            TxnState::Committed(tc) => tc >= floor,
            TxnState::Aborted => status.version_count() > 0,
            TxnState::Active | TxnState::Committing(_) => true,
        });
        let evicted = before - statuses.len();
        if evicted > 0 {
            tracing::debug!(evicted, floor = %floor, "evicted resolved transaction statuses");
        }
    }

    fn classify_commit(tc: Timestamp, waiter: &TxnStatus) -> WwProbe {
        if tc <= waiter.ts() {
            WwProbe::Clear
        } else {
            WwProbe::Committed(tc)
        }
    }

    /// Follow ww-depends-on edges from `start`; reaching `waiter` means
    /// the wait about to be made would deadlock.
    fn would_deadlock(&self, start: Timestamp, waiter: Timestamp) -> bool {
        let mut current = start;
        for _ in 0..MAX_WW_EDGE_HOPS {
            if current == waiter {
                return true;
            }
            match self.get(current).and_then(|s| s.ww_depends_on()) {
                Some(next) => current = next,
                None => return false,
            }
        }
        true
    }
}

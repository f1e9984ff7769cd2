//! Transactionally versioned resources.
//!
//! A [`VersionChain`] manages the versions of one object — for example, a
//! tree handle caches state created and either committed or rolled back by
//! a transaction. Versions live on a singly linked chain from newest to
//! oldest; each carries the packed (timestamp, step) handle of the
//! transaction that created it. A reader walks from the head and takes the
//! first version its snapshot may observe. A writer prepends, probing the
//! chain for write-write conflicts first. Pruning unlinks versions no
//! transaction can observe any more and collapses a fully settled chain to
//! a single primordial entry.
//!
//! The chain is guarded by a `parking_lot::RwLock`: writers (insert,
//! delete, prune, primordial promotion) are exclusive, readers share.
//! Blocked write-write waits and prune callbacks run with the lock
//! released.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use smallvec::SmallVec;

use loam_error::{LoamError, Result, RollbackReason};
use loam_types::{CommitStatus, Snapshot, Timestamp, VersionHandle};

use crate::engine::Engine;
use crate::registry::PruneTarget;
use crate::status::TxnStatus;
use crate::transaction::Transaction;
use crate::version::Version;

/// One node of a version chain.
struct Entry<V> {
    handle: VersionHandle,
    payload: V,
    /// Sticky: set when the entry is a deletion tombstone, never cleared.
    deleted: bool,
    previous: Option<Box<Entry<V>>>,
}

/// Head of the chain; owned by the resource's lock.
struct ChainState<V> {
    head: Option<Box<Entry<V>>>,
}

impl<V> Drop for ChainState<V> {
    fn drop(&mut self) {
        // unlink iteratively so a long chain cannot recurse the stack away
        let mut cursor = self.head.take();
        while let Some(mut entry) = cursor {
            cursor = entry.previous.take();
        }
    }
}

/// Rebuild a chain from the kept entries (newest first, links cleared)
/// followed by a not-yet-visited tail.
fn relink<V>(state: &mut ChainState<V>, kept: Vec<Box<Entry<V>>>, tail: Option<Box<Entry<V>>>) {
    let mut head = tail;
    for mut entry in kept.into_iter().rev() {
        entry.previous = head;
        head = Some(entry);
    }
    state.head = head;
}

/// A container's MVCC version chain.
///
/// `C` is the container type the chain is attached to; `V` is the payload
/// type of one version. The chain registers itself with the engine at
/// construction, so periodic sweeps reach it for as long as it is alive.
pub struct VersionChain<C, V> {
    engine: Arc<Engine>,
    container: C,
    state: RwLock<ChainState<V>>,
}

impl<C, V> VersionChain<C, V>
where
    C: Send + Sync + 'static,
    V: Version,
{
    /// Create a chain attached to `container` and register it for prune
    /// sweeps.
    pub fn new(engine: &Arc<Engine>, container: C) -> Arc<Self> {
        let chain = Arc::new(Self {
            engine: Arc::clone(engine),
            container,
            state: RwLock::new(ChainState { head: None }),
        });
        let dyn_chain: Arc<dyn PruneTarget> = chain.clone();
        engine.register_for_sweep(Arc::downgrade(&dyn_chain));
        chain
    }

    /// The container this chain is attached to.
    pub fn container(&self) -> &C {
        &self.container
    }

    /// Whether the chain holds no versions at all.
    pub fn is_empty(&self) -> bool {
        self.state.read().head.is_none()
    }

    /// Count of versions currently on the chain.
    pub fn version_count(&self) -> usize {
        let state = self.state.read();
        let mut count = 0;
        let mut cursor = state.head.as_deref();
        while let Some(entry) = cursor {
            count += 1;
            cursor = entry.previous.as_deref();
        }
        count
    }

    /// Publish a new version on behalf of `txn`.
    ///
    /// An active transaction stamps the version with its own (timestamp,
    /// step); otherwise the version auto-commits under a fresh timestamp.
    /// Fails with [`LoamError::Rollback`] when the caller lost the race to
    /// the head or a concurrent transaction owns a conflicting version.
    pub fn add_version(&self, payload: V, txn: &Transaction) -> Result<()> {
        let handle = self.next_handle(txn);
        match txn.active_status() {
            Some(status) => self.insert_active(handle, payload, status),
            None => self.insert_latest(handle, payload),
        }
    }

    /// Logically delete the resource on behalf of `txn`.
    ///
    /// Prepends a tombstone carrying a clone of the current head's payload
    /// with the deleted flag set, through the same conflict-checked path
    /// as [`VersionChain::add_version`]. Deleting an empty chain is a
    /// no-op. A transaction deleting a version it created at the current
    /// step must advance its step first, or the tombstone loses the
    /// handle race against its own entry.
    pub fn delete(&self, txn: &Transaction) -> Result<()> {
        let handle = self.next_handle(txn);
        let status = txn.active_status();
        loop {
            let mut blocked_on = None;
            {
                let mut state = self.state.write();
                let Some(first) = state.head.as_deref() else {
                    return Ok(());
                };
                if handle <= first.handle {
                    return Err(LoamError::rollback(RollbackReason::LostRace));
                }
                if let Some(status) = status {
                    blocked_on = self.probe_chain(&state, status)?;
                }
                if blocked_on.is_none() {
                    if let Some(status) = status {
                        status.retain_version();
                    }
                    let payload = state
                        .head
                        .as_deref()
                        .expect("head checked non-empty above")
                        .payload
                        .clone();
                    let entry = Entry {
                        handle,
                        payload,
                        deleted: true,
                        previous: state.head.take(),
                    };
                    state.head = Some(Box::new(entry));
                    tracing::debug!(version = %handle, "published deletion tombstone");
                    return Ok(());
                }
            }
            if let (Some(version), Some(status)) = (blocked_on, status) {
                self.await_dependency(version, status)?;
            }
        }
    }

    /// The version visible to `txn`'s snapshot, if any.
    ///
    /// An active transaction observes at its own (timestamp, step);
    /// otherwise the latest committed state is observed. Takes only the
    /// shared side of the chain lock.
    pub fn get_version(&self, txn: &Transaction) -> Option<V> {
        let snapshot = match txn.active_status() {
            Some(status) => status.snapshot(),
            None => Snapshot::latest(),
        };
        self.version_at(snapshot)
    }

    /// The version visible to an explicit snapshot, if any.
    pub fn version_at(&self, snapshot: Snapshot) -> Option<V> {
        let index = self.engine.index();
        let state = self.state.read();
        let mut cursor = state.head.as_deref();
        while let Some(entry) = cursor {
            if index.commit_status(entry.handle, snapshot).is_visible() {
                return Some(entry.payload.clone());
            }
            cursor = entry.previous.as_deref();
        }
        None
    }

    /// The version visible to `txn`, creating one when there is none.
    ///
    /// The freshly created payload is published through
    /// [`VersionChain::add_version`] and handed back.
    pub fn get_or_create<F>(&self, txn: &Transaction, create: F) -> Result<V>
    where
        F: FnOnce(&Self) -> Result<V>,
    {
        if let Some(version) = self.get_version(txn) {
            return Ok(version);
        }
        let version = create(self)?;
        self.add_version(version.clone(), txn)?;
        Ok(version)
    }

    /// Rewrite the sole remaining version's handle to the primordial
    /// handle, making it universally visible.
    ///
    /// Permitted only on a chain holding exactly one version.
    pub fn set_primordial(&self) -> Result<()> {
        let mut state = self.state.write();
        match state.head.as_deref_mut() {
            Some(first) if first.previous.is_none() => {
                first.handle = VersionHandle::PRIMORDIAL;
                Ok(())
            }
            Some(_) => Err(LoamError::invalid_argument(
                "cannot become primordial: chain holds older versions",
            )),
            None => Err(LoamError::invalid_argument(
                "cannot become primordial: chain is empty",
            )),
        }
    }

    /// Remove every version no transaction can observe any more.
    ///
    /// Obsolete entries are unlinked under the writer lock; their
    /// payloads' [`Version::prune`] callbacks run afterwards with the lock
    /// released. Callback failures are collected and the first one is
    /// surfaced once all callbacks have run. A chain reduced to a single
    /// fully settled committed version is collapsed to primordial; a chain
    /// whose only survivor is a deletion tombstone becomes empty.
    pub fn prune(&self) -> Result<()> {
        let mut doomed: SmallVec<[V; 4]> = SmallVec::new();
        {
            let mut state = self.state.write();
            self.prune_locked(&mut state, &mut doomed)?;
        }

        let mut first_failure = None;
        for payload in doomed {
            match payload.prune() {
                // the boolean result is advisory
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "version prune callback failed");
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }
        match first_failure {
            Some(err) => Err(LoamError::PruneFailed {
                detail: err.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn next_handle(&self, txn: &Transaction) -> VersionHandle {
        match txn.active_status() {
            Some(status) => status.version_handle(),
            None => VersionHandle::from_ts(self.engine.timestamps().allocate()),
        }
    }

    /// Insert an auto-commit version: no conflict walk, only the race
    /// check against the head.
    fn insert_latest(&self, handle: VersionHandle, payload: V) -> Result<()> {
        let mut state = self.state.write();
        if let Some(first) = state.head.as_deref() {
            if handle <= first.handle {
                return Err(LoamError::rollback(RollbackReason::LostRace));
            }
        }
        let entry = Entry {
            handle,
            payload,
            deleted: false,
            previous: state.head.take(),
        };
        state.head = Some(Box::new(entry));
        Ok(())
    }

    /// Insert on behalf of an active transaction, probing every chain
    /// entry for write-write dependencies first.
    fn insert_active(
        &self,
        handle: VersionHandle,
        payload: V,
        status: &Arc<TxnStatus>,
    ) -> Result<()> {
        let mut entry = Entry {
            handle,
            payload,
            deleted: false,
            previous: None,
        };
        loop {
            let mut blocked_on = None;
            {
                let mut state = self.state.write();
                if let Some(first) = state.head.as_deref() {
                    if entry.handle <= first.handle {
                        return Err(LoamError::rollback(RollbackReason::LostRace));
                    }
                    blocked_on = self.probe_chain(&state, status)?;
                }
                if blocked_on.is_none() {
                    status.retain_version();
                    entry.previous = state.head.take();
                    state.head = Some(Box::new(entry));
                    return Ok(());
                }
            }
            if let Some(version) = blocked_on {
                self.await_dependency(version, status)?;
            }
        }
    }

    /// Non-blocking conflict walk. Returns the handle of an entry whose
    /// creator is mid-commit and must be awaited, or `None` when the walk
    /// cleared. A decided conflict fails with [`LoamError::Rollback`].
    fn probe_chain(
        &self,
        state: &ChainState<V>,
        status: &Arc<TxnStatus>,
    ) -> Result<Option<VersionHandle>> {
        use loam_types::WwProbe;

        let index = self.engine.index();
        let mut cursor = state.head.as_deref();
        while let Some(entry) = cursor {
            match index.ww_dependency(entry.handle, status, Duration::ZERO)? {
                WwProbe::Clear | WwProbe::Aborted => {}
                WwProbe::TimedOut => return Ok(Some(entry.handle)),
                probe @ (WwProbe::Uncommitted | WwProbe::Committed(_)) => {
                    tracing::debug!(
                        writer = %status.ts(),
                        version = %entry.handle,
                        conflict = %probe,
                        "write-write conflict"
                    );
                    return Err(LoamError::rollback(RollbackReason::WriteConflict));
                }
            }
            cursor = entry.previous.as_deref();
        }
        Ok(None)
    }

    /// Wait for an undecided creator's outcome with the chain lock
    /// released. `Ok` means the dependency cleared and the caller should
    /// retry its insertion from the top.
    fn await_dependency(&self, version: VersionHandle, status: &Arc<TxnStatus>) -> Result<()> {
        let probe = self
            .engine
            .index()
            .ww_dependency(version, status, self.engine.ww_max_wait())?;
        if probe.is_clear() {
            tracing::debug!(
                writer = %status.ts(),
                version = %version,
                "write-write dependency cleared; retrying"
            );
            Ok(())
        } else {
            Err(LoamError::rollback(RollbackReason::DependencyUnresolved))
        }
    }

    /// Phase A of pruning: decide, unlink, and relink under the writer
    /// lock. Payloads owed a callback are pushed onto `doomed`.
    fn prune_locked(&self, state: &mut ChainState<V>, doomed: &mut SmallVec<[V; 4]>) -> Result<()> {
        let index = self.engine.index();
        let observer = Snapshot::latest();

        let mut kept_any = false;
        let mut have_latest = false;
        let mut is_primordial = true;
        let mut last_handle: Option<VersionHandle> = None;
        let mut last_tc: Option<Timestamp> = None;
        let mut uncommitted_ts: Option<Timestamp> = None;
        let mut dropped = 0_usize;

        // walk by ownership, newest to oldest, deciding each entry's fate;
        // the survivors are relinked below
        let mut kept: Vec<Box<Entry<V>>> = Vec::new();
        let mut rest = state.head.take();
        while let Some(mut entry) = rest {
            rest = entry.previous.take();
            is_primordial &= !kept_any;
            let (keep, aborted) = match index.commit_status(entry.handle, observer) {
                CommitStatus::Aborted => (false, true),
                CommitStatus::Uncommitted => {
                    let ts = entry.handle.ts();
                    if let Some(seen) = uncommitted_ts {
                        if seen != ts {
                            kept.push(entry);
                            relink(state, kept, rest);
                            return Err(LoamError::corrupted(format!(
                                "multiple uncommitted versions: {seen} and {ts}"
                            )));
                        }
                    }
                    uncommitted_ts = Some(ts);
                    is_primordial = false;
                    (true, false)
                }
                CommitStatus::Committed(tc) => {
                    let concurrent = index.has_concurrent(tc, last_tc);
                    let keep = !have_latest || concurrent;
                    have_latest = true;
                    if concurrent {
                        is_primordial = false;
                    }
                    // handles and commit times can repeat a timestamp across
                    // steps, never grow along the walk
                    let handles_ordered = last_handle.map_or(true, |newer| {
                        entry.handle < newer || entry.handle.ts() == newer.ts()
                    });
                    let commits_ordered = last_tc.map_or(true, |newer_tc| tc <= newer_tc);
                    if !handles_ordered || !commits_ordered {
                        let handle = entry.handle;
                        kept.push(entry);
                        relink(state, kept, rest);
                        return Err(LoamError::corrupted(format!(
                            "chain order violated at {handle} (tc {tc})"
                        )));
                    }
                    last_handle = Some(entry.handle);
                    last_tc = Some(tc);
                    (keep, false)
                }
                CommitStatus::Primordial => {
                    if entry.deleted {
                        // a primordial-level tombstone still masks the
                        // resource
                        (true, false)
                    } else if have_latest {
                        // superseded by a newer committed keeper
                        is_primordial = false;
                        (false, false)
                    } else {
                        (true, false)
                    }
                }
            };

            if keep {
                kept_any = true;
                kept.push(entry);
            } else {
                index.release_version(entry.handle);
                dropped += 1;
                // aborted payloads owe no prune callback, tombstones none
                if !aborted && !entry.deleted {
                    doomed.push(entry.payload);
                }
            }
        }
        relink(state, kept, None);

        if state
            .head
            .as_deref()
            .is_some_and(|first| first.deleted && first.previous.is_none())
        {
            let removed = state.head.take().expect("head checked above");
            index.release_version(removed.handle);
            dropped += 1;
            tracing::debug!(version = %removed.handle, "tombstone was the last trace; chain emptied");
        }

        if is_primordial {
            if let Some(first) = state.head.as_deref_mut() {
                if first.previous.is_some() {
                    return Err(LoamError::corrupted(
                        "primordial collapse with older versions still linked",
                    ));
                }
                if !first.handle.is_primordial() {
                    tracing::debug!(version = %first.handle, "collapsing chain to primordial");
                    first.handle = VersionHandle::PRIMORDIAL;
                }
            }
        }

        if dropped > 0 {
            tracing::debug!(dropped, "pruned obsolete versions");
        }
        Ok(())
    }
}

impl<C, V> PruneTarget for VersionChain<C, V>
where
    C: Send + Sync + 'static,
    V: Version,
{
    fn prune(&self) -> Result<()> {
        VersionChain::prune(self)
    }
}

impl<C, V> fmt::Debug for VersionChain<C, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VersionChain(")?;
        let state = self.state.read();
        let mut cursor = state.head.as_deref();
        let mut shown = 0;
        while let Some(entry) = cursor {
            if shown == 16 {
                f.write_str(",...")?;
                break;
            }
            if shown > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", entry.handle)?;
            if entry.deleted {
                f.write_str("(deleted)")?;
            }
            shown += 1;
            cursor = entry.previous.as_deref();
        }
        f.write_str(")")
    }
}

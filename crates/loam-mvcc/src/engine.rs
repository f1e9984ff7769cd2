//! Engine context for the MVCC subsystem.
//!
//! The [`Engine`] bundles the three process-wide collaborators every
//! version chain needs — the timestamp allocator, the transaction index,
//! and the prune registry — and hands out [`Transaction`] handles. It is
//! always passed explicitly: chains receive the engine at construction
//! rather than reaching for a global.

use std::sync::{Arc, Weak};
use std::time::Duration;

use loam_error::Result;

use crate::index::TransactionIndex;
use crate::registry::{PruneRegistry, PruneTarget, SweepReport};
use crate::timestamp::TimestampAllocator;
use crate::transaction::Transaction;

/// How long a blocked write-write dependency wait may take before the
/// waiting transaction gives up and rolls back.
pub const DEFAULT_WW_MAX_WAIT: Duration = Duration::from_secs(60);

/// Process-wide context shared by every version chain.
#[derive(Debug)]
pub struct Engine {
    timestamps: TimestampAllocator,
    index: TransactionIndex,
    registry: PruneRegistry,
    ww_max_wait: Duration,
}

impl Engine {
    /// Create an engine with the default write-write wait bound.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_ww_max_wait(DEFAULT_WW_MAX_WAIT)
    }

    /// Create an engine with a custom write-write wait bound.
    #[must_use]
    pub fn with_ww_max_wait(ww_max_wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            timestamps: TimestampAllocator::new(),
            index: TransactionIndex::new(),
            registry: PruneRegistry::new(),
            ww_max_wait,
        })
    }

    /// The engine's timestamp allocator.
    #[must_use]
    pub fn timestamps(&self) -> &TimestampAllocator {
        &self.timestamps
    }

    /// The engine's transaction index.
    #[must_use]
    pub fn index(&self) -> &TransactionIndex {
        &self.index
    }

    /// The bound on blocked write-write dependency waits.
    #[must_use]
    pub fn ww_max_wait(&self) -> Duration {
        self.ww_max_wait
    }

    /// Create an idle transaction handle bound to this engine.
    #[must_use]
    pub fn transaction(self: &Arc<Self>) -> Transaction {
        Transaction::new(Arc::clone(self))
    }

    /// Create a handle and start a transaction on it.
    pub fn begin(self: &Arc<Self>) -> Result<Transaction> {
        let mut txn = self.transaction();
        txn.begin()?;
        Ok(txn)
    }

    /// Register a resource for prune sweeps.
    pub(crate) fn register_for_sweep(&self, target: Weak<dyn PruneTarget>) {
        self.registry.register(target);
    }

    /// Prune every registered, still-live resource once.
    pub fn sweep(&self) -> SweepReport {
        self.registry.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_dispenses_increasing_timestamps() {
        let engine = Engine::new();
        let a = engine.begin().unwrap();
        let b = engine.begin().unwrap();
        assert!(b.timestamp().unwrap() > a.timestamp().unwrap());
        assert_eq!(engine.index().live_count(), 2);
    }

    #[test]
    fn sweep_on_an_empty_engine_reports_nothing() {
        let engine = Engine::new();
        let report = engine.sweep();
        assert_eq!(report, SweepReport::default());
    }
}

//! Weak registry of prunable resources.
//!
//! Every version chain registers itself here at construction; a periodic
//! sweep walks the registry and prunes each chain that is still alive.
//! Registration is by weak reference so the registry never keeps a
//! discarded container alive — a dead entry is dropped by the next sweep.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use loam_error::Result;

/// A resource the engine's sweeper can ask to drop obsolete versions.
pub trait PruneTarget: Send + Sync {
    /// Remove every version no transaction can observe any more.
    fn prune(&self) -> Result<()>;
}

/// Result of one registry sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Resources that were still alive when the sweep ran.
    pub chains: usize,
    /// Resources pruned without error.
    pub pruned: usize,
    /// Resources whose prune returned an error (logged, not propagated).
    pub failed: usize,
    /// Dead registrations dropped by this sweep.
    pub unregistered: usize,
}

/// Process-wide collection of live prunable resources.
#[derive(Default)]
pub struct PruneRegistry {
    targets: Mutex<Vec<Weak<dyn PruneTarget>>>,
}

impl PruneRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource for future sweeps.
    pub fn register(&self, target: Weak<dyn PruneTarget>) {
        self.targets.lock().push(target);
    }

    /// Number of registrations, dead ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.lock().len()
    }

    /// Whether the registry has no registrations at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.lock().is_empty()
    }

    /// Prune every live resource once, dropping dead registrations.
    ///
    /// Prune failures are counted and logged; one resource failing does
    /// not keep the sweep from reaching the rest.
    pub fn sweep(&self) -> SweepReport {
        let mut live: Vec<Arc<dyn PruneTarget>> = Vec::new();
        let unregistered = {
            let mut targets = self.targets.lock();
            let before = targets.len();
            targets.retain(|weak| {
                weak.upgrade().map_or(false, |strong| {
                    live.push(strong);
                    true
                })
            });
            before - targets.len()
        };

        let mut pruned = 0;
        let mut failed = 0;
        for target in &live {
            match target.prune() {
                Ok(()) => pruned += 1,
                Err(err) => {
                    failed += 1;
                    tracing::warn!(error = %err, "prune failed during registry sweep");
                }
            }
        }

        let report = SweepReport {
            chains: live.len(),
            pruned,
            failed,
            unregistered,
        };
        if report.pruned > 0 || report.unregistered > 0 {
            tracing::debug!(
                chains = report.chains,
                pruned = report.pruned,
                failed = report.failed,
                unregistered = report.unregistered,
                "registry sweep complete"
            );
        }
        report
    }
}

impl std::fmt::Debug for PruneRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PruneRegistry")
            .field("registered", &self.len())
            .finish_non_exhaustive()
    }
}

//! Transaction handles.
//!
//! A [`Transaction`] is the caller-facing wrapper around a status record:
//! `begin` allocates a start timestamp and registers the record with the
//! engine's transaction index, `commit` walks the record through the
//! committing window, `rollback` aborts it. One handle can run any number
//! of transactions in sequence; it holds at most one at a time.

use std::sync::Arc;

use loam_error::{LoamError, Result};
use loam_types::{Step, Timestamp};

use crate::engine::Engine;
use crate::status::TxnStatus;

/// Handle through which a caller runs transactions against an engine.
pub struct Transaction {
    engine: Arc<Engine>,
    status: Option<Arc<TxnStatus>>,
}

impl Transaction {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            status: None,
        }
    }

    /// Start a transaction: allocate a start timestamp and register with
    /// the index. Fails if one is already running on this handle.
    pub fn begin(&mut self) -> Result<()> {
        if self.is_active() {
            return Err(LoamError::invalid_argument(
                "transaction is already active",
            ));
        }
        let ts = self.engine.timestamps().allocate();
        let status = Arc::new(TxnStatus::new(ts));
        self.engine.index().register(Arc::clone(&status));
        tracing::trace!(ts = %ts, "transaction began");
        self.status = Some(status);
        Ok(())
    }

    /// Commit: propose a commit timestamp and finalize it.
    ///
    /// Engines with a journal call [`Transaction::prepare_commit`] and
    /// [`Transaction::complete_commit`] separately, persisting the
    /// decision in between; this convenience runs both back to back.
    pub fn commit(&mut self) -> Result<Timestamp> {
        self.prepare_commit()?;
        self.complete_commit()
    }

    /// Enter the committing window with a freshly allocated commit
    /// timestamp. Write-write dependents block until the window closes.
    pub fn prepare_commit(&mut self) -> Result<Timestamp> {
        let status = self.require_status()?;
        let tc = self.engine.timestamps().allocate();
        status.begin_commit(tc)?;
        Ok(tc)
    }

    /// Close the committing window, making the commit final and waking
    /// every write-write dependent.
    pub fn complete_commit(&mut self) -> Result<Timestamp> {
        let status = self.require_status()?;
        let tc = status.finish_commit()?;
        tracing::trace!(ts = %status.ts(), tc = %tc, "transaction committed");
        Ok(tc)
    }

    /// Roll the transaction back and wake every write-write dependent.
    pub fn rollback(&mut self) -> Result<()> {
        let status = self.require_status()?;
        status.abort()?;
        tracing::trace!(ts = %status.ts(), "transaction rolled back");
        Ok(())
    }

    /// Whether a transaction is currently running on this handle.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_live())
    }

    /// The running transaction's status record, if one is live.
    #[must_use]
    pub fn active_status(&self) -> Option<&Arc<TxnStatus>> {
        self.status.as_ref().filter(|s| s.is_live())
    }

    /// The most recent transaction's status record, live or resolved.
    #[must_use]
    pub fn status(&self) -> Option<&Arc<TxnStatus>> {
        self.status.as_ref()
    }

    /// Start timestamp of the running transaction.
    #[must_use]
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.active_status().map(|s| s.ts())
    }

    /// Step counter of the running transaction.
    #[must_use]
    pub fn step(&self) -> Option<Step> {
        self.active_status().map(|s| s.step())
    }

    /// Advance the running transaction's step counter so this handle sees
    /// versions written by its earlier statements.
    pub fn increment_step(&mut self) -> Result<Step> {
        self.require_status()?.increment_step()
    }

    fn require_status(&self) -> Result<&Arc<TxnStatus>> {
        self.status
            .as_ref()
            .ok_or_else(|| LoamError::invalid_argument("no transaction on this handle"))
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(status) = &self.status {
            if status.is_live() {
                tracing::warn!(ts = %status.ts(), "transaction dropped while active; rolling back");
                let _ = status.abort();
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

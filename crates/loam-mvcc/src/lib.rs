//! MVCC versioned resources for LoamDB.
//!
//! This crate implements the engine's version-chain machinery: objects
//! such as tree handles attach a [`VersionChain`] and let concurrent
//! transactions see, create, logically delete, and garbage-collect
//! distinct versions of themselves under snapshot isolation.
//!
//! The pieces, bottom up:
//!
//! - [`TimestampAllocator`]: strictly monotonic logical timestamps.
//! - [`TxnStatus`] / [`Transaction`]: per-transaction state, the commit
//!   window, and the wait primitive write-write dependents block on.
//! - [`TransactionIndex`]: process-wide commit-status lookup, write-write
//!   dependency probing, and the concurrent-transaction predicate.
//! - [`VersionChain`]: the version chain itself — visibility, conflict
//!   detection, deletion tombstones, and pruning.
//! - [`Engine`] / [`PruneRegistry`]: shared context and the weak registry
//!   the prune sweeper walks.

pub mod chain;
pub mod engine;
pub mod index;
pub mod registry;
pub mod status;
pub mod timestamp;
pub mod transaction;
pub mod version;

pub use chain::VersionChain;
pub use engine::{DEFAULT_WW_MAX_WAIT, Engine};
pub use index::TransactionIndex;
pub use registry::{PruneRegistry, PruneTarget, SweepReport};
pub use status::{TxnState, TxnStatus};
pub use timestamp::TimestampAllocator;
pub use transaction::Transaction;
pub use version::Version;

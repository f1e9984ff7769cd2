//! The version payload capability.

use loam_error::Result;

/// Capability tag for payloads managed by a version chain.
///
/// A payload is whatever object the container keeps one transactional
/// version of — a tree handle's cached state, for example. Cloning must be
/// cheap (payloads are typically `Arc`-backed); the chain clones on every
/// read and when building deletion tombstones.
///
/// Payloads owning external state override [`Version::prune`]; the chain
/// invokes it after the version has been unlinked, outside any chain lock.
/// The boolean result is advisory. Payloads with nothing to release keep
/// the default no-op.
pub trait Version: Clone + Send + Sync + 'static {
    /// Release whatever the payload holds onto, after its version became
    /// unobservable and was unlinked.
    fn prune(&self) -> Result<bool> {
        Ok(true)
    }
}

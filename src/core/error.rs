//! Error types for engine operations.
//!
//! Hot-path operations never panic and never abort; they return
//! [`EngineResult`]. Startup failures (WAL open, double-open, bad
//! configuration) are surfaced as `anyhow` errors by the constructors and
//! abort the process in `main`.

use thiserror::Error;

/// Error conditions surfaced by engine mutations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The WAL append failed. In-memory state is left untouched.
    #[error("wal append failed: {0}")]
    WalAppend(#[from] std::io::Error),

    /// A ring is configured and this node does not own the key.
    ///
    /// The frontend is expected to turn this into a redirect to
    /// [`EngineError::NotOwner::owner`].
    #[error("key {key:?} is owned by node {owner}, not this node")]
    NotOwner { key: String, owner: u32 },
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Outcome of applying a remote mutation.
///
/// A stale mutation is not an error: rejecting writes that lost the
/// last-writer-wins race is the steady state of anti-entropy repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The mutation won the timestamp comparison and was applied.
    Applied,
    /// The mutation's timestamp was not newer than the local one; dropped.
    Stale,
}

impl ApplyOutcome {
    /// Check whether the mutation was applied.
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

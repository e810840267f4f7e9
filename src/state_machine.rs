//! The user state machine seam.

use anyerror::AnyError;
use async_trait::async_trait;
use bytes::Bytes;

use crate::Entry;

/// The replicated application state.
///
/// The engine delivers committed entries in strictly increasing index
/// order and never retries a failed apply; the implementation owns its
/// durability and idempotence. Snapshot bytes are opaque to the engine.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a batch of committed entries.
    async fn apply(&self, entries: &[Entry]) -> Result<(), AnyError>;

    /// Replace the current state with a snapshot's bytes.
    async fn apply_snapshot(&self, data: Bytes) -> Result<(), AnyError>;

    /// Serialize the current state for a snapshot build. The returned
    /// bytes must cover at least every entry applied so far.
    async fn snapshot(&self) -> Result<Bytes, AnyError>;
}

//! The coordination-service abstraction.
//!
//! Armada persists through a small key-value contract: versioned nodes with
//! per-key compare-and-set, one-level children listing, ephemeral sequential
//! nodes (the election primitive), a change feed, and a session signal. The
//! wire client for a real coordination service implements
//! [`CoordinationStore`] in an adapter crate; the core never sees wire types.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

/// Monotonic per-node version assigned by the store on every write.
pub type NodeVersion = u64;

/// A node's payload together with the version that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedNode {
    pub data: Vec<u8>,
    pub version: NodeVersion,
}

/// Errors surfaced by a [`CoordinationStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("node already exists: {0}")]
    AlreadyExists(String),

    #[error("version conflict on {path}: expected {expected}, stored {actual}")]
    Conflict {
        path: String,
        expected: NodeVersion,
        actual: NodeVersion,
    },

    #[error("coordination service unavailable: {0}")]
    Unavailable(String),

    #[error("coordination session expired")]
    SessionExpired,

    #[error("record encoding failed: {0}")]
    Codec(String),
}

impl StoreError {
    /// Whether a retry with backoff can reasonably succeed.
    ///
    /// Conflicts and missing nodes are facts about the data, not the
    /// connection; retrying those verbatim would loop forever.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// State of the session with the coordination service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Transport briefly gone; the session may still recover.
    Disconnected,
    /// The service dropped the session; every ephemeral node is gone.
    Expired,
}

/// What happened to a node on the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Created,
    Updated,
    Deleted,
}

/// A change-feed entry. Consumers filter on the path prefix they watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub path: String,
    pub kind: StoreEventKind,
}

/// The coordination-service contract.
///
/// All writes are linearized per key by the service. `expected: Some(v)`
/// turns a write into a compare-and-set; a moved version yields
/// [`StoreError::Conflict`].
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a node. `None` when the node does not exist.
    async fn get(&self, path: &str) -> Result<Option<VersionedNode>, StoreError>;

    /// Create a node that must not exist yet.
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<NodeVersion, StoreError>;

    /// Write a node, creating it if absent. With `expected` set, the write
    /// only succeeds if the stored version still matches.
    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<NodeVersion>,
    ) -> Result<NodeVersion, StoreError>;

    /// Delete a node. With `expected` set, behaves as compare-and-delete.
    /// Deleting an absent node is a [`StoreError::NotFound`].
    async fn delete(&self, path: &str, expected: Option<NodeVersion>) -> Result<(), StoreError>;

    /// Names (not full paths) of the direct children of `path`, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Create an ephemeral node named `prefix` + a monotonically increasing,
    /// zero-padded sequence number. Returns the full path. The node vanishes
    /// when the creating session expires.
    async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        data: Vec<u8>,
    ) -> Result<String, StoreError>;

    /// Subscribe to the change feed. Lagging subscribers lose old entries.
    fn events(&self) -> broadcast::Receiver<StoreEvent>;

    /// Observe the session state.
    fn session(&self) -> watch::Receiver<SessionState>;
}

// ---------------------------------------------------------------------------
// Bounded retry
// ---------------------------------------------------------------------------

/// Backoff schedule for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base: Duration::from_millis(50),
            max: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n` (0-based; attempt 0 has no delay).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt - 1));
        exp.min(self.max)
    }
}

/// Run `op` until it succeeds, the error is not transient, or the policy's
/// attempts are spent. The last error is returned verbatim.
pub async fn retrying<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        let delay = policy.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                tracing::warn!(attempt = attempt, error = %e, "transient store error, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ids::SessionId;

/// Raised by cooperative checks once the owning request has been cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("request cancelled")]
pub struct Cancelled;

/// Per-request cancellation flag. Monotonic: once set it never clears.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    token: CancellationToken,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the flag is set.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Process-wide set of cancelled sessions, keyed by session id with the time
/// the session was first cancelled.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    entries: DashMap<SessionId, Instant>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, session_id: &SessionId) {
        let _ = self
            .entries
            .entry(session_id.clone())
            .or_insert_with(Instant::now);
        tracing::debug!(session_id = %session_id, "session marked cancelled");
    }

    pub fn is_cancelled(&self, session_id: &SessionId) -> bool {
        self.entries.contains_key(session_id)
    }

    /// Drop the entry once the owning request has fully unwound.
    pub fn release(&self, session_id: &SessionId) -> bool {
        self.entries.remove(session_id).is_some()
    }

    /// Remove entries older than `max_age`. Returns how many were evicted.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, at| at.elapsed() < max_age);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

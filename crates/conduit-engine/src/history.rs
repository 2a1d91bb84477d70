use conduit_core::ids::SessionId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// In-process conversation history keyed by session. Nothing is persisted.
pub struct SessionStore {
    sessions: DashMap<SessionId, Vec<HistoryEntry>>,
    max_entries: usize,
}

impl SessionStore {
    /// Keep at most `max_entries` per session, dropping the oldest.
    pub fn new(max_entries: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_entries,
        }
    }

    pub fn history(&self, session_id: &SessionId) -> Vec<HistoryEntry> {
        self.sessions
            .get(session_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    pub fn append(&self, session_id: &SessionId, entry: HistoryEntry) {
        let mut history = self.sessions.entry(session_id.clone()).or_default();
        history.push(entry);
        let excess = history.len().saturating_sub(self.max_entries);
        if excess > 0 {
            let _ = history.drain(..excess);
        }
    }

    /// Record one user turn and, when non-empty, the assistant's reply.
    pub fn record_exchange(&self, session_id: &SessionId, user: &str, assistant: &str) {
        self.append(session_id, HistoryEntry::user(user));
        if !assistant.trim().is_empty() {
            self.append(session_id, HistoryEntry::assistant(assistant.trim()));
        }
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(100)
    }
}

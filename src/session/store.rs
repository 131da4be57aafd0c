//! # Persistent Store Seam
//!
//! Durable session and conversation records live in an external store
//! reached over request/response calls. This module defines that seam
//! (`SessionStore`) and an in-memory implementation used by the reference
//! server and the tests.
//!
//! ## Session State Machine:
//! `pending → active → ended`, with `active → errored` on unrecoverable
//! pipeline failure or idle timeout. `ended` and `errored` are terminal:
//! once reached, no further transition is accepted for that session and a
//! new session must be created to resume conversation.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Lifecycle state of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no transport has attached yet
    Pending,
    /// A transport connection has attached at least once
    Active,
    /// Terminated voluntarily (client request or explicit end)
    Ended,
    /// Terminated by failure (pipeline error, idle timeout)
    Errored,
}

impl SessionState {
    /// True for states no transition may leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Errored)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Ended => "ended",
            SessionState::Errored => "errored",
        }
    }
}

/// One logical voice conversation, independent of any transport connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One conversation turn appended to a session's transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// "user", "assistant", or "system"
    pub speaker: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Request/response interface to the persistent store.
///
/// No streaming semantics are required of the store; every call is a single
/// request keyed by `session_id`. Implementations decide their own
/// transactional discipline.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session record in `pending` state.
    ///
    /// Fails if the id already exists; the caller picks ids (uuid v4 in
    /// practice) so collisions indicate a retry bug, not normal operation.
    async fn create_session(&self, session_id: &str, user_id: &str) -> VoiceResult<SessionRecord>;

    /// Fetch a session record.
    async fn get_session(&self, session_id: &str) -> VoiceResult<Option<SessionRecord>>;

    /// Transition `pending → active`. No-op if already `active`; rejected
    /// from a terminal state.
    async fn mark_active(&self, session_id: &str) -> VoiceResult<()>;

    /// Transition to `ended`. No-op if already `ended`; rejected from
    /// `errored`.
    async fn end_session(&self, session_id: &str) -> VoiceResult<()>;

    /// Transition to `errored`. No-op if already `errored`; rejected from
    /// `ended`.
    async fn mark_errored(&self, session_id: &str) -> VoiceResult<()>;

    /// Append a conversation turn to the session transcript.
    async fn append_turn(&self, session_id: &str, turn: ConversationTurn) -> VoiceResult<()>;
}

/// In-memory store for the reference server and tests.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    turns: RwLock<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transcript of a session, for tests and debugging.
    pub async fn turns(&self, session_id: &str) -> Vec<ConversationTurn> {
        self.turns
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Shared transition guard: terminal states accept nothing but a
    /// same-state no-op.
    async fn transition(
        &self,
        session_id: &str,
        target: SessionState,
        allowed_from: &[SessionState],
    ) -> VoiceResult<()> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| VoiceError::Store(format!("unknown session '{}'", session_id)))?;

        if record.state == target {
            return Ok(());
        }
        if !allowed_from.contains(&record.state) {
            if record.state.is_terminal() {
                return Err(VoiceError::TerminalSession {
                    session_id: session_id.to_string(),
                    state: record.state.as_str(),
                });
            }
            return Err(VoiceError::Store(format!(
                "session '{}' cannot move from {} to {}",
                session_id,
                record.state.as_str(),
                target.as_str()
            )));
        }

        record.state = target;
        if target.is_terminal() {
            record.ended_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, session_id: &str, user_id: &str) -> VoiceResult<SessionRecord> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(VoiceError::Store(format!(
                "session '{}' already exists",
                session_id
            )));
        }

        let record = SessionRecord {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            state: SessionState::Pending,
            created_at: Utc::now(),
            ended_at: None,
        };
        sessions.insert(session_id.to_string(), record.clone());
        Ok(record)
    }

    async fn get_session(&self, session_id: &str) -> VoiceResult<Option<SessionRecord>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn mark_active(&self, session_id: &str) -> VoiceResult<()> {
        self.transition(session_id, SessionState::Active, &[SessionState::Pending])
            .await
    }

    async fn end_session(&self, session_id: &str) -> VoiceResult<()> {
        self.transition(
            session_id,
            SessionState::Ended,
            &[SessionState::Pending, SessionState::Active],
        )
        .await
    }

    async fn mark_errored(&self, session_id: &str) -> VoiceResult<()> {
        self.transition(
            session_id,
            SessionState::Errored,
            &[SessionState::Pending, SessionState::Active],
        )
        .await
    }

    async fn append_turn(&self, session_id: &str, turn: ConversationTurn) -> VoiceResult<()> {
        // Turns may arrive for sessions the store has not seen when the
        // server accepted a fallback identifier; they are kept regardless.
        self.turns
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(turn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_state_machine() {
        let store = InMemorySessionStore::new();
        let record = store.create_session("s1", "u1").await.unwrap();
        assert_eq!(record.state, SessionState::Pending);

        store.mark_active("s1").await.unwrap();
        // mark_active is a no-op when already active
        store.mark_active("s1").await.unwrap();

        store.end_session("s1").await.unwrap();
        let record = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::Ended);
        assert!(record.ended_at.is_some());
    }

    /// Terminal states are immutable.
    #[tokio::test]
    async fn test_terminal_immutability() {
        let store = InMemorySessionStore::new();
        store.create_session("s1", "u1").await.unwrap();
        store.mark_active("s1").await.unwrap();
        store.end_session("s1").await.unwrap();

        // Same-state calls stay idempotent, cross-terminal moves fail with
        // the structured rejection
        assert!(store.end_session("s1").await.is_ok());
        assert!(matches!(
            store.mark_active("s1").await,
            Err(VoiceError::TerminalSession { state: "ended", .. })
        ));
        assert!(matches!(
            store.mark_errored("s1").await,
            Err(VoiceError::TerminalSession { .. })
        ));

        store.create_session("s2", "u1").await.unwrap();
        store.mark_active("s2").await.unwrap();
        store.mark_errored("s2").await.unwrap();
        assert!(store.mark_errored("s2").await.is_ok());
        assert!(store.end_session("s2").await.is_err());
        assert!(store.mark_active("s2").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = InMemorySessionStore::new();
        store.create_session("s1", "u1").await.unwrap();
        assert!(store.create_session("s1", "u2").await.is_err());
    }

    #[tokio::test]
    async fn test_pending_can_error() {
        // Idle timeout can hit before the first frame ever arrives
        let store = InMemorySessionStore::new();
        store.create_session("s1", "u1").await.unwrap();
        store.mark_errored("s1").await.unwrap();
        assert_eq!(
            store.get_session("s1").await.unwrap().unwrap().state,
            SessionState::Errored
        );
    }

    #[tokio::test]
    async fn test_turn_append_order() {
        let store = InMemorySessionStore::new();
        store.create_session("s1", "u1").await.unwrap();
        store
            .append_turn("s1", ConversationTurn::new("user", "red sneakers"))
            .await
            .unwrap();
        store
            .append_turn("s1", ConversationTurn::new("assistant", "found three"))
            .await
            .unwrap();

        let turns = store.turns("s1").await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, "user");
        assert_eq!(turns[1].text, "found three");
    }
}

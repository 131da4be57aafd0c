//! # Session Lifecycle Manager
//!
//! Coordinates session creation and termination against the persistent
//! store, independent of any particular transport connection. A session may
//! have zero or one live connection at a time; the manager keeps a registry
//! of attached connections so that ending a session detaches its connection
//! without the client having to call `disconnect()` itself.
//!
//! ## Error policy:
//! Store failures during `create_session` propagate to the caller — no
//! session is usable until creation succeeds. Store failures during
//! `mark_active`/`end_session`/`mark_errored` are logged and best-effort:
//! transport state is the primary source of truth for "is this connection
//! alive", so the transport-level transition proceeds regardless.

use crate::error::{VoiceError, VoiceResult};
use crate::session::store::{ConversationTurn, SessionRecord, SessionStore};
use actix::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Actor message asking a live connection to close.
///
/// Sent by the lifecycle manager when its session is terminated out from
/// under the connection (explicit end, pipeline failure elsewhere).
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct DetachConnection {
    pub reason: String,
}

/// A registered live connection. The id distinguishes a connection from
/// its successor on the same session, so a stale detach cannot evict the
/// replacement.
struct ConnectionEntry {
    connection_id: Uuid,
    recipient: Recipient<DetachConnection>,
}

/// Creates, tracks, and terminates sessions.
pub struct LifecycleManager {
    store: Arc<dyn SessionStore>,

    /// Live connections by session id. At most one per session; a second
    /// attach replaces (and detaches) the first.
    connections: RwLock<HashMap<String, ConnectionEntry>>,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.store.clone()
    }

    /// Allocate a new session in `pending` state and return its id.
    ///
    /// Not idempotent: a caller that retries a failed create may leave
    /// extra `pending` records behind. Those are inert — they never attach
    /// and never transition — so this is accepted rather than complicating
    /// the store contract.
    pub async fn create_session(&self, user_id: &str) -> VoiceResult<String> {
        let session_id = Uuid::new_v4().to_string();
        let record = self.store.create_session(&session_id, user_id).await?;
        info!(session_id = %record.session_id, user_id = %record.user_id, "session created");
        Ok(record.session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> VoiceResult<Option<SessionRecord>> {
        self.store.get_session(session_id).await
    }

    /// Bind a live connection to a session and mark the session active.
    ///
    /// Creates the record on the fly when the server accepted a fallback or
    /// client-generated identifier the store has not seen. Store errors are
    /// best-effort: the connection proceeds either way.
    pub async fn attach(
        &self,
        session_id: &str,
        user_id: &str,
        connection_id: Uuid,
        connection: Recipient<DetachConnection>,
    ) {
        match self.store.get_session(session_id).await {
            Ok(None) => {
                if let Err(err) = self.store.create_session(session_id, user_id).await {
                    warn!(session_id, %err, "session record creation failed on attach");
                }
            }
            Ok(Some(_)) => {}
            Err(err) => warn!(session_id, %err, "session lookup failed on attach"),
        }

        if let Err(err) = self.store.mark_active(session_id).await {
            warn!(session_id, %err, "mark_active failed; transport state takes precedence");
        }

        let previous = self.connections.write().unwrap().insert(
            session_id.to_string(),
            ConnectionEntry {
                connection_id,
                recipient: connection,
            },
        );
        if let Some(previous) = previous {
            // The session moved to a new transport; the stale one goes away.
            previous.recipient.do_send(DetachConnection {
                reason: "superseded by a new connection".to_string(),
            });
        }
    }

    /// Unbind a connection when its socket closes.
    ///
    /// Detaching does not end the session: a reconnecting client reuses the
    /// same session id. The registry entry is removed only if it still
    /// belongs to the departing connection; a superseded connection shutting
    /// down must not evict its successor.
    pub fn detach(&self, session_id: &str, connection_id: Uuid) {
        let mut connections = self.connections.write().unwrap();
        if connections
            .get(session_id)
            .map(|entry| entry.connection_id)
            == Some(connection_id)
        {
            connections.remove(session_id);
        }
    }

    /// Transition the session to `ended` and close any attached connection.
    pub async fn end_session(&self, session_id: &str) -> VoiceResult<()> {
        if let Err(err) = self.store.end_session(session_id).await {
            match &err {
                // Terminal-state rejections are real caller errors
                VoiceError::TerminalSession { .. } => return Err(err),
                _ => warn!(session_id, %err, "end_session store call failed; closing transport anyway"),
            }
        }
        info!(session_id, "session ended");
        self.close_connection(session_id, "session ended");
        Ok(())
    }

    /// Transition the session to `errored` and close any attached connection.
    pub async fn mark_errored(&self, session_id: &str, reason: &str) {
        if let Err(err) = self.store.mark_errored(session_id).await {
            warn!(session_id, %err, "mark_errored store call failed");
        }
        warn!(session_id, reason, "session errored");
        self.close_connection(session_id, reason);
    }

    /// Best-effort transcript append.
    pub async fn append_turn(&self, session_id: &str, turn: ConversationTurn) {
        if let Err(err) = self.store.append_turn(session_id, turn).await {
            warn!(session_id, %err, "turn append failed");
        }
    }

    /// Number of live connections, for the operational surface.
    pub fn attached_connections(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    fn close_connection(&self, session_id: &str, reason: &str) {
        let entry = self.connections.write().unwrap().remove(session_id);
        if let Some(entry) = entry {
            entry.recipient.do_send(DetachConnection {
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::{InMemorySessionStore, SessionState};

    /// Minimal stand-in for a websocket connection actor.
    struct TestConnection {
        detached: Vec<String>,
    }

    impl Actor for TestConnection {
        type Context = Context<Self>;
    }

    impl Handler<DetachConnection> for TestConnection {
        type Result = ();

        fn handle(&mut self, msg: DetachConnection, _ctx: &mut Self::Context) {
            self.detached.push(msg.reason);
        }
    }

    #[derive(Message)]
    #[rtype(result = "Vec<String>")]
    struct DetachLog;

    impl Handler<DetachLog> for TestConnection {
        type Result = MessageResult<DetachLog>;

        fn handle(&mut self, _msg: DetachLog, _ctx: &mut Self::Context) -> Self::Result {
            MessageResult(self.detached.clone())
        }
    }

    fn manager() -> (LifecycleManager, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        (LifecycleManager::new(store.clone()), store)
    }

    #[actix_rt::test]
    async fn test_create_and_activate() {
        let (manager, store) = manager();
        let session_id = manager.create_session("u1").await.unwrap();
        assert_eq!(
            store.get_session(&session_id).await.unwrap().unwrap().state,
            SessionState::Pending
        );

        let addr = TestConnection { detached: vec![] }.start();
        manager
            .attach(&session_id, "u1", Uuid::new_v4(), addr.recipient())
            .await;
        assert_eq!(
            store.get_session(&session_id).await.unwrap().unwrap().state,
            SessionState::Active
        );
        assert_eq!(manager.attached_connections(), 1);
    }

    /// Ending a session closes the attached connection without
    /// the client calling disconnect.
    #[actix_rt::test]
    async fn test_end_session_detaches_connection() {
        let (manager, store) = manager();
        let session_id = manager.create_session("u1").await.unwrap();

        let addr = TestConnection { detached: vec![] }.start();
        manager
            .attach(&session_id, "u1", Uuid::new_v4(), addr.clone().recipient())
            .await;

        manager.end_session(&session_id).await.unwrap();
        assert_eq!(
            store.get_session(&session_id).await.unwrap().unwrap().state,
            SessionState::Ended
        );

        // The mailbox processes DetachConnection before our query
        let log = addr.send(DetachLog).await.unwrap();
        assert_eq!(log, vec!["session ended".to_string()]);
        assert_eq!(manager.attached_connections(), 0);
    }

    #[actix_rt::test]
    async fn test_attach_unknown_session_creates_record() {
        let (manager, store) = manager();
        let addr = TestConnection { detached: vec![] }.start();
        manager
            .attach("client-chosen", "u1", Uuid::new_v4(), addr.recipient())
            .await;

        let record = store.get_session("client-chosen").await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::Active);
        assert_eq!(record.user_id, "u1");
    }

    #[actix_rt::test]
    async fn test_second_attach_supersedes_first() {
        let (manager, _) = manager();
        let session_id = manager.create_session("u1").await.unwrap();

        let first = TestConnection { detached: vec![] }.start();
        manager
            .attach(&session_id, "u1", Uuid::new_v4(), first.clone().recipient())
            .await;
        let second = TestConnection { detached: vec![] }.start();
        manager
            .attach(&session_id, "u1", Uuid::new_v4(), second.recipient())
            .await;

        let log = first.send(DetachLog).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("superseded"));
        assert_eq!(manager.attached_connections(), 1);
    }

    /// A superseded connection shutting down must not evict its successor
    /// from the registry; ending the session still closes the live one.
    #[actix_rt::test]
    async fn test_stale_detach_keeps_successor() {
        let (manager, _) = manager();
        let session_id = manager.create_session("u1").await.unwrap();

        let first_id = Uuid::new_v4();
        let first = TestConnection { detached: vec![] }.start();
        manager
            .attach(&session_id, "u1", first_id, first.recipient())
            .await;

        let second = TestConnection { detached: vec![] }.start();
        manager
            .attach(&session_id, "u1", Uuid::new_v4(), second.clone().recipient())
            .await;

        // The superseded actor's stop path detaches with its own identity
        manager.detach(&session_id, first_id);
        assert_eq!(manager.attached_connections(), 1);

        manager.end_session(&session_id).await.unwrap();
        let log = second.send(DetachLog).await.unwrap();
        assert_eq!(log, vec!["session ended".to_string()]);
        assert_eq!(manager.attached_connections(), 0);
    }

    #[actix_rt::test]
    async fn test_end_errored_session_rejected() {
        let (manager, _) = manager();
        let session_id = manager.create_session("u1").await.unwrap();
        manager.mark_errored(&session_id, "pipeline failure").await;
        assert!(matches!(
            manager.end_session(&session_id).await,
            Err(VoiceError::TerminalSession { state: "errored", .. })
        ));
    }
}

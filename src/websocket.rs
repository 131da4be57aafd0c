//! # WebSocket Voice Transport Handler
//!
//! Server side of the voice session transport. Clients connect to `/ws`
//! with `session_id` and `user_id` query parameters and stream binary audio;
//! the server bridges that audio into the inference pipeline and streams the
//! pipeline's output back as binary audio frames interleaved with JSON
//! control messages.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: client connects with `session_id`/`user_id` handshake
//!    parameters; missing parameters get generated fallbacks (or a 400 in
//!    strict mode)
//! 2. **Audio Streaming**: client → server messages are binary PCM frames
//!    (16kHz, 16-bit LE, mono); any client text frame is a protocol
//!    violation and closes the connection
//! 3. **Pipeline Output**: server → client messages are binary audio frames
//!    or JSON control messages (`text` / `status` / `function_call` /
//!    `error`)
//! 4. **Session Binding**: the `session_id`/`user_id` pair is fixed for the
//!    connection's lifetime; reconnecting clients present the same pair
//!
//! ## Concurrency:
//! Each connection is one independent actor plus one pipeline-forwarding
//! task; no lock is shared across sessions during steady-state frame relay.

use crate::error::{VoiceError, VoiceResult};
use crate::pipeline::{InferencePipeline, PipelineContext, PipelineEvent};
use crate::protocol::ControlMessage;
use crate::session::{ConversationTurn, DetachConnection, LifecycleManager};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the idle watchdog wakes up.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Identity parsed from the handshake query string.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeIdentity {
    pub session_id: String,
    pub user_id: String,
    /// True when either identifier was generated rather than supplied
    pub generated: bool,
}

/// Resolve `session_id`/`user_id` from the handshake parameters.
///
/// ## Permissive vs strict:
/// The permissive default substitutes a generated session id and an
/// anonymous user id when parameters are missing, favoring resilience over
/// strictness. Strict mode rejects the upgrade instead, since silent
/// fallback can mask client bugs.
pub fn resolve_identity(
    params: &HashMap<String, String>,
    strict: bool,
) -> VoiceResult<HandshakeIdentity> {
    let session_id = params.get("session_id").filter(|s| !s.is_empty());
    let user_id = params.get("user_id").filter(|s| !s.is_empty());

    if strict {
        let session_id = session_id.ok_or_else(|| {
            VoiceError::ProtocolViolation("missing session_id handshake parameter".to_string())
        })?;
        let user_id = user_id.ok_or_else(|| {
            VoiceError::ProtocolViolation("missing user_id handshake parameter".to_string())
        })?;
        return Ok(HandshakeIdentity {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            generated: false,
        });
    }

    let generated = session_id.is_none() || user_id.is_none();
    Ok(HandshakeIdentity {
        session_id: session_id
            .cloned()
            .unwrap_or_else(|| format!("session-{}", Uuid::new_v4())),
        user_id: user_id.cloned().unwrap_or_else(|| "anonymous".to_string()),
        generated,
    })
}

/// WebSocket actor owning one server-side connection.
pub struct VoiceWebSocket {
    identity: HandshakeIdentity,

    /// Distinguishes this connection from a successor on the same session
    /// in the lifecycle registry
    connection_id: Uuid,

    app_state: AppState,
    lifecycle: Arc<LifecycleManager>,
    pipeline: Arc<dyn InferencePipeline>,

    /// Audio input into this connection's pipeline instance; dropped on
    /// stop, which ends the pipeline
    audio_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Last time any frame arrived from the client
    last_activity: Instant,

    /// Set once a close has been initiated, so late pipeline events and
    /// watchdog ticks do not double-close
    closing: bool,
}

impl VoiceWebSocket {
    pub fn new(
        identity: HandshakeIdentity,
        app_state: AppState,
        lifecycle: Arc<LifecycleManager>,
        pipeline: Arc<dyn InferencePipeline>,
    ) -> Self {
        Self {
            identity,
            connection_id: Uuid::new_v4(),
            app_state,
            lifecycle,
            pipeline,
            audio_tx: None,
            last_activity: Instant::now(),
            closing: false,
        }
    }

    /// Send a control message as a text frame.
    fn send_control(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ControlMessage) {
        match message.to_wire() {
            Ok(json) => {
                ctx.text(json);
                self.app_state.record_control_out();
            }
            Err(err) => error!(session_id = %self.identity.session_id, %err, "control serialization failed"),
        }
    }

    /// Send an error control message, then close.
    fn fail_connection(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        message: &str,
        reason: ws::CloseCode,
    ) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.send_control(ctx, &ControlMessage::error(message));
        ctx.close(Some(ws::CloseReason {
            code: reason,
            description: Some(message.to_string()),
        }));
        ctx.stop();
    }

    /// Handle one inbound binary audio frame.
    fn handle_audio_frame(&mut self, data: &[u8]) {
        self.last_activity = Instant::now();

        let Some(audio_tx) = &self.audio_tx else {
            // Pipeline not up yet; nothing to do with the frame
            self.app_state.record_frame_dropped();
            return;
        };

        match audio_tx.try_send(data.to_vec()) {
            Ok(()) => self.app_state.record_audio_in(),
            Err(_) => {
                // Backpressure point: a stuck pipeline sheds frames instead
                // of blocking the receive loop
                self.app_state.record_frame_dropped();
                debug!(
                    session_id = %self.identity.session_id,
                    bytes = data.len(),
                    "pipeline queue full, audio frame dropped"
                );
            }
        }
    }

    /// Idle watchdog: a connection with no client activity past the
    /// configured timeout is force-closed and its session marked errored,
    /// never ended, so clients can tell a forced close from a voluntary one.
    fn check_idle(&mut self, ctx: &mut ws::WebsocketContext<Self>, timeout: Duration) {
        if self.closing || self.last_activity.elapsed() < timeout {
            return;
        }
        self.expire_idle();
        self.fail_connection(ctx, "session idle timeout", ws::CloseCode::Policy);
    }

    /// Count a client text frame. Clients never legitimately send text.
    fn record_client_text_violation(&mut self, len: usize) {
        warn!(
            session_id = %self.identity.session_id,
            len,
            "unexpected text frame from client"
        );
        self.app_state.record_protocol_violation();
    }

    /// Session-side consequences of an idle expiry: counters plus the
    /// `errored` transition in the store.
    fn expire_idle(&mut self) {
        warn!(
            session_id = %self.identity.session_id,
            idle_secs = self.last_activity.elapsed().as_secs(),
            "idle timeout, forcing session closed"
        );
        self.app_state.record_idle_timeout();
        self.app_state.record_errored_session("idle_timeout");

        let lifecycle = self.lifecycle.clone();
        let session_id = self.identity.session_id.clone();
        let connection_id = self.connection_id;
        tokio::spawn(async move {
            lifecycle.detach(&session_id, connection_id);
            lifecycle.mark_errored(&session_id, "idle timeout").await;
        });
    }

    /// Record a pipeline failure as a system turn, error the session, and
    /// close the connection with an error control message first.
    fn handle_pipeline_error(&mut self, ctx: &mut ws::WebsocketContext<Self>, message: String) {
        error!(session_id = %self.identity.session_id, %message, "pipeline error");
        self.app_state.record_errored_session("pipeline");

        let lifecycle = self.lifecycle.clone();
        let session_id = self.identity.session_id.clone();
        let connection_id = self.connection_id;
        let turn_text = format!("session error: {}", message);
        tokio::spawn(async move {
            lifecycle
                .append_turn(&session_id, ConversationTurn::new("system", turn_text))
                .await;
            lifecycle.detach(&session_id, connection_id);
            lifecycle.mark_errored(&session_id, "pipeline error").await;
        });

        self.fail_connection(ctx, &message, ws::CloseCode::Error);
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            session_id = %self.identity.session_id,
            user_id = %self.identity.user_id,
            generated = self.identity.generated,
            "voice connection started"
        );
        self.app_state.connection_opened();

        let config = self.app_state.get_config();

        // Start this connection's pipeline instance and feed its events
        // into the actor as a stream.
        let io = self.pipeline.start(
            PipelineContext {
                session_id: self.identity.session_id.clone(),
                user_id: self.identity.user_id.clone(),
            },
            config.transport.pipeline_queue_frames,
        );
        self.audio_tx = Some(io.audio_tx);
        ctx.add_stream(ReceiverStream::new(io.events));

        // Bind the connection to its session (creates the record for
        // fallback identifiers, marks it active, registers for detach).
        let lifecycle = self.lifecycle.clone();
        let session_id = self.identity.session_id.clone();
        let user_id = self.identity.user_id.clone();
        let connection_id = self.connection_id;
        let recipient = ctx.address().recipient::<DetachConnection>();
        tokio::spawn(async move {
            lifecycle
                .attach(&session_id, &user_id, connection_id, recipient)
                .await;
        });

        // Idle watchdog
        let timeout = Duration::from_secs(config.session.idle_timeout_secs);
        ctx.run_interval(IDLE_CHECK_INTERVAL, move |act, ctx| {
            act.check_idle(ctx, timeout);
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.identity.session_id, "voice connection stopped");
        self.app_state.connection_closed();

        // Dropping the sender ends the pipeline instance
        self.audio_tx = None;

        // Detaching does not end the session; a reconnect reuses it. The
        // connection id guards against evicting a successor that already
        // superseded this connection.
        self.lifecycle.detach(&self.identity.session_id, self.connection_id);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.handle_audio_frame(&data);
            }
            Ok(ws::Message::Text(text)) => {
                // Clients only send binary audio on this transport; any text
                // frame is a protocol violation and closes the connection.
                self.record_client_text_violation(text.len());
                self.fail_connection(
                    ctx,
                    "protocol violation: clients send binary audio frames only",
                    ws::CloseCode::Protocol,
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_activity = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_activity = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.identity.session_id, ?reason, "client closed connection");
                self.closing = true;
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                self.app_state.record_protocol_violation();
                self.fail_connection(
                    ctx,
                    "protocol violation: continuation frames are not supported",
                    ws::CloseCode::Protocol,
                );
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.identity.session_id, %err, "websocket protocol error");
                self.closing = true;
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<PipelineEvent> for VoiceWebSocket {
    fn handle(&mut self, event: PipelineEvent, ctx: &mut Self::Context) {
        if self.closing {
            return;
        }
        match event {
            PipelineEvent::Audio(payload) => {
                self.app_state.record_audio_out();
                ctx.binary(payload);
            }
            PipelineEvent::Text(text) => {
                // Assistant text is part of the durable conversation
                let lifecycle = self.lifecycle.clone();
                let session_id = self.identity.session_id.clone();
                let turn = ConversationTurn::new("assistant", text.clone());
                tokio::spawn(async move {
                    lifecycle.append_turn(&session_id, turn).await;
                });
                self.send_control(ctx, &ControlMessage::Text { text });
            }
            PipelineEvent::Status(status) => {
                self.send_control(ctx, &ControlMessage::Status { status });
            }
            PipelineEvent::FunctionCall { function, result } => {
                self.send_control(ctx, &ControlMessage::FunctionCall { function, result });
            }
            PipelineEvent::Error(message) => {
                self.handle_pipeline_error(ctx, message);
            }
        }
    }

    /// The pipeline event stream ended without an error event; the
    /// connection has nothing left to relay.
    fn finished(&mut self, ctx: &mut Self::Context) {
        if self.closing {
            return;
        }
        debug!(session_id = %self.identity.session_id, "pipeline event stream ended");
        self.closing = true;
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: Some("pipeline finished".to_string()),
        }));
        ctx.stop();
    }
}

impl Handler<DetachConnection> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: DetachConnection, ctx: &mut Self::Context) {
        info!(
            session_id = %self.identity.session_id,
            reason = %msg.reason,
            "connection detached by lifecycle manager"
        );
        if self.closing {
            return;
        }
        self.closing = true;
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: Some(msg.reason),
        }));
        ctx.stop();
    }
}

/// WebSocket endpoint handler: upgrades the HTTP request and hands the
/// connection to a fresh `VoiceWebSocket` actor.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
    lifecycle: web::Data<LifecycleManager>,
    pipeline: web::Data<dyn InferencePipeline>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "websocket upgrade request");

    let params = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .map(|q| q.into_inner())
        .unwrap_or_default();

    let config = app_state.get_config();
    let identity = resolve_identity(&params, config.session.strict_handshake)?;

    let websocket = VoiceWebSocket::new(
        identity,
        app_state.get_ref().clone(),
        lifecycle.clone().into_inner(),
        pipeline.clone().into_inner(),
    );

    ws::start(websocket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::EchoPipeline;
    use crate::session::{InMemorySessionStore, SessionState};
    use crate::session::store::SessionStore;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_identity_passthrough() {
        let identity =
            resolve_identity(&params(&[("session_id", "s1"), ("user_id", "u1")]), false).unwrap();
        assert_eq!(identity.session_id, "s1");
        assert_eq!(identity.user_id, "u1");
        assert!(!identity.generated);
    }

    #[test]
    fn test_identity_fallback_generation() {
        let identity = resolve_identity(&params(&[]), false).unwrap();
        assert!(identity.session_id.starts_with("session-"));
        assert_eq!(identity.user_id, "anonymous");
        assert!(identity.generated);

        // Two fallback identities never collide
        let other = resolve_identity(&params(&[]), false).unwrap();
        assert_ne!(identity.session_id, other.session_id);
    }

    #[test]
    fn test_identity_empty_values_treated_as_missing() {
        let identity =
            resolve_identity(&params(&[("session_id", ""), ("user_id", "u1")]), false).unwrap();
        assert!(identity.generated);
        assert_eq!(identity.user_id, "u1");
    }

    #[test]
    fn test_strict_mode_rejects_missing_identifiers() {
        let err = resolve_identity(&params(&[("user_id", "u1")]), true).unwrap_err();
        assert!(matches!(err, VoiceError::ProtocolViolation(_)));

        let err = resolve_identity(&params(&[("session_id", "s1")]), true).unwrap_err();
        assert!(matches!(err, VoiceError::ProtocolViolation(_)));

        assert!(resolve_identity(
            &params(&[("session_id", "s1"), ("user_id", "u1")]),
            true
        )
        .is_ok());
    }

    fn test_actor(session_id: &str, lifecycle: Arc<LifecycleManager>) -> VoiceWebSocket {
        VoiceWebSocket::new(
            HandshakeIdentity {
                session_id: session_id.to_string(),
                user_id: "u1".to_string(),
                generated: false,
            },
            AppState::new(AppConfig::default()),
            lifecycle,
            Arc::new(EchoPipeline::default()),
        )
    }

    fn lifecycle_with_store() -> (Arc<LifecycleManager>, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        (Arc::new(LifecycleManager::new(store.clone())), store)
    }

    #[actix_rt::test]
    async fn test_binary_frames_reach_pipeline_in_order() {
        let (lifecycle, _) = lifecycle_with_store();
        let mut actor = test_actor("s1", lifecycle);
        let (tx, mut rx) = mpsc::channel(4);
        actor.audio_tx = Some(tx);

        actor.handle_audio_frame(&[1, 0]);
        actor.handle_audio_frame(&[2, 0]);
        actor.handle_audio_frame(&[3, 0]);

        assert_eq!(rx.recv().await.unwrap(), vec![1, 0]);
        assert_eq!(rx.recv().await.unwrap(), vec![2, 0]);
        assert_eq!(rx.recv().await.unwrap(), vec![3, 0]);

        let snapshot = actor.app_state.get_metrics_snapshot();
        assert_eq!(snapshot.audio_frames_in, 3);
        assert_eq!(snapshot.frames_dropped, 0);
    }

    #[actix_rt::test]
    async fn test_full_pipeline_queue_sheds_frames() {
        let (lifecycle, _) = lifecycle_with_store();
        let mut actor = test_actor("s1", lifecycle);
        let (tx, _rx) = mpsc::channel(1);
        actor.audio_tx = Some(tx);

        actor.handle_audio_frame(&[1, 0]);
        // Queue depth is 1 and nothing drains it; this frame is shed
        actor.handle_audio_frame(&[2, 0]);

        let snapshot = actor.app_state.get_metrics_snapshot();
        assert_eq!(snapshot.audio_frames_in, 1);
        assert_eq!(snapshot.frames_dropped, 1);
    }

    /// Idle expiry marks the session `errored`, never `ended`, so clients
    /// can tell a forced close from a voluntary one.
    #[actix_rt::test]
    async fn test_idle_expiry_marks_session_errored() {
        let (lifecycle, store) = lifecycle_with_store();
        store.create_session("s1", "u1").await.unwrap();
        store.mark_active("s1").await.unwrap();

        let mut actor = test_actor("s1", lifecycle);
        actor.expire_idle();

        // The store transition runs on a spawned task
        let mut state = None;
        for _ in 0..100 {
            state = store.get_session("s1").await.unwrap().map(|r| r.state);
            if state == Some(SessionState::Errored) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state, Some(SessionState::Errored));

        let snapshot = actor.app_state.get_metrics_snapshot();
        assert_eq!(snapshot.idle_timeouts, 1);
        assert_eq!(snapshot.errored_sessions.get("idle_timeout"), Some(&1));
    }

    #[actix_rt::test]
    async fn test_client_text_frame_counted_as_violation() {
        let (lifecycle, _) = lifecycle_with_store();
        let mut actor = test_actor("s1", lifecycle);
        actor.record_client_text_violation(17);
        assert_eq!(
            actor.app_state.get_metrics_snapshot().protocol_violations,
            1
        );
    }
}

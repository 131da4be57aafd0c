//! # Error Handling
//!
//! Defines the error taxonomy for the voice transport and how server-side
//! errors are converted to HTTP responses during the WebSocket upgrade.
//!
//! ## Error Categories:
//! - **CaptureUnavailable / CaptureInterrupted**: client input device errors
//! - **PlaybackUnavailable**: client output device errors
//! - **Connection / ReconnectExhausted**: client transport errors
//! - **ProtocolViolation**: server received a malformed or unexpected frame
//! - **Pipeline**: unrecoverable inference pipeline failure
//! - **Store**: persistence failure during a lifecycle operation
//! - **TerminalSession**: a transition was requested on an ended/errored session
//! - **Config**: configuration loading or validation problems
//!
//! ## Propagation policy:
//! Connection errors are retried locally by the client's backoff policy and
//! only surfaced after exhaustion (`ReconnectExhausted`). Capture errors are
//! surfaced immediately with no local retry. Pipeline errors terminate the
//! session and are sent to the client as an `error` control message before
//! the connection closes. Store errors propagate synchronously from
//! `create_session` and are best-effort (logged) everywhere else.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// All error conditions defined by the voice transport.
#[derive(Debug, Clone)]
pub enum VoiceError {
    /// The capture device could not be acquired (missing device,
    /// permission denied, unsupported format).
    CaptureUnavailable(String),

    /// The capture device was lost mid-stream. Emission stops; the caller
    /// must restart capture explicitly.
    CaptureInterrupted(String),

    /// The playback device could not be acquired or started.
    PlaybackUnavailable(String),

    /// A transport connection attempt or an established connection failed.
    Connection(String),

    /// The client exhausted its reconnect attempts. Terminal: no further
    /// retries happen without an explicit new `connect()` call.
    ReconnectExhausted {
        /// Number of attempts made before giving up
        attempts: u32,
    },

    /// The peer sent a frame the protocol does not allow (e.g. a text frame
    /// from a client, which only sends binary audio).
    ProtocolViolation(String),

    /// The inference pipeline reported an unrecoverable failure.
    Pipeline(String),

    /// The persistent store failed during a lifecycle operation.
    Store(String),

    /// A lifecycle transition was requested on a session already in a
    /// terminal state. Terminal states accept nothing but same-state no-ops.
    TerminalSession {
        session_id: String,
        /// The terminal state the session is in ("ended" or "errored")
        state: &'static str,
    },

    /// Configuration loading or validation failed.
    Config(String),
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::CaptureUnavailable(msg) => write!(f, "capture unavailable: {}", msg),
            VoiceError::CaptureInterrupted(msg) => write!(f, "capture interrupted: {}", msg),
            VoiceError::PlaybackUnavailable(msg) => write!(f, "playback unavailable: {}", msg),
            VoiceError::Connection(msg) => write!(f, "connection error: {}", msg),
            VoiceError::ReconnectExhausted { attempts } => {
                write!(f, "reconnect exhausted after {} attempts", attempts)
            }
            VoiceError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            VoiceError::Pipeline(msg) => write!(f, "pipeline error: {}", msg),
            VoiceError::Store(msg) => write!(f, "store error: {}", msg),
            VoiceError::TerminalSession { session_id, state } => {
                write!(f, "session '{}' is {} and accepts no transitions", session_id, state)
            }
            VoiceError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for VoiceError {}

/// HTTP mapping for errors that surface before or during the WebSocket
/// upgrade (handshake rejection in strict mode, store failures on session
/// creation, config problems).
///
/// ## Status Code Mapping:
/// - ProtocolViolation → 400 (the client's handshake was malformed)
/// - TerminalSession → 409 (the session can no longer transition)
/// - Store/Config/Pipeline → 500
/// - Remaining variants are client-side and only reach this surface through
///   a malformed request, so they map to 400.
impl ResponseError for VoiceError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type) = match self {
            VoiceError::ProtocolViolation(_) => {
                (actix_web::http::StatusCode::BAD_REQUEST, "protocol_violation")
            }
            VoiceError::TerminalSession { .. } => {
                (actix_web::http::StatusCode::CONFLICT, "terminal_session")
            }
            VoiceError::Store(_) => {
                (actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, "store_error")
            }
            VoiceError::Config(_) => {
                (actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, "config_error")
            }
            VoiceError::Pipeline(_) => {
                (actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, "pipeline_error")
            }
            _ => (actix_web::http::StatusCode::BAD_REQUEST, "transport_error"),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::ProtocolViolation(format!("invalid control JSON: {}", err))
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

/// Shorthand for results using the transport error type.
pub type VoiceResult<T> = Result<T, VoiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VoiceError::ReconnectExhausted { attempts: 5 };
        assert_eq!(err.to_string(), "reconnect exhausted after 5 attempts");

        let err = VoiceError::CaptureUnavailable("no input device".to_string());
        assert!(err.to_string().contains("no input device"));

        let err = VoiceError::PlaybackUnavailable("no output device".to_string());
        assert_eq!(err.to_string(), "playback unavailable: no output device");

        let err = VoiceError::TerminalSession {
            session_id: "s1".to_string(),
            state: "ended",
        };
        assert_eq!(err.to_string(), "session 's1' is ended and accepts no transitions");
    }

    #[test]
    fn test_http_mapping() {
        let err = VoiceError::ProtocolViolation("missing session_id".to_string());
        let resp = err.error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let err = VoiceError::Store("connection refused".to_string());
        let resp = err.error_response();
        assert_eq!(
            resp.status(),
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
        );

        let err = VoiceError::TerminalSession {
            session_id: "s1".to_string(),
            state: "errored",
        };
        let resp = err.error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::CONFLICT);
    }
}

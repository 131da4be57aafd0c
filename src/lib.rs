//! # Voice Shopper Transport
//!
//! Real-time voice session transport: a bidirectional WebSocket channel
//! carrying binary audio frames (16kHz mono 16-bit LE PCM) interleaved with
//! JSON control messages, plus the session lifecycle around it.
//!
//! ## Layout:
//! - **protocol**: wire format (audio framing + control messages)
//! - **session**: session state machine, persistent-store seam, lifecycle
//! - **pipeline**: inference backend seam + echo reference backend
//! - **websocket**: server-side connection actor and `/ws` endpoint
//! - **client**: reconnecting transport client, microphone capture,
//!   playback scheduling
//! - **config / state / health / error**: server runtime plumbing

pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod state;
pub mod websocket;

pub use client::{ClientConfig, SessionTransportClient, TransportEvent};
pub use config::AppConfig;
pub use error::{VoiceError, VoiceResult};
pub use pipeline::{InferencePipeline, PipelineEvent};
pub use protocol::{ControlMessage, SessionStatus};
pub use session::{LifecycleManager, SessionState, SessionStore};
pub use state::AppState;

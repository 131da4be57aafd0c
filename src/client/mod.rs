//! # Voice Session Client
//!
//! Client side of the voice transport: a reconnecting WebSocket transport,
//! microphone capture feeding fixed-size PCM frames, and a playback
//! scheduler that plays received audio segments back-to-back in arrival
//! order.
//!
//! ## Key Components:
//! - **Transport**: `SessionTransportClient` with exponential-backoff
//!   reconnect and a drop-instead-of-block send policy
//! - **Capture**: `MicrophoneCapture` + `FrameEncoder` (downmix, resample
//!   to 16kHz, fixed-size chunking)
//! - **Playback**: `PlaybackScheduler` + `PlaybackSink` output seam

pub mod capture;
pub mod playback;
pub mod transport;

pub use capture::{CaptureEvent, FrameEncoder, MicrophoneCapture};
pub use playback::{PlaybackScheduler, PlaybackSink};
pub use transport::{ClientConfig, SessionTransportClient, TransportEvent};

//! # Inference Pipeline Seam
//!
//! The speech pipeline (voice-activity detection → transcription → language
//! model turn → speech synthesis) is an external collaborator. This module
//! defines the seam the transport talks to: a pipeline consumes a continuous
//! stream of decoded audio chunks and asynchronously emits typed outputs,
//! with no guaranteed 1:1 correlation between input chunks and outputs (the
//! pipeline buffers and aggregates internally).
//!
//! ## Concurrency:
//! `start` is called once per connection and returns channel endpoints.
//! The audio input channel is bounded; a full queue is the transport's
//! backpressure point and the server drops (and counts) frames rather than
//! blocking its receive loop. Each pipeline instance is exclusively owned
//! by the connection that created it.

pub mod echo;

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::SessionStatus;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use echo::EchoPipeline;

/// Identity of the session a pipeline instance serves.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub session_id: String,
    pub user_id: String,
}

/// Typed outputs emitted by a pipeline instance.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Synthesized audio, 16kHz mono 16-bit LE PCM
    Audio(Vec<u8>),

    /// Transcript or spoken-response text
    Text(String),

    /// Pipeline phase transition
    Status(SessionStatus),

    /// A tool invocation and its result
    FunctionCall {
        function: String,
        result: Option<serde_json::Value>,
    },

    /// Unrecoverable pipeline failure; the transport terminates the session
    Error(String),
}

/// Channel endpoints for one running pipeline instance.
pub struct PipelineIo {
    /// Audio chunks flow in here; dropping the sender ends the pipeline
    pub audio_tx: mpsc::Sender<Vec<u8>>,

    /// Pipeline outputs flow out here
    pub events: mpsc::Receiver<PipelineEvent>,
}

/// Factory for per-connection pipeline instances.
///
/// Implementations spawn whatever tasks they need and communicate solely
/// through the returned channels, keeping the transport free of pipeline
/// internals.
pub trait InferencePipeline: Send + Sync {
    /// Start a pipeline instance for one connection.
    ///
    /// `queue_depth` bounds the audio input channel; see the module docs
    /// for the backpressure contract.
    fn start(&self, ctx: PipelineContext, queue_depth: usize) -> PipelineIo;
}

/// Resolve a pipeline backend by its configured name.
///
/// The reference server ships only the `echo` backend; real speech backends
/// live behind the same trait in their own crates.
pub fn build_backend(name: &str) -> VoiceResult<Arc<dyn InferencePipeline>> {
    match name {
        "echo" => Ok(Arc::new(EchoPipeline::default())),
        other => Err(VoiceError::Config(format!(
            "unknown pipeline backend '{}'",
            other
        ))),
    }
}

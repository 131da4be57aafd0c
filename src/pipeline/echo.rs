//! # Echo Pipeline Backend
//!
//! Reference pipeline used by the reference server and the transport tests.
//! It buffers inbound audio and, once roughly a second has accumulated,
//! walks the status transitions a real speech backend would
//! (listening → thinking → speaking → listening) and echoes the buffered
//! audio back as its "synthesized" response.
//!
//! Useful for exercising the full transport path — framing, status
//! multiplexing, playback — without any model downloads.

use super::{InferencePipeline, PipelineContext, PipelineEvent, PipelineIo};
use crate::protocol::{self, SessionStatus};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Echoes buffered audio back after a configurable accumulation threshold.
pub struct EchoPipeline {
    /// Bytes of audio to accumulate before responding
    turn_threshold_bytes: usize,
}

impl Default for EchoPipeline {
    fn default() -> Self {
        Self {
            // One second of 16kHz mono 16-bit audio
            turn_threshold_bytes: protocol::SAMPLE_RATE as usize * protocol::BYTES_PER_SAMPLE,
        }
    }
}

impl EchoPipeline {
    pub fn new(turn_threshold_bytes: usize) -> Self {
        Self {
            turn_threshold_bytes,
        }
    }
}

impl InferencePipeline for EchoPipeline {
    fn start(&self, ctx: PipelineContext, queue_depth: usize) -> PipelineIo {
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(queue_depth);
        let (event_tx, events) = mpsc::channel::<PipelineEvent>(queue_depth);
        let threshold = self.turn_threshold_bytes;

        tokio::spawn(async move {
            info!(session_id = %ctx.session_id, "echo pipeline started");

            if event_tx
                .send(PipelineEvent::Status(SessionStatus::Listening))
                .await
                .is_err()
            {
                return;
            }

            let mut turn: Vec<u8> = Vec::new();
            while let Some(chunk) = audio_rx.recv().await {
                turn.extend_from_slice(&chunk);
                if turn.len() < threshold {
                    continue;
                }

                debug!(
                    session_id = %ctx.session_id,
                    bytes = turn.len(),
                    "echoing accumulated turn"
                );

                let audio = std::mem::take(&mut turn);
                let sequence = [
                    PipelineEvent::Status(SessionStatus::Thinking),
                    PipelineEvent::Text(format!(
                        "echoing {:.1}s of audio",
                        protocol::payload_duration_secs(audio.len())
                    )),
                    PipelineEvent::Status(SessionStatus::Speaking),
                    PipelineEvent::Audio(audio),
                    PipelineEvent::Status(SessionStatus::Listening),
                ];
                for event in sequence {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }

            info!(session_id = %ctx.session_id, "echo pipeline input closed");
        });

        PipelineIo { audio_tx, events }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PipelineContext {
        PipelineContext {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_echo_turn_sequence() {
        let pipeline = EchoPipeline::new(8);
        let mut io = pipeline.start(ctx(), 16);

        // Initial status before any audio
        match io.events.recv().await.unwrap() {
            PipelineEvent::Status(SessionStatus::Listening) => {}
            other => panic!("unexpected event: {:?}", other),
        }

        io.audio_tx.send(vec![1, 0, 2, 0]).await.unwrap();
        io.audio_tx.send(vec![3, 0, 4, 0]).await.unwrap();

        // thinking, text, speaking, audio (echoed bytes in order), listening
        assert!(matches!(
            io.events.recv().await.unwrap(),
            PipelineEvent::Status(SessionStatus::Thinking)
        ));
        assert!(matches!(
            io.events.recv().await.unwrap(),
            PipelineEvent::Text(_)
        ));
        assert!(matches!(
            io.events.recv().await.unwrap(),
            PipelineEvent::Status(SessionStatus::Speaking)
        ));
        match io.events.recv().await.unwrap() {
            PipelineEvent::Audio(bytes) => assert_eq!(bytes, vec![1, 0, 2, 0, 3, 0, 4, 0]),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            io.events.recv().await.unwrap(),
            PipelineEvent::Status(SessionStatus::Listening)
        ));
    }

    #[tokio::test]
    async fn test_pipeline_ends_when_input_closes() {
        let pipeline = EchoPipeline::default();
        let io = pipeline.start(ctx(), 4);
        let mut events = io.events;

        // Consume the initial status, drop the input, and the event stream
        // must terminate.
        assert!(matches!(
            events.recv().await.unwrap(),
            PipelineEvent::Status(SessionStatus::Listening)
        ));
        drop(io.audio_tx);
        assert!(events.recv().await.is_none());
    }
}

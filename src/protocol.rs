//! # Voice Transport Wire Protocol
//!
//! Defines the two kinds of traffic that cross a voice session connection:
//!
//! - **Audio Frames**: binary WebSocket messages carrying raw PCM audio
//!   (16kHz, 16-bit signed little-endian, mono, no header). One WebSocket
//!   message is one audio chunk; the transport's own framing is the only
//!   framing.
//! - **Control Messages**: text WebSocket messages carrying a JSON object
//!   with a `type` tag and a `type`-specific `data` payload.
//!
//! ## Frame Type Purity:
//! Audio and control traffic are never mixed inside one frame. Receivers
//! dispatch purely on the transport-level frame type: binary frames are
//! always audio, text frames are always control. This is enforced by
//! construction — there is no code path that serializes a `ControlMessage`
//! into a binary frame or audio into a text frame.
//!
//! ## Wire Shape:
//! ```json
//! { "type": "status", "data": { "status": "searching" } }
//! { "type": "text", "data": { "text": "Here are three options..." } }
//! { "type": "function_call", "data": { "function": "search_products", "result": [...] } }
//! { "type": "error", "data": { "message": "pipeline failure" } }
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Canonical sample rate for all audio frames (Hz).
pub const SAMPLE_RATE: u32 = 16_000;

/// Audio frames are mono.
pub const CHANNELS: u8 = 1;

/// Audio frames are 16-bit signed PCM.
pub const BIT_DEPTH: u8 = 16;

/// Number of bytes per PCM sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Structured control messages exchanged over the text side of a connection.
///
/// ## Direction:
/// All four variants can flow server → client. Clients normally send only
/// binary audio; a client-originated text frame is treated as a protocol
/// violation by the server, so client-side `send_control` exists primarily
/// for forward compatibility and tests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ControlMessage {
    /// A transcript or spoken-response text.
    Text {
        /// The transcript or response text
        text: String,
    },

    /// A session status transition.
    Status {
        /// New status of the session's pipeline
        status: SessionStatus,
    },

    /// A pipeline tool invocation surfaced to the client.
    FunctionCall {
        /// Name of the invoked function (e.g. "search_products")
        function: String,
        /// Function result, if one was produced
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },

    /// A fatal or protocol-level error.
    Error {
        /// Human-readable error message
        message: String,
    },
}

impl ControlMessage {
    /// Serialize this message to its JSON wire form.
    ///
    /// Control messages are always sent as text frames; callers pass the
    /// returned string to the transport's text-send path.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a control message from its JSON wire form.
    pub fn from_wire(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Shorthand for an error control message.
    pub fn error(message: impl Into<String>) -> Self {
        ControlMessage::Error {
            message: message.into(),
        }
    }
}

/// Pipeline status values surfaced to clients via `status` control messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for user speech
    Listening,
    /// Running the language-model turn
    Thinking,
    /// Streaming synthesized audio back
    Speaking,
    /// A product search is in flight
    Searching,
}

impl SessionStatus {
    /// Status string as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Listening => "listening",
            SessionStatus::Thinking => "thinking",
            SessionStatus::Speaking => "speaking",
            SessionStatus::Searching => "searching",
        }
    }
}

/// Decode a binary audio frame into 16-bit samples.
///
/// ## Validation:
/// - The payload must be non-empty.
/// - The payload length must be even (16-bit samples).
///
/// Returns a description of the problem on malformed payloads; callers
/// decide whether that drops the frame (playback) or the connection
/// (server-side protocol violation handling does not apply here — any
/// binary payload is accepted as audio and validated at decode time).
pub fn decode_pcm(payload: &[u8]) -> Result<Vec<i16>, String> {
    if payload.is_empty() {
        return Err("audio frame is empty".to_string());
    }
    if payload.len() % BYTES_PER_SAMPLE != 0 {
        return Err(format!(
            "audio frame length {} is not a whole number of 16-bit samples",
            payload.len()
        ));
    }

    let mut cursor = Cursor::new(payload);
    let mut samples = Vec::with_capacity(payload.len() / BYTES_PER_SAMPLE);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode 16-bit samples into a binary audio frame payload.
pub fn encode_pcm(samples: &[i16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = payload.write_i16::<LittleEndian>(sample);
    }
    payload
}

/// Duration in seconds of a PCM payload at the canonical rate.
pub fn payload_duration_secs(payload_len: usize) -> f64 {
    (payload_len / BYTES_PER_SAMPLE) as f64 / SAMPLE_RATE as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_wire_shape() {
        let msg = ControlMessage::Status {
            status: SessionStatus::Searching,
        };
        let json = msg.to_wire().unwrap();
        assert_eq!(json, r#"{"type":"status","data":{"status":"searching"}}"#);

        let msg = ControlMessage::Text {
            text: "hello".to_string(),
        };
        let json = msg.to_wire().unwrap();
        assert_eq!(json, r#"{"type":"text","data":{"text":"hello"}}"#);
    }

    #[test]
    fn test_function_call_round_trip() {
        let msg = ControlMessage::FunctionCall {
            function: "search_products".to_string(),
            result: Some(serde_json::json!({ "count": 3 })),
        };
        let json = msg.to_wire().unwrap();
        assert!(json.contains(r#""type":"function_call""#));
        assert_eq!(ControlMessage::from_wire(&json).unwrap(), msg);

        // `result` is omitted entirely when absent
        let msg = ControlMessage::FunctionCall {
            function: "save_item".to_string(),
            result: None,
        };
        let json = msg.to_wire().unwrap();
        assert!(!json.contains("result"));
    }

    #[test]
    fn test_error_message_round_trip() {
        let msg = ControlMessage::error("pipeline failure");
        let json = msg.to_wire().unwrap();
        let parsed = ControlMessage::from_wire(&json).unwrap();
        match parsed {
            ControlMessage::Error { message } => assert_eq!(message, "pipeline failure"),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    /// An audio payload is never a well-formed control message and a
    /// control message is never a decodable audio frame dispatched as such —
    /// classification happens purely on frame type, so the encoders must
    /// produce disjoint representations.
    #[test]
    fn test_frame_type_purity() {
        let audio = encode_pcm(&[0, 100, -100, i16::MAX, i16::MIN]);
        // Binary payloads are not valid UTF-8 JSON control messages in general;
        // even when they happen to be UTF-8, parsing must fail.
        if let Ok(text) = std::str::from_utf8(&audio) {
            assert!(ControlMessage::from_wire(text).is_err());
        }

        let control = ControlMessage::Status {
            status: SessionStatus::Listening,
        }
        .to_wire()
        .unwrap();
        // Control JSON is never handed to the PCM decoder by any dispatch
        // path; as a belt-and-braces check its odd length here fails decode.
        assert!(decode_pcm(control.as_bytes()).is_err() || control.len() % 2 == 0);
    }

    #[test]
    fn test_pcm_round_trip() {
        let samples = vec![0i16, 1, -1, 16384, -16384, i16::MAX, i16::MIN];
        let payload = encode_pcm(&samples);
        assert_eq!(payload.len(), samples.len() * BYTES_PER_SAMPLE);
        assert_eq!(decode_pcm(&payload).unwrap(), samples);
    }

    #[test]
    fn test_pcm_rejects_malformed_payloads() {
        assert!(decode_pcm(&[]).is_err());
        assert!(decode_pcm(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_payload_duration() {
        // One second of audio at 16kHz mono 16-bit is 32000 bytes
        let secs = payload_duration_secs(32_000);
        assert!((secs - 1.0).abs() < f64::EPSILON);
    }
}

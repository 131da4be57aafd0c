//! # Microphone Capture
//!
//! Captures microphone input with cpal and turns it into the fixed wire
//! format: 16kHz mono 16-bit little-endian PCM, chunked into fixed-size
//! frames. The cpal stream is not `Send`, so it lives on a dedicated thread
//! that owns it for its whole lifetime; frames cross back over a channel.
//!
//! ## Data flow:
//! device callback → `FrameEncoder` (downmix, resample, chunk) →
//! bounded channel → application → `SessionTransportClient::send_audio`
//!
//! The device callback never blocks: if the frame channel is full the frame
//! is dropped, matching the transport's drop-instead-of-block policy.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{self, encode_pcm};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// What the capture side reports to the application.
#[derive(Debug)]
pub enum CaptureEvent {
    /// One encoded wire-format audio frame
    Frame(Vec<u8>),
    /// The device stream failed; capture has stopped
    Interrupted(String),
}

/// Converts raw device samples into wire-format frames.
///
/// Stateful: carries the fractional resampler position and partial frames
/// across calls, so a continuous stream of device buffers produces a
/// continuous stream of fixed-size frames with no seams.
pub struct FrameEncoder {
    channels: u16,
    chunk_samples: usize,
    /// Source positions advanced per output sample
    step: f64,
    /// Fractional read position into `mono`
    pos: f64,
    /// Downmixed samples not yet consumed by the resampler
    mono: Vec<f32>,
    /// Resampled samples awaiting a full chunk
    pending: Vec<i16>,
}

impl FrameEncoder {
    pub fn new(source_rate: u32, channels: u16, chunk_samples: usize) -> Self {
        Self {
            channels,
            chunk_samples,
            step: source_rate as f64 / protocol::SAMPLE_RATE as f64,
            pos: 0.0,
            mono: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Feed one device buffer of interleaved f32 samples; returns the
    /// complete frames that became available.
    pub fn push_f32(&mut self, samples: &[f32]) -> Vec<Vec<u8>> {
        let channels = self.channels as usize;
        self.mono.extend(
            samples
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
        self.drain()
    }

    /// Feed one device buffer of interleaved i16 samples.
    pub fn push_i16(&mut self, samples: &[i16]) -> Vec<Vec<u8>> {
        let channels = self.channels as usize;
        self.mono.extend(
            samples
                .chunks_exact(channels)
                .map(|frame| {
                    frame.iter().map(|&s| s as f32).sum::<f32>()
                        / (channels as f32 * i16::MAX as f32)
                }),
        );
        self.drain()
    }

    /// Resample what the buffer holds and cut full frames.
    fn drain(&mut self) -> Vec<Vec<u8>> {
        // Linear interpolation needs the sample after the read position, so
        // always leave one behind for the next call.
        while (self.pos as usize) + 1 < self.mono.len() {
            let index = self.pos as usize;
            let frac = (self.pos - index as f64) as f32;
            let sample = self.mono[index] * (1.0 - frac) + self.mono[index + 1] * frac;
            self.pending
                .push((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
            self.pos += self.step;
        }

        let consumed = (self.pos as usize).min(self.mono.len().saturating_sub(1));
        self.mono.drain(..consumed);
        self.pos -= consumed as f64;

        let mut frames = Vec::new();
        while self.pending.len() >= self.chunk_samples {
            let chunk: Vec<i16> = self.pending.drain(..self.chunk_samples).collect();
            frames.push(encode_pcm(&chunk));
        }
        frames
    }
}

enum CaptureControl {
    Stop,
}

/// Handle to a running microphone capture.
pub struct MicrophoneCapture {
    control_tx: std::sync::mpsc::Sender<CaptureControl>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicrophoneCapture {
    /// Open the default input device and start capturing.
    ///
    /// Returns the handle plus the frame/event channel. Fails with
    /// `CaptureUnavailable` when there is no input device or its sample
    /// format is unsupported.
    pub fn start(chunk_samples: usize) -> VoiceResult<(Self, mpsc::Receiver<CaptureEvent>)> {
        let (event_tx, event_rx) = mpsc::channel::<CaptureEvent>(32);
        let (control_tx, control_rx) = std::sync::mpsc::channel::<CaptureControl>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<VoiceResult<()>>();

        let thread = thread::spawn(move || {
            // The stream must be built, played, and dropped on this thread.
            let stream = match build_input_stream(chunk_samples, event_tx.clone()) {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            if let Err(err) = stream.play() {
                let _ = ready_tx
                    .send(Err(VoiceError::CaptureUnavailable(format!(
                        "failed to start input stream: {}",
                        err
                    ))));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Park until stop; Err means the handle was dropped.
            let _ = control_rx.recv();
            info!("microphone capture stopped");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok((
                Self {
                    control_tx,
                    thread: Some(thread),
                },
                event_rx,
            )),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => Err(VoiceError::CaptureUnavailable(
                "capture thread exited before reporting readiness".to_string(),
            )),
        }
    }

    /// Stop capturing and release the device.
    pub fn stop(&mut self) {
        let _ = self.control_tx.send(CaptureControl::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input_stream(
    chunk_samples: usize,
    event_tx: mpsc::Sender<CaptureEvent>,
) -> VoiceResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        VoiceError::CaptureUnavailable("no default input device".to_string())
    })?;
    let supported = device.default_input_config().map_err(|err| {
        VoiceError::CaptureUnavailable(format!("no default input config: {}", err))
    })?;

    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.config();
    info!(
        device = device.name().unwrap_or_else(|_| "unknown".to_string()),
        rate = config.sample_rate.0,
        channels = config.channels,
        format = ?sample_format,
        "opening input device"
    );

    let mut encoder = FrameEncoder::new(config.sample_rate.0, config.channels, chunk_samples);
    let err_tx = event_tx.clone();
    let err_fn = move |err: cpal::StreamError| {
        error!(%err, "input stream error");
        let _ = err_tx.try_send(CaptureEvent::Interrupted(err.to_string()));
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device
            .build_input_stream(
                &config,
                move |data: &[f32], _| {
                    for frame in encoder.push_f32(data) {
                        if event_tx.try_send(CaptureEvent::Frame(frame)).is_err() {
                            warn!("capture channel full, frame dropped");
                        }
                    }
                },
                err_fn,
                None,
            )
            .map_err(|err| {
                VoiceError::CaptureUnavailable(format!("failed to build input stream: {}", err))
            })?,
        cpal::SampleFormat::I16 => device
            .build_input_stream(
                &config,
                move |data: &[i16], _| {
                    for frame in encoder.push_i16(data) {
                        if event_tx.try_send(CaptureEvent::Frame(frame)).is_err() {
                            warn!("capture channel full, frame dropped");
                        }
                    }
                },
                err_fn,
                None,
            )
            .map_err(|err| {
                VoiceError::CaptureUnavailable(format!("failed to build input stream: {}", err))
            })?,
        other => {
            return Err(VoiceError::CaptureUnavailable(format!(
                "unsupported input sample format: {:?}",
                other
            )))
        }
    };

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_pcm;

    #[test]
    fn test_mono_passthrough_chunking() {
        // 16kHz mono input resamples 1:1, so samples pass straight through
        let mut encoder = FrameEncoder::new(protocol::SAMPLE_RATE, 1, 4);
        let input: Vec<f32> = (0..9).map(|i| i as f32 / 100.0).collect();
        let frames = encoder.push_f32(&input);

        assert_eq!(frames.len(), 2);
        for frame in &frames {
            assert_eq!(frame.len(), 4 * protocol::BYTES_PER_SAMPLE);
        }
        let first = decode_pcm(&frames[0]).unwrap();
        let expected: Vec<i16> = (0..4)
            .map(|i| (i as f32 / 100.0 * i16::MAX as f32) as i16)
            .collect();
        assert_eq!(first, expected);
    }

    #[test]
    fn test_state_carries_across_buffers() {
        // The same samples split across two pushes produce the same frames
        let mut whole = FrameEncoder::new(protocol::SAMPLE_RATE, 1, 4);
        let mut split = FrameEncoder::new(protocol::SAMPLE_RATE, 1, 4);
        let input: Vec<f32> = (0..12).map(|i| (i as f32 - 6.0) / 50.0).collect();

        let frames_whole = whole.push_f32(&input);
        let mut frames_split = split.push_f32(&input[..5]);
        frames_split.extend(split.push_f32(&input[5..]));

        assert_eq!(frames_whole, frames_split);
    }

    #[test]
    fn test_stereo_downmix() {
        let mut encoder = FrameEncoder::new(protocol::SAMPLE_RATE, 2, 2);
        // Two stereo frames: (0.5, -0.5) averages to 0, (0.2, 0.4) to 0.3
        let frames = encoder.push_f32(&[0.5, -0.5, 0.2, 0.4, 0.0, 0.0]);
        assert_eq!(frames.len(), 1);
        let samples = decode_pcm(&frames[0]).unwrap();
        assert_eq!(samples[0], 0);
        let expected = (0.3f32 * i16::MAX as f32) as i16;
        assert!((samples[1] - expected).abs() <= 1);
    }

    #[test]
    fn test_clamping_out_of_range() {
        let mut encoder = FrameEncoder::new(protocol::SAMPLE_RATE, 1, 2);
        let frames = encoder.push_f32(&[2.0, -3.0, 0.0]);
        let samples = decode_pcm(&frames[0]).unwrap();
        assert_eq!(samples[0], i16::MAX);
        assert_eq!(samples[1], -i16::MAX);
    }

    #[test]
    fn test_downsample_48k_ratio() {
        // 48kHz input should yield roughly a third as many output samples
        let mut encoder = FrameEncoder::new(48_000, 1, 100);
        let input = vec![0.1f32; 48_000];
        let frames = encoder.push_f32(&input);
        let samples: usize = frames.len() * 100;
        assert!((15_800..=16_000).contains(&samples), "got {}", samples);
    }

    #[test]
    fn test_i16_input_scaling() {
        let mut encoder = FrameEncoder::new(protocol::SAMPLE_RATE, 1, 2);
        let frames = encoder.push_i16(&[i16::MAX, 0, 0]);
        let samples = decode_pcm(&frames[0]).unwrap();
        assert_eq!(samples[0], i16::MAX);
        assert_eq!(samples[1], 0);
    }
}

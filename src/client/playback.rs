//! # Playback Scheduler
//!
//! Plays received audio segments strictly in arrival order, back to back.
//! Decoding happens when a segment arrives; playback start waits until the
//! previous segment has finished, so a segment's start time equals its
//! predecessor's end time even when segments arrive in a burst.
//!
//! The actual audio output sits behind the `PlaybackSink` trait so the
//! scheduling logic is testable without a sound card; `CpalPlaybackSink`
//! is the real-device implementation.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{self, decode_pcm};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Output seam: commits decoded samples for immediate playback.
///
/// `play` must not block; the scheduler owns the pacing and calls it once
/// per segment, at that segment's start time.
pub trait PlaybackSink: Send + 'static {
    fn play(&mut self, samples: &[i16]);
}

/// Schedules decoded segments onto a sink, one at a time, in order.
pub struct PlaybackScheduler {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl PlaybackScheduler {
    /// Spawn the scheduling task. `max_buffer` is the backlog of queued
    /// audio beyond which the scheduler warns that playback is falling
    /// behind real time.
    pub fn start<S: PlaybackSink>(mut sink: S, max_buffer: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let task = tokio::spawn(async move {
            let mut queue: VecDeque<(Vec<i16>, Duration)> = VecDeque::new();
            let mut queued = Duration::ZERO;
            let mut playing_until: Option<Instant> = None;
            // End of the last scheduled segment; the next one starts here
            let mut cursor: Option<Instant> = None;
            let mut rx_open = true;

            loop {
                if playing_until.is_none() {
                    if let Some((samples, duration)) = queue.pop_front() {
                        queued = queued.saturating_sub(duration);
                        let now = Instant::now();
                        let start = cursor.filter(|&c| c > now).unwrap_or(now);
                        sink.play(&samples);
                        cursor = Some(start + duration);
                        playing_until = cursor;
                    } else if !rx_open {
                        break;
                    }
                }

                tokio::select! {
                    segment = rx.recv(), if rx_open => match segment {
                        Some(payload) => match decode_pcm(&payload) {
                            Ok(samples) => {
                                let duration = Duration::from_secs_f64(
                                    protocol::payload_duration_secs(payload.len()),
                                );
                                queued += duration;
                                if queued > max_buffer {
                                    warn!(
                                        backlog_ms = queued.as_millis() as u64,
                                        "playback falling behind"
                                    );
                                }
                                queue.push_back((samples, duration));
                            }
                            // A malformed segment is dropped, not fatal
                            Err(err) => warn!(%err, "undecodable audio segment dropped"),
                        },
                        None => rx_open = false,
                    },
                    _ = tokio::time::sleep_until(playing_until.unwrap_or_else(Instant::now)),
                        if playing_until.is_some() =>
                    {
                        playing_until = None;
                    }
                }
            }
        });

        Self {
            tx: Some(tx),
            task: Some(task),
        }
    }

    /// Queue one wire-format audio segment for playback.
    pub fn enqueue(&self, payload: Vec<u8>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(payload);
        }
    }

    /// Stop accepting segments and play out everything already queued.
    pub async fn finish(mut self) {
        self.tx = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Stop immediately, discarding anything still queued.
    pub fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum PlaybackControl {
    Stop,
}

/// Plays samples through the default cpal output device.
///
/// The output stream lives on its own thread (cpal streams are not `Send`);
/// `play` resamples to the device rate and appends to a shared ring the
/// device callback drains, so it returns immediately.
pub struct CpalPlaybackSink {
    ring: Arc<Mutex<VecDeque<f32>>>,
    device_rate: u32,
    control_tx: std::sync::mpsc::Sender<PlaybackControl>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalPlaybackSink {
    pub fn new() -> VoiceResult<Self> {
        let ring: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
        let (control_tx, control_rx) = std::sync::mpsc::channel::<PlaybackControl>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<VoiceResult<u32>>();

        let callback_ring = ring.clone();
        let thread = thread::spawn(move || {
            let stream = match build_output_stream(callback_ring) {
                Ok((stream, rate)) => {
                    if let Err(err) = stream.play() {
                        let _ = ready_tx.send(Err(VoiceError::PlaybackUnavailable(format!(
                            "failed to start output stream: {}",
                            err
                        ))));
                        return;
                    }
                    let _ = ready_tx.send(Ok(rate));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = control_rx.recv();
            drop(stream);
            info!("playback device released");
        });

        match ready_rx.recv() {
            Ok(Ok(device_rate)) => Ok(Self {
                ring,
                device_rate,
                control_tx,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => Err(VoiceError::PlaybackUnavailable(
                "playback thread exited before reporting readiness".to_string(),
            )),
        }
    }
}

impl PlaybackSink for CpalPlaybackSink {
    fn play(&mut self, samples: &[i16]) {
        let normalized: Vec<f32> = samples.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
        let resampled = resample_linear(
            &normalized,
            protocol::SAMPLE_RATE as f64 / self.device_rate as f64,
        );
        self.ring.lock().unwrap().extend(resampled);
    }
}

impl Drop for CpalPlaybackSink {
    fn drop(&mut self) {
        let _ = self.control_tx.send(PlaybackControl::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Linear resample by `step` source samples per output sample.
fn resample_linear(samples: &[f32], step: f64) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let out_len = ((samples.len() as f64 - 1.0) / step) as usize + 1;
    let mut out = Vec::with_capacity(out_len);
    let mut pos = 0.0f64;
    while (pos as usize) < samples.len() {
        let index = pos as usize;
        let frac = (pos - index as f64) as f32;
        let next = samples.get(index + 1).copied().unwrap_or(samples[index]);
        out.push(samples[index] * (1.0 - frac) + next * frac);
        pos += step;
    }
    out
}

fn build_output_stream(ring: Arc<Mutex<VecDeque<f32>>>) -> VoiceResult<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or_else(|| {
        VoiceError::PlaybackUnavailable("no default output device".to_string())
    })?;
    let supported = device.default_output_config().map_err(|err| {
        VoiceError::PlaybackUnavailable(format!("no default output config: {}", err))
    })?;

    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.config();
    let channels = config.channels as usize;
    let rate = config.sample_rate.0;
    info!(
        device = device.name().unwrap_or_else(|_| "unknown".to_string()),
        rate,
        channels = config.channels,
        "opening output device"
    );

    if sample_format != cpal::SampleFormat::F32 {
        return Err(VoiceError::PlaybackUnavailable(format!(
            "unsupported output sample format: {:?}",
            sample_format
        )));
    }

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                let mut ring = ring.lock().unwrap();
                for frame in data.chunks_mut(channels) {
                    // Same mono sample on every channel; silence underruns
                    let sample = ring.pop_front().unwrap_or(0.0);
                    for slot in frame {
                        *slot = sample;
                    }
                }
            },
            |err| error!(%err, "output stream error"),
            None,
        )
        .map_err(|err| {
            VoiceError::PlaybackUnavailable(format!("failed to build output stream: {}", err))
        })?;

    Ok((stream, rate))
}

//! # Session Transport Client
//!
//! Reconnecting WebSocket client for a voice session. Outbound audio frames
//! go out as binary messages; inbound traffic is demultiplexed into binary
//! audio and JSON control messages and surfaced as `TransportEvent`s on a
//! channel the application consumes.
//!
//! ## Send policy:
//! `send_audio`/`send_control` never block and never buffer across a
//! disconnect. While the transport is down (including during reconnect
//! backoff) frames are dropped and counted; live speech is only useful
//! live, so replaying a stale backlog after reconnect would be worse than
//! the gap.
//!
//! ## Reconnect:
//! An unexpected drop starts exponential backoff (base delay doubling up to
//! a cap) for a bounded number of attempts. Exhaustion emits exactly one
//! `ReconnectExhausted` error and the event stream ends. A clean close
//! (either side) never reconnects.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::ControlMessage;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-side transport configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8080/ws`
    pub url: String,
    pub handshake_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Outbound queue depth; a full queue drops frames
    pub send_queue_frames: usize,
}

impl ClientConfig {
    /// Derive the client-side settings from a full application config.
    pub fn from_app_config(url: impl Into<String>, config: &crate::config::AppConfig) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: config.transport.handshake_timeout(),
            reconnect_base: config.transport.reconnect_base(),
            reconnect_max_delay: config.transport.reconnect_max_delay(),
            max_reconnect_attempts: config.transport.max_reconnect_attempts,
            send_queue_frames: config.transport.send_queue_frames,
        }
    }

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: Duration::from_secs(5),
            reconnect_base: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(8),
            max_reconnect_attempts: 6,
            send_queue_frames: 64,
        }
    }
}

/// Everything the application observes about the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// Connection established; `attempt` is 0 for the initial connect
    Open { attempt: u32 },
    /// Inbound binary audio frame
    Audio(Vec<u8>),
    /// Inbound control message
    Control(ControlMessage),
    /// A reconnect attempt is scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Connection closed for good; `voluntary` means this client asked
    Closed { voluntary: bool },
    /// Transport-level failure (reconnect exhaustion, malformed control)
    Error(VoiceError),
}

/// Exponential backoff schedule: `base * 2^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

enum OutboundFrame {
    Audio(Vec<u8>),
    Control(String),
}

/// Why a live connection stopped relaying.
enum ConnectionEnd {
    /// This client asked to close
    Voluntary,
    /// The server closed cleanly (close frame)
    RemoteClosed,
    /// The connection dropped without a close frame
    Dropped,
}

struct Inner {
    connected: AtomicBool,
    closed: AtomicBool,
    dropped_frames: AtomicU64,
    out_tx: mpsc::Sender<OutboundFrame>,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to a connected voice session transport.
///
/// Cheap to clone; all clones share the same connection and counters.
#[derive(Clone)]
pub struct SessionTransportClient {
    inner: Arc<Inner>,
}

impl SessionTransportClient {
    /// Connect to the server and bind to `session_id`/`user_id`.
    ///
    /// The handshake itself runs under `handshake_timeout`; a failure here
    /// is returned directly (no retries — backoff only applies to drops of
    /// an established connection). On success the caller receives the
    /// client handle plus the event stream.
    pub async fn connect(
        config: ClientConfig,
        session_id: &str,
        user_id: &str,
    ) -> VoiceResult<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let url = format!(
            "{}?session_id={}&user_id={}",
            config.url, session_id, user_id
        );

        let ws = Self::dial(&url, config.handshake_timeout).await?;
        info!(%url, "voice transport connected");

        let (out_tx, out_rx) = mpsc::channel(config.send_queue_frames);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
            out_tx,
            shutdown_tx,
        });

        tokio::spawn(run_transport(
            config,
            url,
            ws,
            out_rx,
            shutdown_rx,
            event_tx,
            inner.clone(),
        ));

        Ok((Self { inner }, event_rx))
    }

    async fn dial(url: &str, handshake_timeout: Duration) -> VoiceResult<WsStream> {
        match tokio::time::timeout(handshake_timeout, connect_async(url)).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(err)) => Err(VoiceError::Connection(format!(
                "websocket handshake failed: {}",
                err
            ))),
            Err(_) => Err(VoiceError::Connection(format!(
                "websocket handshake timed out after {:?}",
                handshake_timeout
            ))),
        }
    }

    /// True once sends should be refused: the transport is down, or
    /// `disconnect()` has been called. `closed` is set synchronously by
    /// `disconnect`, so a frame sent right after it returns is never
    /// accepted even though the transport task tears down asynchronously.
    fn sends_refused(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || !self.inner.connected.load(Ordering::Acquire)
    }

    /// Queue one binary audio frame. Dropped (and counted) when the
    /// transport is down or the queue is full; never blocks.
    pub fn send_audio(&self, frame: Vec<u8>) {
        if self.sends_refused() {
            self.inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self
            .inner
            .out_tx
            .try_send(OutboundFrame::Audio(frame))
            .is_err()
        {
            self.inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Queue one control message as a text frame. Same drop policy as
    /// `send_audio`.
    pub fn send_control(&self, message: &ControlMessage) -> VoiceResult<()> {
        let json = message.to_wire()?;
        if self.sends_refused() {
            self.inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        if self
            .inner
            .out_tx
            .try_send(OutboundFrame::Control(json))
            .is_err()
        {
            self.inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        !self.sends_refused()
    }

    /// Frames discarded by the drop-instead-of-block send policy.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped_frames.load(Ordering::Relaxed)
    }

    /// Close the transport. Idempotent: only the first call has any effect
    /// and only one `Closed { voluntary: true }` event is ever emitted.
    pub fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
    }
}

async fn run_transport(
    config: ClientConfig,
    url: String,
    mut ws: WsStream,
    mut out_rx: mpsc::Receiver<OutboundFrame>,
    mut shutdown_rx: watch::Receiver<bool>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    inner: Arc<Inner>,
) {
    let backoff = Backoff::new(config.reconnect_base, config.reconnect_max_delay);
    let _ = event_tx.send(TransportEvent::Open { attempt: 0 });

    loop {
        let end = relay(&mut ws, &mut out_rx, &mut shutdown_rx, &event_tx).await;
        inner.connected.store(false, Ordering::Release);

        match end {
            ConnectionEnd::Voluntary => {
                let _ = event_tx.send(TransportEvent::Closed { voluntary: true });
                return;
            }
            ConnectionEnd::RemoteClosed => {
                info!("server closed the voice transport");
                let _ = event_tx.send(TransportEvent::Closed { voluntary: false });
                return;
            }
            ConnectionEnd::Dropped => {
                warn!("voice transport dropped unexpectedly");
                let _ = event_tx.send(TransportEvent::Closed { voluntary: false });
            }
        }

        // Reconnect with exponential backoff.
        let mut reconnected = None;
        for attempt in 1..=config.max_reconnect_attempts {
            let delay = backoff.delay_for(attempt);
            let _ = event_tx.send(TransportEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => return,
            }

            match SessionTransportClient::dial(&url, config.handshake_timeout).await {
                Ok(stream) => {
                    reconnected = Some((stream, attempt));
                    break;
                }
                Err(err) => {
                    debug!(attempt, %err, "reconnect attempt failed");
                }
            }
        }

        match reconnected {
            Some((stream, attempt)) => {
                info!(attempt, "voice transport reconnected");
                ws = stream;
                inner.connected.store(true, Ordering::Release);
                let _ = event_tx.send(TransportEvent::Open { attempt });
            }
            None => {
                let _ = event_tx.send(TransportEvent::Error(VoiceError::ReconnectExhausted {
                    attempts: config.max_reconnect_attempts,
                }));
                return;
            }
        }
    }
}

/// Relay frames in both directions until the connection ends.
async fn relay(
    ws: &mut WsStream,
    out_rx: &mut mpsc::Receiver<OutboundFrame>,
    shutdown_rx: &mut watch::Receiver<bool>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> ConnectionEnd {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = ws.send(Message::Close(None)).await;
                return ConnectionEnd::Voluntary;
            }
            frame = out_rx.recv() => match frame {
                Some(OutboundFrame::Audio(bytes)) => {
                    if ws.send(Message::Binary(bytes)).await.is_err() {
                        return ConnectionEnd::Dropped;
                    }
                }
                Some(OutboundFrame::Control(json)) => {
                    if ws.send(Message::Text(json)).await.is_err() {
                        return ConnectionEnd::Dropped;
                    }
                }
                // All client handles dropped; same as disconnect
                None => {
                    let _ = ws.send(Message::Close(None)).await;
                    return ConnectionEnd::Voluntary;
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = event_tx.send(TransportEvent::Audio(bytes));
                }
                Some(Ok(Message::Text(json))) => match ControlMessage::from_wire(&json) {
                    Ok(control) => {
                        let _ = event_tx.send(TransportEvent::Control(control));
                    }
                    Err(err) => {
                        // Malformed control is surfaced but does not kill
                        // the connection
                        let _ = event_tx.send(TransportEvent::Error(
                            VoiceError::ProtocolViolation(format!(
                                "malformed control message: {}",
                                err
                            )),
                        ));
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) => return ConnectionEnd::RemoteClosed,
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return ConnectionEnd::Dropped,
            }
        }
    }
}

//! # Application State Management
//!
//! Shared state accessed by every connection handler and HTTP endpoint:
//! the live configuration, transport metrics, and the server start time.
//!
//! ## Thread Safety:
//! Mutable data sits behind `Arc<RwLock<_>>` so many connections can read
//! simultaneously while updates take the write lock briefly. Counters are
//! updated from the WebSocket actors as frames are relayed, so the locked
//! sections stay tiny.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared application state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Transport metrics, updated by connection handlers
    pub metrics: Arc<RwLock<TransportMetrics>>,

    /// When the server started; never changes
    pub start_time: Instant,
}

/// Counters describing transport activity since server start.
#[derive(Debug, Default, Clone)]
pub struct TransportMetrics {
    /// Connections currently attached
    pub active_connections: u32,

    /// Total connections accepted since start
    pub total_connections: u64,

    /// Audio frames relayed client → pipeline
    pub audio_frames_in: u64,

    /// Audio frames relayed pipeline → client
    pub audio_frames_out: u64,

    /// Control messages sent to clients
    pub control_messages_out: u64,

    /// Inbound audio frames dropped because the pipeline queue was full
    pub frames_dropped: u64,

    /// Connections closed for a protocol violation
    pub protocol_violations: u64,

    /// Connections force-closed by the idle timeout
    pub idle_timeouts: u64,

    /// Sessions that ended in the errored state, by reason label
    pub errored_sessions: HashMap<String, u64>,
}

impl AppState {
    /// Create a new AppState with the given configuration.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(TransportMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately so connection setup never
    /// blocks behind a config update.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Called when a connection attaches.
    pub fn connection_opened(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_connections += 1;
        metrics.total_connections += 1;
    }

    /// Called when a connection detaches, for any reason.
    pub fn connection_closed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_connections > 0 {
            metrics.active_connections -= 1;
        }
    }

    /// Record one inbound audio frame relayed into the pipeline.
    pub fn record_audio_in(&self) {
        self.metrics.write().unwrap().audio_frames_in += 1;
    }

    /// Record one outbound audio frame sent to the client.
    pub fn record_audio_out(&self) {
        self.metrics.write().unwrap().audio_frames_out += 1;
    }

    /// Record one outbound control message.
    pub fn record_control_out(&self) {
        self.metrics.write().unwrap().control_messages_out += 1;
    }

    /// Record an inbound frame dropped at the pipeline queue.
    pub fn record_frame_dropped(&self) {
        self.metrics.write().unwrap().frames_dropped += 1;
    }

    /// Record a connection closed for a protocol violation.
    pub fn record_protocol_violation(&self) {
        self.metrics.write().unwrap().protocol_violations += 1;
    }

    /// Record a connection force-closed by the idle timeout.
    pub fn record_idle_timeout(&self) {
        self.metrics.write().unwrap().idle_timeouts += 1;
    }

    /// Record a session entering the errored state.
    pub fn record_errored_session(&self, reason: &str) {
        let mut metrics = self.metrics.write().unwrap();
        *metrics.errored_sessions.entry(reason.to_string()).or_insert(0) += 1;
    }

    /// Snapshot of the current metrics for the HTTP endpoints.
    pub fn get_metrics_snapshot(&self) -> TransportMetrics {
        self.metrics.read().unwrap().clone()
    }

    /// Server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

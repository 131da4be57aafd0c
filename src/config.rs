//! # Configuration Management
//!
//! Loads and validates application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_TRANSPORT_MAXRECONNECTATTEMPTS, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The transport section is shared by both sides: the server reads the idle
//! timeout and queue depths, the client reads the handshake timeout and the
//! reconnect backoff parameters.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub transport: TransportConfig,
    pub audio: AudioConfig,
    pub pipeline: PipelineConfig,
}

/// Server bind configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Session lifecycle policy.
///
/// ## Fields:
/// - `idle_timeout_secs`: a connection with no audio or control activity for
///   this long is force-closed and its session marked `errored` (not `ended`,
///   so clients can distinguish voluntary close from forced close)
/// - `strict_handshake`: when true, connections missing `session_id` or
///   `user_id` handshake parameters are rejected with 400 instead of being
///   given generated fallback identifiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub strict_handshake: bool,
}

/// Transport timing and backoff configuration.
///
/// ## Reconnect policy:
/// On unexpected close the client retries with exponential backoff: delays
/// start at `reconnect_base_ms` and double up to `reconnect_max_delay_ms`,
/// for at most `max_reconnect_attempts` attempts. After exhaustion the
/// client surfaces a terminal `ReconnectExhausted` error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Handshake must complete within this many milliseconds
    pub handshake_timeout_ms: u64,

    /// First reconnect delay
    pub reconnect_base_ms: u64,

    /// Cap on the doubled reconnect delay
    pub reconnect_max_delay_ms: u64,

    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Bounded depth of the outbound frame queue on the client
    pub send_queue_frames: usize,

    /// Bounded depth of the server-side audio queue into the pipeline
    pub pipeline_queue_frames: usize,
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

/// Audio capture and playback configuration.
///
/// ## Contract:
/// The wire format is fixed (16kHz, mono, 16-bit little-endian PCM); these
/// settings govern chunking and buffering around that contract, not the
/// format itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Samples per capture frame (4096 samples at 16kHz is 256ms)
    pub chunk_samples: usize,

    /// Maximum extra delay the playback scheduler may introduce while
    /// waiting for a slow decode, in milliseconds
    pub max_playback_buffer_ms: u64,
}

/// Pipeline backend selection for the reference server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Backend name; the reference server ships "echo"
    pub backend: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            session: SessionConfig {
                idle_timeout_secs: 120,
                strict_handshake: false,
            },
            transport: TransportConfig {
                handshake_timeout_ms: 5_000,
                reconnect_base_ms: 500,
                reconnect_max_delay_ms: 8_000,
                max_reconnect_attempts: 6,
                send_queue_frames: 64,
                pipeline_queue_frames: 64,
            },
            audio: AudioConfig {
                chunk_samples: 4096,
                max_playback_buffer_ms: 500,
            },
            pipeline: PipelineConfig {
                backend: "echo".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`
    /// - `APP_SESSION_IDLETIMEOUTSECS=60`
    /// - `HOST` / `PORT`: deployment-platform overrides without the prefix
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Port is not 0
    /// - Backoff delays are non-zero and the cap is not below the base
    /// - Queue depths and chunk size are non-zero
    /// - At least one reconnect attempt is configured
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server port cannot be 0"));
        }

        if self.transport.reconnect_base_ms == 0 {
            return Err(anyhow::anyhow!("reconnect base delay must be greater than 0"));
        }

        if self.transport.reconnect_max_delay_ms < self.transport.reconnect_base_ms {
            return Err(anyhow::anyhow!(
                "reconnect max delay ({}ms) must not be below the base delay ({}ms)",
                self.transport.reconnect_max_delay_ms,
                self.transport.reconnect_base_ms
            ));
        }

        if self.transport.max_reconnect_attempts == 0 {
            return Err(anyhow::anyhow!("max reconnect attempts must be greater than 0"));
        }

        if self.transport.send_queue_frames == 0 || self.transport.pipeline_queue_frames == 0 {
            return Err(anyhow::anyhow!("queue depths must be greater than 0"));
        }

        if self.audio.chunk_samples == 0 {
            return Err(anyhow::anyhow!("audio chunk size must be greater than 0"));
        }

        if self.session.idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("idle timeout must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(!config.session.strict_handshake);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transport.reconnect_max_delay_ms = 100;
        config.transport.reconnect_base_ms = 500;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transport.max_reconnect_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let config = AppConfig::default();
        assert_eq!(config.transport.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.transport.reconnect_base(), Duration::from_millis(500));
    }
}

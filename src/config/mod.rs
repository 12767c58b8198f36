//! Configuration module for the orato server
//!
//! All configuration comes from environment variables, optionally seeded
//! from a `.env` file via dotenvy. Every variable has a default so the
//! server starts with no configuration at all; sessions fail at upstream
//! connect time until `OPENAI_API_KEY` is provided.
//!
//! # Example
//! ```rust,no_run
//! use orato::config::ServerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_env()?;
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::core::bridge::{BridgeConfig, TurnMode};
use crate::core::registry::RegistryConfig;
use crate::core::turn_detect::TurnDetectorConfig;
use crate::core::upstream::realtime::RealtimeConfig;

mod env;

/// Server configuration
///
/// Contains all configuration needed to run the orato server, including:
/// - Server settings (host, port)
/// - Upstream realtime endpoint settings
/// - Knowledge base location
/// - Session registry limits and timeouts
/// - Audio rates and turn-detection tuning
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // Upstream realtime endpoint
    pub openai_api_key: Option<String>,
    pub realtime_url: String,
    pub realtime_model: String,
    pub realtime_voice: String,

    // Knowledge base
    pub knowledge_dir: PathBuf,

    // Session registry
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub context_ttl_secs: u64,
    pub drain_timeout_secs: u64,

    // Audio
    pub sample_rate: u32,
    pub client_sample_rate: u32,
    pub audio_buffer_frames: usize,

    // Turn detection
    pub turn_mode: TurnMode,
    pub vad_threshold: f32,
    pub vad_start_dwell: u32,
    pub vad_end_silence: u32,

    // Upstream connection
    pub connect_timeout_secs: u64,
}

impl ServerConfig {
    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Registry configuration derived from this server configuration.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_sessions: self.max_sessions,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            context_ttl: Duration::from_secs(self.context_ttl_secs),
            voice: self.realtime_voice.clone(),
            bridge: BridgeConfig {
                turn_mode: self.turn_mode,
                detector: self.detector_config(),
                audio_buffer_frames: self.audio_buffer_frames,
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                client_sample_rate: self.client_sample_rate,
                upstream_sample_rate: self.sample_rate,
            },
        }
    }

    /// Upstream connector configuration derived from this server
    /// configuration. The API key stays optional here; the connector
    /// rejects session opens while it is absent.
    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            url: self.realtime_url.clone(),
            api_key: self.openai_api_key.clone().unwrap_or_default(),
            model: self.realtime_model.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    fn detector_config(&self) -> TurnDetectorConfig {
        match self.turn_mode {
            // Endpoint-reported boundaries are already debounced.
            TurnMode::ServerVad => TurnDetectorConfig::for_upstream_vad(),
            TurnMode::ClientEnergy => TurnDetectorConfig::default()
                .with_threshold(self.vad_threshold)
                .with_start_dwell(self.vad_start_dwell)
                .with_end_silence(self.vad_end_silence),
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    /// Returns an error naming the offending variable when a value is out
    /// of range.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_sessions == 0 {
            return Err("MAX_SESSIONS must be at least 1".to_string());
        }
        if self.sample_rate == 0 || self.client_sample_rate == 0 {
            return Err("SAMPLE_RATE and CLIENT_SAMPLE_RATE must be greater than zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err("VAD_THRESHOLD must be between 0.0 and 1.0".to_string());
        }
        if self.audio_buffer_frames == 0 {
            return Err("AUDIO_BUFFER_FRAMES must be at least 1".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("SWEEP_INTERVAL_SECS must be at least 1".to_string());
        }
        if self.connect_timeout_secs == 0 {
            return Err("CONNECT_TIMEOUT_SECS must be at least 1".to_string());
        }
        Ok(())
    }
}

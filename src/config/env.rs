use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::ServerConfig;
use crate::core::bridge::TurnMode;
use crate::core::upstream::realtime::{DEFAULT_REALTIME_MODEL, DEFAULT_REALTIME_URL};

/// Parse an environment variable, falling back to `default` when the
/// variable is unset. A set-but-malformed value is an error rather than a
/// silent fallback.
fn parse_var<T>(name: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|e| format!("Invalid {name}: {e}")),
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// Reads configuration from environment variables, with sensible defaults.
    /// Also loads from .env file if present using dotenvy.
    ///
    /// # Returns
    /// * `Result<Self, Box<dyn std::error::Error>>` - The loaded configuration or an error
    ///
    /// # Errors
    /// Returns an error if:
    /// - A variable is set to a value that does not parse
    /// - The resulting configuration fails validation
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        // Server configuration
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3001".to_string())
            .parse::<u16>()
            .map_err(|e| format!("Invalid port number: {e}"))?;

        // Upstream realtime endpoint
        let openai_api_key = env::var("OPENAI_API_KEY").ok();
        let realtime_url =
            env::var("REALTIME_URL").unwrap_or_else(|_| DEFAULT_REALTIME_URL.to_string());
        let realtime_model =
            env::var("REALTIME_MODEL").unwrap_or_else(|_| DEFAULT_REALTIME_MODEL.to_string());
        let realtime_voice = env::var("REALTIME_VOICE").unwrap_or_else(|_| "alloy".to_string());

        // Knowledge base
        let knowledge_dir = env::var("KNOWLEDGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("knowledge"));

        // Session registry
        let max_sessions = parse_var("MAX_SESSIONS", 32usize)?;
        let idle_timeout_secs = parse_var("IDLE_TIMEOUT_SECS", 1800u64)?;
        let sweep_interval_secs = parse_var("SWEEP_INTERVAL_SECS", 60u64)?;
        let context_ttl_secs = parse_var("CONTEXT_TTL_SECS", 3600u64)?;
        let drain_timeout_secs = parse_var("DRAIN_TIMEOUT_SECS", 5u64)?;

        // Audio rates; the client rate follows the upstream rate unless
        // overridden.
        let sample_rate = parse_var("SAMPLE_RATE", 24_000u32)?;
        let client_sample_rate = parse_var("CLIENT_SAMPLE_RATE", sample_rate)?;
        let audio_buffer_frames = parse_var("AUDIO_BUFFER_FRAMES", 64usize)?;

        // Turn detection
        let turn_mode = parse_var("TURN_MODE", TurnMode::ServerVad)?;
        let vad_threshold = parse_var("VAD_THRESHOLD", 0.5f32)?;
        let vad_start_dwell = parse_var("VAD_START_DWELL", 3u32)?;
        let vad_end_silence = parse_var("VAD_END_SILENCE", 25u32)?;

        // Upstream connection
        let connect_timeout_secs = parse_var("CONNECT_TIMEOUT_SECS", 10u64)?;

        let config = ServerConfig {
            host,
            port,
            openai_api_key,
            realtime_url,
            realtime_model,
            realtime_voice,
            knowledge_dir,
            max_sessions,
            idle_timeout_secs,
            sweep_interval_secs,
            context_ttl_secs,
            drain_timeout_secs,
            sample_rate,
            client_sample_rate,
            audio_buffer_frames,
            turn_mode,
            vad_threshold,
            vad_start_dwell,
            vad_end_silence,
            connect_timeout_secs,
        };

        config.validate()?;
        Ok(config)
    }
}

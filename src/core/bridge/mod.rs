//! Per-session relay between a client connection and an upstream endpoint
//!
//! The bridge owns one client-facing channel pair and one upstream-facing
//! channel pair for a single session. It validates and forwards audio,
//! drives turn taking from either client-side energy or endpoint VAD
//! events, and maps upstream response events onto the client event
//! vocabulary. One tokio task per session runs the relay loop.

use bytes::Bytes;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::turn_detect::TurnDetectorConfig;
use crate::core::upstream::UpstreamError;

mod relay;

pub use relay::VoiceSessionBridge;

/// Where turn boundaries come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    /// The upstream endpoint runs voice activity detection and reports
    /// speech boundaries back to us.
    ServerVad,
    /// We detect turns ourselves from RMS energy of client frames.
    ClientEnergy,
}

impl TurnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnMode::ServerVad => "server_vad",
            TurnMode::ClientEnergy => "client_energy",
        }
    }
}

impl FromStr for TurnMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "server_vad" => Ok(TurnMode::ServerVad),
            "client_energy" => Ok(TurnMode::ClientEnergy),
            other => Err(format!(
                "unknown turn mode '{other}' (expected server_vad or client_energy)"
            )),
        }
    }
}

impl std::fmt::Display for TurnMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning for one bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub turn_mode: TurnMode,
    pub detector: TurnDetectorConfig,
    /// Capacity of each drop-oldest outbound audio queue, in frames.
    pub audio_buffer_frames: usize,
    /// Budget for dialing the upstream endpoint and for its readiness
    /// acknowledgment, each.
    pub connect_timeout: Duration,
    /// Sample rate of audio arriving from the client.
    pub client_sample_rate: u32,
    /// Sample rate the upstream endpoint expects.
    pub upstream_sample_rate: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            turn_mode: TurnMode::ServerVad,
            detector: TurnDetectorConfig::for_upstream_vad(),
            audio_buffer_frames: 64,
            connect_timeout: Duration::from_secs(10),
            client_sample_rate: 24000,
            upstream_sample_rate: 24000,
        }
    }
}

/// Bridge-visible conversation state, reported to the client through
/// `session_update` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Initializing,
    Ready,
    Listening,
    Processing,
    Speaking,
    Closed,
    Error,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Initializing => "initializing",
            BridgeState::Ready => "ready",
            BridgeState::Listening => "listening",
            BridgeState::Processing => "processing",
            BridgeState::Speaking => "speaking",
            BridgeState::Closed => "closed",
            BridgeState::Error => "error",
        }
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame arriving from the client connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// One PCM16 audio payload (a binary WebSocket message).
    Audio(Bytes),
    /// A parsed JSON control message.
    Control(ClientCommand),
}

/// Control messages the client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    /// Push-to-talk end of turn.
    CommitTurn,
    /// Graceful close request.
    End,
}

/// Events the bridge emits toward the client connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Conversation state change, with an optional human-readable detail.
    SessionUpdate {
        state: BridgeState,
        detail: Option<String>,
    },
    /// Completed transcript of what the caller said.
    Transcription { transcript: String },
    /// Fragment of the model's spoken response transcript.
    TranscriptDelta { delta: String },
    /// The model is working on a response.
    Processing,
    /// One frame of synthesized response audio.
    ResponseAudio(Bytes),
    /// Backpressure dropped audio; `dropped` is the session-cumulative count.
    Degraded { dropped: u64 },
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
    /// Terminal event of a graceful teardown.
    Complete,
}

/// Client side of the bridge: frames in, events out. The WebSocket
/// handler holds the far ends.
pub struct ClientChannel {
    pub frames: mpsc::Receiver<ClientFrame>,
    pub events: mpsc::Sender<ClientEvent>,
}

/// Why the relay task ended. The registry maps this onto the session's
/// final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// Graceful teardown requested by the client.
    Complete,
    /// The client connection went away.
    ClientDisconnected,
    /// The upstream endpoint could not be reached or never became ready.
    /// Recoverable: the session returns to CREATED for a fresh attach.
    ConnectFailed,
    /// The upstream connection failed mid-session.
    UpstreamFailed,
    /// The registry asked the bridge to shut down.
    Shutdown,
}

/// Failures during bridge initialization.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    UpstreamConnect(#[from] UpstreamError),

    #[error("upstream session not ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("upstream closed before becoming ready")]
    ClosedBeforeReady,

    #[error("client channel closed")]
    ClientGone,
}

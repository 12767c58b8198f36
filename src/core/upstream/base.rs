//! Upstream speech endpoint abstraction
//!
//! A connector owns everything transport-specific about a hosted speech
//! model: how to dial it, how to send the opening configuration message,
//! and how its wire vocabulary maps onto [`UpstreamCommand`] and
//! [`UpstreamEvent`]. The session bridge only ever sees the channel pair
//! returned by [`UpstreamConnector::open`], so a fake upstream in tests
//! is just the far ends of two mpsc channels.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffer size for the command and event channels of one upstream session.
pub const UPSTREAM_CHANNEL_CAPACITY: usize = 256;

/// Settings for one upstream session, applied in the first message sent
/// after the connection is established.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    /// Full instruction prefix: preamble plus knowledge sections.
    pub instructions: String,
    /// Whether the prefix is large enough for the endpoint's implicit
    /// prefix caching to pay off. Logged for operational visibility.
    pub cache_eligible: bool,
    /// Synthesis voice requested from the endpoint.
    pub voice: String,
    /// When true the endpoint runs its own voice activity detection and
    /// starts responses on its own. When false the bridge commits turns
    /// explicitly.
    pub server_vad: bool,
    pub temperature: f32,
    pub max_response_tokens: u32,
}

impl Default for SessionSetup {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            cache_eligible: false,
            voice: "alloy".to_string(),
            server_vad: true,
            temperature: 0.8,
            max_response_tokens: 4096,
        }
    }
}

/// Commands the bridge sends to an open upstream session.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamCommand {
    /// Append a frame of PCM16 audio to the endpoint's input buffer.
    AppendAudio(Bytes),
    /// Close the current input turn. Only meaningful when the endpoint's
    /// own turn detection is disabled.
    CommitTurn,
    /// Ask the endpoint to start generating a response.
    CreateResponse,
    /// Abort the response currently being generated.
    CancelResponse,
    /// Close the connection gracefully.
    Close,
}

/// Events an upstream session emits, already lifted out of the
/// endpoint's wire vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// The endpoint acknowledged the session configuration.
    SessionReady,
    /// Endpoint-side voice activity detection heard speech begin.
    SpeechStarted { audio_start_ms: Option<u64> },
    /// Endpoint-side voice activity detection heard speech end.
    SpeechStopped,
    /// Final transcript of what the caller said this turn.
    InputTranscript { transcript: String },
    /// A chunk of synthesized response audio (PCM16).
    ResponseAudio { audio: Bytes },
    /// Incremental transcript of the response being synthesized.
    ResponseTranscriptDelta { delta: String },
    /// Full transcript of the finished response.
    ResponseTranscriptDone { transcript: String },
    /// The endpoint finished the current response.
    ResponseDone,
    /// The endpoint reported an error.
    Error {
        code: Option<String>,
        message: String,
    },
    /// The connection closed.
    Closed,
}

/// Errors from establishing or configuring an upstream session.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("upstream protocol error: {0}")]
    Protocol(String),

    #[error("upstream configuration error: {0}")]
    Configuration(String),
}

/// Duplex channel pair for one open upstream session.
///
/// Dropping `commands` tells the connector's IO task to close the
/// connection; the task drops `events` once the socket is gone, so the
/// holder observes shutdown from either side without extra signalling.
pub struct UpstreamChannel {
    pub commands: mpsc::Sender<UpstreamCommand>,
    pub events: mpsc::Receiver<UpstreamEvent>,
}

/// A dialer for one kind of upstream speech endpoint.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Establish a connection, send the session configuration carrying
    /// `setup`, and hand back the live channel pair. The first event on
    /// a healthy session is [`UpstreamEvent::SessionReady`].
    async fn open(&self, setup: SessionSetup) -> Result<UpstreamChannel, UpstreamError>;

    /// Human-readable description of the endpoint for logs.
    fn provider_info(&self) -> &'static str;
}

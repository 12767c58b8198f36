//! OpenAI Realtime API connector
//!
//! Speaks the `wss://api.openai.com/v1/realtime` protocol: one WebSocket
//! per session, a `session.update` configuration message up front, base64
//! PCM16 audio in both directions, and typed JSON events for speech
//! detection, transcription, and response lifecycle.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::base::{
    SessionSetup, UpstreamChannel, UpstreamCommand, UpstreamConnector, UpstreamError,
    UpstreamEvent, UPSTREAM_CHANNEL_CAPACITY,
};

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Server VAD tuning applied when the endpoint detects turns itself.
const SERVER_VAD_THRESHOLD: f32 = 0.5;
const SERVER_VAD_PREFIX_PADDING_MS: u32 = 300;
const SERVER_VAD_SILENCE_DURATION_MS: u32 = 200;

/// Connection settings for the realtime endpoint.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub connect_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Connector for the OpenAI Realtime speech-to-speech endpoint.
pub struct RealtimeConnector {
    config: RealtimeConfig,
}

impl RealtimeConnector {
    pub fn new(config: RealtimeConfig) -> Self {
        Self { config }
    }

    fn build_websocket_url(&self) -> Result<String, UpstreamError> {
        let mut url = url::Url::parse(&self.config.url)
            .map_err(|e| UpstreamError::Configuration(format!("invalid realtime URL: {e}")))?;
        url.query_pairs_mut().append_pair("model", &self.config.model);
        Ok(url.to_string())
    }
}

#[async_trait]
impl UpstreamConnector for RealtimeConnector {
    async fn open(&self, setup: SessionSetup) -> Result<UpstreamChannel, UpstreamError> {
        if self.config.api_key.is_empty() {
            return Err(UpstreamError::Configuration(
                "realtime API key is not set".to_string(),
            ));
        }

        let ws_url = self.build_websocket_url()?;
        debug!("Connecting to realtime endpoint: {}", self.config.url);

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .uri(&ws_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("OpenAI-Beta", "realtime=v1")
            .body(())
            .map_err(|e| UpstreamError::Configuration(format!("invalid request: {e}")))?;

        let (ws_stream, _) = timeout(self.config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                UpstreamError::Connect(format!(
                    "timed out after {:?}",
                    self.config.connect_timeout
                ))
            })?
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        info!(model = %self.config.model, "Connected to realtime endpoint");

        let (mut ws_sink, mut ws_source) = ws_stream.split();

        // The configuration message carrying the instruction prefix must
        // be the first thing on the wire.
        let session_update = session_update_message(&setup);
        let config_json = serde_json::to_string(&session_update)
            .map_err(|e| UpstreamError::Protocol(format!("serializing session config: {e}")))?;
        ws_sink
            .send(Message::Text(config_json.into()))
            .await
            .map_err(|e| UpstreamError::Connect(format!("sending session config: {e}")))?;
        info!(
            instruction_bytes = setup.instructions.len(),
            cache_eligible = setup.cache_eligible,
            server_vad = setup.server_vad,
            "Sent realtime session configuration"
        );

        let (command_tx, mut command_rx) = mpsc::channel::<UpstreamCommand>(UPSTREAM_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<UpstreamEvent>(UPSTREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        let command = match command {
                            Some(UpstreamCommand::Close) | None => {
                                let _ = ws_sink.send(Message::Close(None)).await;
                                let _ = event_tx.send(UpstreamEvent::Closed).await;
                                break;
                            }
                            Some(command) => command,
                        };

                        match encode_command(&command) {
                            Ok(json) => {
                                if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                                    error!("Failed to send to realtime endpoint: {}", e);
                                    let _ = event_tx
                                        .send(UpstreamEvent::Error {
                                            code: None,
                                            message: format!("send failed: {e}"),
                                        })
                                        .await;
                                    break;
                                }
                            }
                            Err(e) => {
                                // Serialization of our own structs failing means a
                                // bug, not a wire problem. Log and keep the session.
                                error!("Failed to encode realtime command: {}", e);
                            }
                        }
                    }
                    incoming = ws_source.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<RealtimeServerEvent>(&text) {
                                    Ok(server_event) => {
                                        if let Some(event) = translate(server_event) {
                                            if event_tx.send(event).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        warn!("Unparseable realtime event: {}", e);
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(data))) => {
                                warn!("Unexpected {} binary bytes from realtime endpoint", data.len());
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!("Realtime endpoint closed the connection: {:?}", frame);
                                let _ = event_tx.send(UpstreamEvent::Closed).await;
                                break;
                            }
                            Some(Ok(_)) => {
                                // Ping and pong are handled by the library.
                            }
                            Some(Err(e)) => {
                                error!("Realtime connection error: {}", e);
                                let _ = event_tx
                                    .send(UpstreamEvent::Error {
                                        code: None,
                                        message: e.to_string(),
                                    })
                                    .await;
                                break;
                            }
                            None => {
                                let _ = event_tx.send(UpstreamEvent::Closed).await;
                                break;
                            }
                        }
                    }
                }
            }
            debug!("Realtime connection task ended");
        });

        Ok(UpstreamChannel {
            commands: command_tx,
            events: event_rx,
        })
    }

    fn provider_info(&self) -> &'static str {
        "OpenAI Realtime WebSocket API"
    }
}

// ============ Outbound wire format ============

#[derive(Debug, Serialize)]
struct SessionUpdateMessage {
    #[serde(rename = "type")]
    message_type: &'static str,
    session: SessionConfig,
}

#[derive(Debug, Serialize)]
struct SessionConfig {
    modalities: Vec<&'static str>,
    instructions: String,
    voice: String,
    input_audio_format: &'static str,
    output_audio_format: &'static str,
    input_audio_transcription: TranscriptionConfig,
    /// `null` disables endpoint-side turn detection; the field must be
    /// present either way, so no skip attribute here.
    turn_detection: Option<TurnDetectionConfig>,
    temperature: f32,
    max_response_output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct TranscriptionConfig {
    model: &'static str,
}

#[derive(Debug, Serialize)]
struct TurnDetectionConfig {
    #[serde(rename = "type")]
    detection_type: &'static str,
    threshold: f32,
    prefix_padding_ms: u32,
    silence_duration_ms: u32,
    create_response: bool,
}

#[derive(Debug, Serialize)]
struct AudioAppendMessage {
    #[serde(rename = "type")]
    message_type: &'static str,
    audio: String,
}

#[derive(Debug, Serialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    message_type: &'static str,
}

fn session_update_message(setup: &SessionSetup) -> SessionUpdateMessage {
    let turn_detection = setup.server_vad.then(|| TurnDetectionConfig {
        detection_type: "server_vad",
        threshold: SERVER_VAD_THRESHOLD,
        prefix_padding_ms: SERVER_VAD_PREFIX_PADDING_MS,
        silence_duration_ms: SERVER_VAD_SILENCE_DURATION_MS,
        create_response: true,
    });

    SessionUpdateMessage {
        message_type: "session.update",
        session: SessionConfig {
            modalities: vec!["text", "audio"],
            instructions: setup.instructions.clone(),
            voice: setup.voice.clone(),
            input_audio_format: "pcm16",
            output_audio_format: "pcm16",
            input_audio_transcription: TranscriptionConfig { model: "whisper-1" },
            turn_detection,
            temperature: setup.temperature,
            max_response_output_tokens: setup.max_response_tokens,
        },
    }
}

fn encode_command(command: &UpstreamCommand) -> Result<String, serde_json::Error> {
    match command {
        UpstreamCommand::AppendAudio(audio) => serde_json::to_string(&AudioAppendMessage {
            message_type: "input_audio_buffer.append",
            audio: BASE64.encode(audio),
        }),
        UpstreamCommand::CommitTurn => serde_json::to_string(&ControlMessage {
            message_type: "input_audio_buffer.commit",
        }),
        UpstreamCommand::CreateResponse => serde_json::to_string(&ControlMessage {
            message_type: "response.create",
        }),
        UpstreamCommand::CancelResponse => serde_json::to_string(&ControlMessage {
            message_type: "response.cancel",
        }),
        // Close never reaches the encoder; the IO task handles it directly.
        UpstreamCommand::Close => serde_json::to_string(&ControlMessage {
            message_type: "session.close",
        }),
    }
}

// ============ Inbound wire format ============

#[derive(Debug, Deserialize)]
struct RealtimeServerEvent {
    #[serde(rename = "type")]
    event_type: String,
    delta: Option<String>,
    transcript: Option<String>,
    audio_start_ms: Option<u64>,
    error: Option<RealtimeErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct RealtimeErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

fn translate(event: RealtimeServerEvent) -> Option<UpstreamEvent> {
    match event.event_type.as_str() {
        "session.created" | "session.updated" => Some(UpstreamEvent::SessionReady),
        "input_audio_buffer.speech_started" => Some(UpstreamEvent::SpeechStarted {
            audio_start_ms: event.audio_start_ms,
        }),
        "input_audio_buffer.speech_stopped" => Some(UpstreamEvent::SpeechStopped),
        "conversation.item.input_audio_transcription.completed" => {
            Some(UpstreamEvent::InputTranscript {
                transcript: event.transcript.unwrap_or_default(),
            })
        }
        "response.audio.delta" => {
            let encoded = event.delta.unwrap_or_default();
            match BASE64.decode(encoded.as_bytes()) {
                Ok(audio) => Some(UpstreamEvent::ResponseAudio {
                    audio: audio.into(),
                }),
                Err(e) => Some(UpstreamEvent::Error {
                    code: Some("bad_audio_delta".to_string()),
                    message: format!("undecodable audio delta: {e}"),
                }),
            }
        }
        "response.audio_transcript.delta" => Some(UpstreamEvent::ResponseTranscriptDelta {
            delta: event.delta.unwrap_or_default(),
        }),
        "response.audio_transcript.done" => Some(UpstreamEvent::ResponseTranscriptDone {
            transcript: event.transcript.unwrap_or_default(),
        }),
        "response.done" => Some(UpstreamEvent::ResponseDone),
        "error" => {
            let detail = event.error;
            Some(UpstreamEvent::Error {
                code: detail.as_ref().and_then(|d| d.code.clone()),
                message: detail
                    .and_then(|d| d.message)
                    .unwrap_or_else(|| "unspecified realtime error".to_string()),
            })
        }
        other => {
            debug!("Ignoring realtime event type: {}", other);
            None
        }
    }
}

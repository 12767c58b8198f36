//! WebSocket message types and routing
//!
//! This module defines the wire-level message types for the client
//! WebSocket, plus the routing enum that lets the sender task interleave
//! JSON events with binary audio frames.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::bridge::ClientEvent;

/// WebSocket message types for incoming messages
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    /// Push-to-talk end of turn (client-energy mode; ignored under
    /// endpoint VAD)
    #[serde(rename = "commit_turn")]
    CommitTurn,
    /// Graceful close request
    #[serde(rename = "end")]
    End,
}

/// WebSocket message types for outgoing messages
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    #[serde(rename = "session_update")]
    SessionUpdate {
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    #[serde(rename = "transcription")]
    Transcription { transcript: String },
    #[serde(rename = "transcript_delta")]
    TranscriptDelta { delta: String },
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "degraded")]
    Degraded { dropped: u64 },
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
    #[serde(rename = "complete")]
    Complete,
}

/// Message routing for the sender task
/// Binary response audio skips JSON entirely
pub enum MessageRoute {
    Outgoing(OutgoingMessage),
    Binary(Bytes),
}

impl From<ClientEvent> for MessageRoute {
    fn from(event: ClientEvent) -> Self {
        match event {
            ClientEvent::SessionUpdate { state, detail } => {
                MessageRoute::Outgoing(OutgoingMessage::SessionUpdate {
                    state: state.as_str().to_string(),
                    detail,
                })
            }
            ClientEvent::Transcription { transcript } => {
                MessageRoute::Outgoing(OutgoingMessage::Transcription { transcript })
            }
            ClientEvent::TranscriptDelta { delta } => {
                MessageRoute::Outgoing(OutgoingMessage::TranscriptDelta { delta })
            }
            ClientEvent::Processing => MessageRoute::Outgoing(OutgoingMessage::Processing),
            ClientEvent::ResponseAudio(audio) => MessageRoute::Binary(audio),
            ClientEvent::Degraded { dropped } => {
                MessageRoute::Outgoing(OutgoingMessage::Degraded { dropped })
            }
            ClientEvent::Error {
                code,
                message,
                recoverable,
            } => MessageRoute::Outgoing(OutgoingMessage::Error {
                code,
                message,
                recoverable,
            }),
            ClientEvent::Complete => MessageRoute::Outgoing(OutgoingMessage::Complete),
        }
    }
}

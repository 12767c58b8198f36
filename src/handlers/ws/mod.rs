//! # WebSocket Voice Session Module
//!
//! This module provides the WebSocket interface for streaming a live voice
//! conversation through an existing session. The session must be created
//! first via `POST /api/v1/start-session`; the returned id names the
//! session in the WebSocket path.
//!
//! ## WebSocket API
//!
//! ### Connection Flow
//! 1. Client calls `POST /api/v1/start-session` and receives a `session_id`
//! 2. Client connects to `/api/v1/ws/{session_id}`
//! 3. Server sends `session_update` events as the upstream model connects
//!    (`ready`, then `listening`)
//! 4. Client streams raw PCM16 audio as binary messages
//! 5. Server sends back transcripts, state changes, and binary response audio
//! 6. Client sends `{"type": "end"}` for a graceful close, or just disconnects
//!
//! ### Message Types
//!
//! **Incoming Messages:**
//! - `{"type": "commit_turn"}` - Push-to-talk end of turn (client-energy mode)
//! - `{"type": "end"}` - Graceful close request
//! - **Binary messages** - One raw PCM16 audio frame per message
//!
//! **Outgoing Messages:**
//! - `{"type": "session_update", "state": "listening", "detail": "..."}` -
//!   Conversation state change (`detail` is optional)
//! - `{"type": "transcription", "transcript": "..."}` - What the caller said
//! - `{"type": "transcript_delta", "delta": "..."}` - Fragment of the model's
//!   spoken-response transcript
//! - `{"type": "processing"}` - A response is being generated
//! - `{"type": "degraded", "dropped": 12}` - Backpressure dropped audio;
//!   `dropped` is the session-cumulative count
//! - `{"type": "error", "code": "...", "message": "...", "recoverable": true}` -
//!   Error occurred; recoverable errors leave the session reusable
//! - `{"type": "complete"}` - Terminal event of a graceful teardown
//! - **Binary messages** - Raw PCM16 response audio (optimized for performance)
//!
//! ## JavaScript Client Example
//!
//! ```javascript
//! const response = await fetch('/api/v1/start-session', { method: 'POST' });
//! const { session_id } = await response.json();
//!
//! const ws = new WebSocket(`ws://localhost:3001/api/v1/ws/${session_id}`);
//! ws.binaryType = 'arraybuffer';
//!
//! ws.onmessage = (event) => {
//!   if (event.data instanceof ArrayBuffer) {
//!     playAudio(event.data); // PCM16 response audio
//!     return;
//!   }
//!   const message = JSON.parse(event.data);
//!   switch (message.type) {
//!     case 'session_update':
//!       console.log('State:', message.state, message.detail ?? '');
//!       break;
//!     case 'transcription':
//!       console.log('You said:', message.transcript);
//!       break;
//!     case 'transcript_delta':
//!       appendToCaption(message.delta);
//!       break;
//!     case 'error':
//!       console.error(message.code, message.message);
//!       break;
//!     case 'complete':
//!       ws.close();
//!       break;
//!   }
//! };
//!
//! // Stream microphone audio as raw PCM16 frames
//! recorder.ondata = (pcmFrame) => ws.send(pcmFrame);
//!
//! // End the conversation gracefully
//! function hangUp() {
//!   ws.send(JSON.stringify({ type: 'end' }));
//! }
//! ```
//!
//! ## Performance Considerations
//!
//! - **Binary Messages**: Audio rides binary WebSocket messages in both
//!   directions; no base64 on the client wire
//! - **Bounded Buffers**: Audio queues drop oldest frames under backpressure
//!   and report the loss via `degraded` events rather than stalling
//! - **Dedicated Sender Task**: Outgoing JSON and audio are serialized by one
//!   task so slow consumers never block frame intake

pub mod handler;
pub mod messages;

// Re-export commonly used items
pub use handler::ws_voice_handler;
pub use messages::{IncomingMessage, MessageRoute, OutgoingMessage};

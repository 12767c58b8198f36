//! HTTP and WebSocket request handlers
//!
//! This module organizes all API handlers into logical groups:
//! - `api` - Health check endpoint
//! - `session` - Session lifecycle REST API (start, status, end)
//! - `ws` - WebSocket audio streaming for an existing session

pub mod api;
pub mod session;
pub mod ws;

// Re-export commonly used handlers for convenient access
pub use ws::ws_voice_handler;

//! Connectors for hosted speech-to-speech endpoints

pub mod base;
pub mod realtime;

pub use base::{
    SessionSetup, UpstreamChannel, UpstreamCommand, UpstreamConnector, UpstreamError,
    UpstreamEvent, UPSTREAM_CHANNEL_CAPACITY,
};
pub use realtime::{RealtimeConfig, RealtimeConnector};

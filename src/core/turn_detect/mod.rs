//! Turn boundary detection
//!
//! A deterministic state machine over a stream of per-frame voice-activity
//! samples. Samples come either from client-side energy measurement (RMS of
//! each PCM frame against a threshold) or from upstream-reported
//! speech-start/speech-stop events; both sources feed the same machine
//! through the [`VadSample`] input, so one test suite covers either path.
//!
//! The machine counts samples rather than wall-clock time: given the same
//! ordered input it always emits the same ordered events, independent of
//! audio hardware or scheduler timing.

pub mod config;
pub mod detector;

pub use config::TurnDetectorConfig;
pub use detector::{TurnDetector, TurnEvent, TurnState, VadSample, VadSignal};

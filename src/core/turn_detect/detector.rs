use tracing::trace;

use super::config::TurnDetectorConfig;

/// Voice-activity signal for one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadSignal {
    /// Raw energy level, compared against the configured threshold.
    Energy(f32),
    /// Externally decided speech flag (upstream server VAD).
    Speech(bool),
}

/// One timestamped voice-activity sample.
///
/// The timestamp is carried through to emitted events for diagnostics; it
/// plays no part in state decisions, which count samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadSample {
    pub timestamp_ms: u64,
    pub signal: VadSignal,
}

impl VadSample {
    pub fn energy(timestamp_ms: u64, level: f32) -> Self {
        Self {
            timestamp_ms,
            signal: VadSignal::Energy(level),
        }
    }

    pub fn speech(timestamp_ms: u64, speaking: bool) -> Self {
        Self {
            timestamp_ms,
            signal: VadSignal::Speech(speaking),
        }
    }
}

/// Detector states. `SpeechStarting` and `SpeechEnding` are the debounce
/// windows; only confirmed transitions emit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Silent,
    SpeechStarting,
    Speaking,
    SpeechEnding,
}

/// Turn boundary events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// Dwell satisfied: the user is speaking.
    TurnStarted { timestamp_ms: u64 },
    /// Silence persisted past the configured window: the turn is over.
    TurnEnded { timestamp_ms: u64 },
}

/// Deterministic turn-boundary state machine.
///
/// `SILENT -> SPEECH_STARTING -> SPEAKING -> SPEECH_ENDING -> SILENT`, with
/// sub-threshold spikes and brief pauses folded back without events. Owned
/// exclusively by its session's bridge task, so no interior locking.
#[derive(Debug)]
pub struct TurnDetector {
    config: TurnDetectorConfig,
    state: TurnState,
    speech_run: u32,
    silence_run: u32,
}

impl TurnDetector {
    pub fn new(config: TurnDetectorConfig) -> Self {
        Self {
            // Zero thresholds would deadlock the machine in its debounce
            // states; clamp to the minimum meaningful value.
            config: TurnDetectorConfig {
                threshold: config.threshold,
                start_dwell: config.start_dwell.max(1),
                end_silence: config.end_silence.max(1),
            },
            state: TurnState::Silent,
            speech_run: 0,
            silence_run: 0,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn config(&self) -> &TurnDetectorConfig {
        &self.config
    }

    /// Return to `Silent` and clear debounce counters. Used when a session's
    /// relay restarts; in-progress turns are abandoned without events.
    pub fn reset(&mut self) {
        self.state = TurnState::Silent;
        self.speech_run = 0;
        self.silence_run = 0;
    }

    fn is_speech(&self, signal: VadSignal) -> bool {
        match signal {
            VadSignal::Energy(level) => level >= self.config.threshold,
            VadSignal::Speech(speaking) => speaking,
        }
    }

    /// Advance the machine by one sample, returning the event it confirms,
    /// if any.
    pub fn process(&mut self, sample: VadSample) -> Option<TurnEvent> {
        let speech = self.is_speech(sample.signal);

        let event = match (self.state, speech) {
            (TurnState::Silent, true) => {
                self.speech_run = 1;
                if self.speech_run >= self.config.start_dwell {
                    self.state = TurnState::Speaking;
                    Some(TurnEvent::TurnStarted {
                        timestamp_ms: sample.timestamp_ms,
                    })
                } else {
                    self.state = TurnState::SpeechStarting;
                    None
                }
            }
            (TurnState::Silent, false) => None,
            (TurnState::SpeechStarting, true) => {
                self.speech_run += 1;
                if self.speech_run >= self.config.start_dwell {
                    self.state = TurnState::Speaking;
                    Some(TurnEvent::TurnStarted {
                        timestamp_ms: sample.timestamp_ms,
                    })
                } else {
                    None
                }
            }
            (TurnState::SpeechStarting, false) => {
                // Sub-dwell spike; not a turn.
                self.state = TurnState::Silent;
                self.speech_run = 0;
                None
            }
            (TurnState::Speaking, true) => None,
            (TurnState::Speaking, false) => {
                self.silence_run = 1;
                if self.silence_run >= self.config.end_silence {
                    self.finish_turn(sample.timestamp_ms)
                } else {
                    self.state = TurnState::SpeechEnding;
                    None
                }
            }
            (TurnState::SpeechEnding, true) => {
                // Brief pause, not a boundary; resume without an event.
                self.state = TurnState::Speaking;
                self.silence_run = 0;
                None
            }
            (TurnState::SpeechEnding, false) => {
                self.silence_run += 1;
                if self.silence_run >= self.config.end_silence {
                    self.finish_turn(sample.timestamp_ms)
                } else {
                    None
                }
            }
        };

        if let Some(ref ev) = event {
            trace!("Turn event: {:?} (state now {:?})", ev, self.state);
        }
        event
    }

    fn finish_turn(&mut self, timestamp_ms: u64) -> Option<TurnEvent> {
        self.state = TurnState::Silent;
        self.speech_run = 0;
        self.silence_run = 0;
        Some(TurnEvent::TurnEnded { timestamp_ms })
    }
}

impl Default for TurnDetector {
    fn default() -> Self {
        Self::new(TurnDetectorConfig::default())
    }
}

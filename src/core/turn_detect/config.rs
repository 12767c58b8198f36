/// Configuration for the turn-boundary state machine.
///
/// Dwell and silence thresholds are expressed in samples (one sample per
/// audio frame or per upstream VAD event), which keeps the machine
/// deterministic. At the default 20 ms frame cadence the defaults
/// correspond to 60 ms of confirmation before a turn starts and 500 ms of
/// silence before it ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnDetectorConfig {
    /// Energy level treated as speech (`energy >= threshold`), normalized
    /// to `[0.0, 1.0]`. Ignored for explicit speech-flag samples.
    pub threshold: f32,
    /// Consecutive speech samples required before `TurnStarted` fires.
    pub start_dwell: u32,
    /// Consecutive silence samples required before `TurnEnded` fires.
    pub end_silence: u32,
}

impl Default for TurnDetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            start_dwell: 3,
            end_silence: 25,
        }
    }
}

impl TurnDetectorConfig {
    /// Configuration for upstream-reported VAD events.
    ///
    /// The upstream endpoint has already debounced its speech boundaries,
    /// so every event is taken at face value.
    pub fn for_upstream_vad() -> Self {
        Self {
            threshold: 0.5,
            start_dwell: 1,
            end_silence: 1,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_start_dwell(mut self, samples: u32) -> Self {
        self.start_dwell = samples.max(1);
        self
    }

    pub fn with_end_silence(mut self, samples: u32) -> Self {
        self.end_silence = samples.max(1);
        self
    }
}

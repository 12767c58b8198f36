//! Integration tests for turn-boundary detection.
//!
//! These tests validate:
//! - Whole-conversation sequences against the detector's public API
//! - Parity between energy samples and explicit speech flags
//! - Deterministic replay of identical inputs
//! - Configuration effects on boundary placement

use orato::core::turn_detect::{
    TurnDetector, TurnDetectorConfig, TurnEvent, TurnState, VadSample,
};

/// Feed speech flags with timestamps 0, 1, 2, ... and collect every event.
fn drive_flags(detector: &mut TurnDetector, flags: &[bool]) -> Vec<TurnEvent> {
    flags
        .iter()
        .enumerate()
        .filter_map(|(i, &speaking)| detector.process(VadSample::speech(i as u64, speaking)))
        .collect()
}

/// Expand (flag, count) run-length segments into a flag sequence.
fn segments(pattern: &[(bool, usize)]) -> Vec<bool> {
    let mut flags = Vec::new();
    for &(flag, count) in pattern {
        flags.extend(std::iter::repeat_n(flag, count));
    }
    flags
}

// =============================================================================
// Conversation Sequence Tests
// =============================================================================

mod detector_sequence_tests {
    use super::*;

    #[test]
    fn test_full_utterance_emits_one_turn() {
        let config = TurnDetectorConfig::default()
            .with_start_dwell(2)
            .with_end_silence(5);
        let mut detector = TurnDetector::new(config);

        // Silence, an utterance with one brief pause, then lasting silence
        let flags = segments(&[(false, 5), (true, 10), (false, 3), (true, 2), (false, 20)]);
        let events = drive_flags(&mut detector, &flags);

        // The pause is shorter than end_silence, so it stays inside the turn
        assert_eq!(
            events,
            vec![
                TurnEvent::TurnStarted { timestamp_ms: 6 },
                TurnEvent::TurnEnded { timestamp_ms: 24 },
            ]
        );
        assert_eq!(detector.state(), TurnState::Silent);
    }

    #[test]
    fn test_hesitating_speaker_keeps_single_turn() {
        let config = TurnDetectorConfig::default()
            .with_start_dwell(2)
            .with_end_silence(4);
        let mut detector = TurnDetector::new(config);

        // "Hello... um... how are... you?" with pauses below the silence window
        let flags = segments(&[
            (true, 5),
            (false, 2),
            (true, 3),
            (false, 2),
            (true, 4),
            (false, 2),
            (true, 3),
            (false, 10),
        ]);
        let events = drive_flags(&mut detector, &flags);

        let starts = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::TurnStarted { .. }))
            .count();
        let ends = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::TurnEnded { .. }))
            .count();
        assert_eq!(starts, 1, "hesitations must not split the turn: {events:?}");
        assert_eq!(ends, 1, "the final silence must close the turn: {events:?}");
    }

    #[test]
    fn test_rapid_exchange_produces_turn_per_utterance() {
        let config = TurnDetectorConfig::default()
            .with_start_dwell(2)
            .with_end_silence(3);
        let mut detector = TurnDetector::new(config);

        let flags = segments(&[
            (true, 6),
            (false, 8),
            (true, 4),
            (false, 8),
            (true, 5),
            (false, 8),
        ]);
        let events = drive_flags(&mut detector, &flags);

        assert_eq!(events.len(), 6);
        for (i, event) in events.iter().enumerate() {
            if i % 2 == 0 {
                assert!(
                    matches!(event, TurnEvent::TurnStarted { .. }),
                    "event {i} should start a turn: {events:?}"
                );
            } else {
                assert!(
                    matches!(event, TurnEvent::TurnEnded { .. }),
                    "event {i} should end a turn: {events:?}"
                );
            }
        }
    }

    #[test]
    fn test_background_noise_stays_silent() {
        let mut detector = TurnDetector::new(TurnDetectorConfig::default());

        // Low-level noise with an isolated spike shorter than the dwell
        let levels = [0.1, 0.2, 0.1, 0.3, 0.8, 0.2, 0.1, 0.4, 0.1, 0.2];
        for (i, &level) in levels.iter().enumerate() {
            let event = detector.process(VadSample::energy(i as u64, level));
            assert_eq!(event, None, "noise sample {i} produced an event");
        }
        assert_eq!(detector.state(), TurnState::Silent);
    }

    #[test]
    fn test_reset_abandons_turn_and_allows_fresh_start() {
        let config = TurnDetectorConfig::default()
            .with_start_dwell(2)
            .with_end_silence(3);
        let mut detector = TurnDetector::new(config);

        let events = drive_flags(&mut detector, &segments(&[(true, 4)]));
        assert_eq!(events.len(), 1);
        assert_eq!(detector.state(), TurnState::Speaking);

        // An explicit commit resets the machine mid-turn
        detector.reset();
        assert_eq!(detector.state(), TurnState::Silent);

        // Silence after the reset must not emit a stale turn end
        let events = drive_flags(&mut detector, &segments(&[(false, 10)]));
        assert!(events.is_empty());

        // The next utterance starts a fresh turn
        let events = drive_flags(&mut detector, &segments(&[(true, 4), (false, 5)]));
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TurnEvent::TurnStarted { .. }));
        assert!(matches!(events[1], TurnEvent::TurnEnded { .. }));
    }
}

// =============================================================================
// Signal Source Parity Tests
// =============================================================================

mod signal_parity_tests {
    use super::*;

    #[test]
    fn test_energy_and_flag_streams_match() {
        let config = TurnDetectorConfig::default()
            .with_threshold(0.5)
            .with_start_dwell(2)
            .with_end_silence(3);

        let flags = segments(&[(false, 3), (true, 6), (false, 2), (true, 3), (false, 6)]);

        let mut flag_detector = TurnDetector::new(config);
        let flag_events = drive_flags(&mut flag_detector, &flags);

        // The same pattern expressed as energy levels around the threshold
        let mut energy_detector = TurnDetector::new(config);
        let energy_events: Vec<TurnEvent> = flags
            .iter()
            .enumerate()
            .filter_map(|(i, &speaking)| {
                let level = if speaking { 0.9 } else { 0.05 };
                energy_detector.process(VadSample::energy(i as u64, level))
            })
            .collect();

        assert_eq!(flag_events, energy_events);
    }

    #[test]
    fn test_detector_is_deterministic_across_instances() {
        let config = TurnDetectorConfig::default()
            .with_start_dwell(3)
            .with_end_silence(4);
        let flags = segments(&[
            (false, 2),
            (true, 8),
            (false, 2),
            (true, 1),
            (false, 6),
            (true, 5),
            (false, 10),
        ]);

        let mut first = TurnDetector::new(config);
        let mut second = TurnDetector::new(config);

        assert_eq!(
            drive_flags(&mut first, &flags),
            drive_flags(&mut second, &flags)
        );

        // A detector that finished one conversation replays the next one
        // identically to a fresh instance
        let mut reused = first;
        let mut fresh = TurnDetector::new(config);
        assert_eq!(
            drive_flags(&mut reused, &flags),
            drive_flags(&mut fresh, &flags)
        );
    }
}

// =============================================================================
// Configuration Effect Tests
// =============================================================================

mod config_tests {
    use super::*;

    #[test]
    fn test_upstream_vad_config_passes_boundaries_through() {
        // Upstream boundaries are pre-debounced; each flag flip is a turn edge
        let mut detector = TurnDetector::new(TurnDetectorConfig::for_upstream_vad());

        assert_eq!(
            detector.process(VadSample::speech(100, true)),
            Some(TurnEvent::TurnStarted { timestamp_ms: 100 })
        );
        assert_eq!(
            detector.process(VadSample::speech(900, false)),
            Some(TurnEvent::TurnEnded { timestamp_ms: 900 })
        );
        assert_eq!(detector.state(), TurnState::Silent);
    }

    #[test]
    fn test_longer_dwell_filters_shorter_bursts() {
        let flags = segments(&[(true, 3), (false, 6)]);

        let mut short_dwell = TurnDetector::new(
            TurnDetectorConfig::default()
                .with_start_dwell(2)
                .with_end_silence(4),
        );
        let events = drive_flags(&mut short_dwell, &flags);
        assert_eq!(events.len(), 2, "a 3-sample burst passes a dwell of 2");

        let mut long_dwell = TurnDetector::new(
            TurnDetectorConfig::default()
                .with_start_dwell(4)
                .with_end_silence(4),
        );
        let events = drive_flags(&mut long_dwell, &flags);
        assert!(events.is_empty(), "a 3-sample burst fails a dwell of 4");
    }

    #[test]
    fn test_longer_end_silence_delays_turn_end() {
        let flags = segments(&[(true, 5), (false, 30)]);

        let mut quick = TurnDetector::new(
            TurnDetectorConfig::default()
                .with_start_dwell(2)
                .with_end_silence(3),
        );
        let quick_end = drive_flags(&mut quick, &flags)
            .into_iter()
            .find_map(|e| match e {
                TurnEvent::TurnEnded { timestamp_ms } => Some(timestamp_ms),
                _ => None,
            })
            .unwrap();

        let mut patient = TurnDetector::new(
            TurnDetectorConfig::default()
                .with_start_dwell(2)
                .with_end_silence(20),
        );
        let patient_end = drive_flags(&mut patient, &flags)
            .into_iter()
            .find_map(|e| match e {
                TurnEvent::TurnEnded { timestamp_ms } => Some(timestamp_ms),
                _ => None,
            })
            .unwrap();

        assert_eq!(quick_end, 7);
        assert_eq!(patient_end, 24);
    }
}

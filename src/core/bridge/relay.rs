//! The per-session relay loop
//!
//! One `tokio::select!` drives everything for a session: client frames,
//! upstream events, flush permits for the two bounded audio queues, and
//! the shutdown signal. Audio is the only thing that may be dropped
//! under backpressure (oldest frame first, reported through a
//! `degraded` event); control and transcript sends are always awaited.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::core::audio::{self, AudioFormat, AudioStats};
use crate::core::turn_detect::{TurnDetector, TurnEvent, VadSample};
use crate::core::upstream::{
    SessionSetup, UpstreamChannel, UpstreamCommand, UpstreamConnector, UpstreamError,
    UpstreamEvent,
};

use super::{
    BridgeConfig, BridgeError, BridgeExit, BridgeState, ClientChannel, ClientCommand,
    ClientEvent, ClientFrame, TurnMode,
};

/// Relay between one client connection and one upstream session.
pub struct VoiceSessionBridge {
    session_id: Uuid,
    config: BridgeConfig,
    connector: Arc<dyn UpstreamConnector>,
    setup: SessionSetup,
    client: ClientChannel,
    stats: Arc<AudioStats>,
    extraction_warning: Option<String>,
    shutdown: broadcast::Receiver<()>,
}

impl VoiceSessionBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: Uuid,
        config: BridgeConfig,
        connector: Arc<dyn UpstreamConnector>,
        setup: SessionSetup,
        client: ClientChannel,
        stats: Arc<AudioStats>,
        extraction_warning: Option<String>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            session_id,
            config,
            connector,
            setup,
            client,
            stats,
            extraction_warning,
            shutdown,
        }
    }

    /// Run the session to completion. Consumes the bridge; the returned
    /// exit tells the registry how to finalize the session.
    pub async fn run(mut self) -> BridgeExit {
        info!(
            session_id = %self.session_id,
            provider = self.connector.provider_info(),
            turn_mode = %self.config.turn_mode,
            "Starting session bridge"
        );

        let upstream = match self.initialize().await {
            Ok(channel) => channel,
            Err(BridgeError::ClientGone) => return BridgeExit::ClientDisconnected,
            Err(e) => {
                warn!(session_id = %self.session_id, "Bridge initialization failed: {}", e);
                let _ = self
                    .client
                    .events
                    .send(ClientEvent::Error {
                        code: "upstream_connect_failed".to_string(),
                        message: e.to_string(),
                        recoverable: true,
                    })
                    .await;
                return BridgeExit::ConnectFailed;
            }
        };

        if self.send_update(BridgeState::Ready, None).await.is_err() {
            return BridgeExit::ClientDisconnected;
        }
        // The one-time extraction warning rides the listening update.
        let warning = self.extraction_warning.take();
        if self.send_update(BridgeState::Listening, warning).await.is_err() {
            return BridgeExit::ClientDisconnected;
        }

        self.relay(upstream).await
    }

    /// Dial the endpoint and wait for its readiness acknowledgment.
    async fn initialize(&mut self) -> Result<UpstreamChannel, BridgeError> {
        let mut upstream = timeout(
            self.config.connect_timeout,
            self.connector.open(self.setup.clone()),
        )
        .await
        .map_err(|_| {
            UpstreamError::Connect(format!(
                "dial timed out after {:?}",
                self.config.connect_timeout
            ))
        })??;

        match timeout(self.config.connect_timeout, upstream.events.recv()).await {
            Ok(Some(UpstreamEvent::SessionReady)) => {
                debug!(session_id = %self.session_id, "Upstream session ready");
                Ok(upstream)
            }
            Ok(Some(UpstreamEvent::Error { code, message })) => Err(BridgeError::UpstreamConnect(
                UpstreamError::Connect(format!("{message} (code {code:?})")),
            )),
            Ok(Some(UpstreamEvent::Closed)) | Ok(None) => Err(BridgeError::ClosedBeforeReady),
            Ok(Some(other)) => Err(BridgeError::UpstreamConnect(UpstreamError::Protocol(
                format!("unexpected first event: {other:?}"),
            ))),
            Err(_) => Err(BridgeError::ReadyTimeout(self.config.connect_timeout)),
        }
    }

    async fn send_update(
        &self,
        state: BridgeState,
        detail: Option<String>,
    ) -> Result<(), BridgeError> {
        self.client
            .events
            .send(ClientEvent::SessionUpdate { state, detail })
            .await
            .map_err(|_| BridgeError::ClientGone)
    }

    async fn relay(self, upstream: UpstreamChannel) -> BridgeExit {
        let VoiceSessionBridge {
            session_id,
            config,
            connector: _,
            setup: _,
            client,
            stats,
            extraction_warning: _,
            mut shutdown,
        } = self;

        let ClientChannel {
            frames: mut client_frames,
            events: client_events,
        } = client;
        let UpstreamChannel {
            commands: upstream_commands,
            events: mut upstream_events,
        } = upstream;

        let mut machine = RelayMachine::new(session_id, &config, Arc::clone(&stats));

        let exit = loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(%session_id, "Bridge received shutdown signal");
                    break BridgeExit::Shutdown;
                }

                frame = client_frames.recv() => {
                    let Some(frame) = frame else {
                        info!(%session_id, "Client channel closed");
                        break BridgeExit::ClientDisconnected;
                    };
                    let flow = match frame {
                        ClientFrame::Audio(payload) => {
                            machine.on_client_audio(payload, &client_events, &upstream_commands).await
                        }
                        ClientFrame::Control(ClientCommand::CommitTurn) => {
                            machine.on_commit_turn(&client_events, &upstream_commands).await
                        }
                        ClientFrame::Control(ClientCommand::End) => {
                            info!(%session_id, "Client requested end of session");
                            Some(BridgeExit::Complete)
                        }
                    };
                    if let Some(exit) = flow {
                        break exit;
                    }
                }

                event = upstream_events.recv() => {
                    let Some(event) = event else {
                        warn!(%session_id, "Upstream channel closed unexpectedly");
                        let _ = client_events.send(ClientEvent::Error {
                            code: "upstream_closed".to_string(),
                            message: "upstream connection lost".to_string(),
                            recoverable: false,
                        }).await;
                        break BridgeExit::UpstreamFailed;
                    };
                    if let Some(exit) = machine
                        .on_upstream_event(event, &client_events, &upstream_commands)
                        .await
                    {
                        break exit;
                    }
                }

                permit = upstream_commands.reserve(), if !machine.upstream_audio.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(frame) = machine.upstream_audio.pop_front() {
                                permit.send(UpstreamCommand::AppendAudio(frame));
                                stats.record_in();
                            }
                            machine.flush_pending_degraded(&client_events);
                        }
                        Err(_) => {
                            warn!(%session_id, "Upstream command channel closed");
                            let _ = client_events.send(ClientEvent::Error {
                                code: "upstream_closed".to_string(),
                                message: "upstream connection lost".to_string(),
                                recoverable: false,
                            }).await;
                            break BridgeExit::UpstreamFailed;
                        }
                    }
                }

                permit = client_events.reserve(), if !machine.client_audio.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(frame) = machine.client_audio.pop_front() {
                                permit.send(ClientEvent::ResponseAudio(frame));
                                stats.record_out();
                            }
                            machine.flush_pending_degraded(&client_events);
                        }
                        Err(_) => break BridgeExit::ClientDisconnected,
                    }
                }
            }
        };

        // Teardown per exit cause. Error events were already delivered at
        // the point of failure.
        match exit {
            BridgeExit::Complete | BridgeExit::Shutdown => {
                while let Some(frame) = machine.client_audio.pop_front() {
                    if client_events
                        .send(ClientEvent::ResponseAudio(frame))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    stats.record_out();
                }
                let _ = client_events.send(ClientEvent::Complete).await;
                let _ = upstream_commands.send(UpstreamCommand::Close).await;
            }
            BridgeExit::ClientDisconnected => {
                let _ = upstream_commands.send(UpstreamCommand::Close).await;
            }
            BridgeExit::UpstreamFailed | BridgeExit::ConnectFailed => {}
        }

        let snapshot = stats.snapshot();
        info!(
            %session_id,
            exit = ?exit,
            frames_in = snapshot.frames_in,
            frames_out = snapshot.frames_out,
            rejected = snapshot.rejected,
            dropped = snapshot.dropped,
            "Session bridge finished"
        );
        exit
    }
}

/// Conversation state plus the two drop-oldest audio queues. Mutated only
/// from the relay loop.
struct RelayMachine {
    session_id: Uuid,
    state: BridgeState,
    turn_mode: TurnMode,
    detector: TurnDetector,
    client_sample_rate: u32,
    upstream_sample_rate: u32,
    queue_capacity: usize,
    upstream_audio: VecDeque<Bytes>,
    client_audio: VecDeque<Bytes>,
    stats: Arc<AudioStats>,
    /// Accumulated received-audio time, the VAD clock.
    clock_ms: f64,
    /// Suppress fragments of a cancelled response until its done marker.
    stale_response: bool,
    /// Cumulative drop count already reported to the client.
    reported_drops: u64,
}

impl RelayMachine {
    fn new(session_id: Uuid, config: &BridgeConfig, stats: Arc<AudioStats>) -> Self {
        Self {
            session_id,
            // run() has already walked READY into LISTENING.
            state: BridgeState::Listening,
            turn_mode: config.turn_mode,
            detector: TurnDetector::new(config.detector),
            client_sample_rate: config.client_sample_rate,
            upstream_sample_rate: config.upstream_sample_rate,
            queue_capacity: config.audio_buffer_frames.max(1),
            upstream_audio: VecDeque::new(),
            client_audio: VecDeque::new(),
            stats,
            clock_ms: 0.0,
            stale_response: false,
            reported_drops: 0,
        }
    }

    async fn on_client_audio(
        &mut self,
        payload: Bytes,
        client_events: &mpsc::Sender<ClientEvent>,
        upstream_commands: &mpsc::Sender<UpstreamCommand>,
    ) -> Option<BridgeExit> {
        let Some(frame) = self.accept_frame(payload) else {
            return None;
        };

        self.clock_ms += audio::duration_ms(frame.len(), self.upstream_sample_rate);

        if self.turn_mode == TurnMode::ClientEnergy
            && matches!(self.state, BridgeState::Listening | BridgeState::Speaking)
        {
            let sample = VadSample::energy(self.clock_ms as u64, audio::rms_energy(&frame));
            if let Some(event) = self.detector.process(sample) {
                if let Some(exit) = self
                    .on_turn_event(event, client_events, upstream_commands)
                    .await
                {
                    return Some(exit);
                }
            }
        }

        match self.state {
            BridgeState::Listening | BridgeState::Speaking => {
                self.enqueue_upstream(frame, client_events);
            }
            BridgeState::Processing => {
                trace!(session_id = %self.session_id, "Holding client audio while a response is pending");
            }
            other => {
                trace!(session_id = %self.session_id, state = %other, "Ignoring client audio");
            }
        }
        None
    }

    /// Validate one inbound payload, tolerating canonical WAV wrapping,
    /// and convert it to the upstream sample rate.
    fn accept_frame(&mut self, payload: Bytes) -> Option<Bytes> {
        let pcm: Bytes = match audio::detect_format(&payload) {
            AudioFormat::RawPcm => payload,
            AudioFormat::Wav => match audio::strip_wav_header(&payload) {
                Some(stripped) => Bytes::copy_from_slice(stripped),
                None => {
                    self.stats.record_rejected();
                    warn!(session_id = %self.session_id, "Rejected WAV frame with no sample payload");
                    return None;
                }
            },
            other => {
                self.stats.record_rejected();
                warn!(session_id = %self.session_id, format = %other, "Rejected container audio frame");
                return None;
            }
        };

        if let Err(e) = audio::validate_pcm16(&pcm) {
            self.stats.record_rejected();
            warn!(session_id = %self.session_id, "Rejected audio frame: {}", e);
            return None;
        }

        if self.client_sample_rate != self.upstream_sample_rate {
            let resampled =
                audio::resample_linear(&pcm, self.client_sample_rate, self.upstream_sample_rate);
            return Some(Bytes::from(resampled));
        }
        Some(pcm)
    }

    async fn on_commit_turn(
        &mut self,
        client_events: &mpsc::Sender<ClientEvent>,
        upstream_commands: &mpsc::Sender<UpstreamCommand>,
    ) -> Option<BridgeExit> {
        if self.turn_mode == TurnMode::ServerVad {
            debug!(session_id = %self.session_id, "Ignoring commit_turn; endpoint owns turn detection");
            return None;
        }
        if self.state != BridgeState::Listening {
            debug!(session_id = %self.session_id, state = %self.state, "Ignoring commit_turn outside listening");
            return None;
        }
        self.detector.reset();
        self.finish_turn(client_events, upstream_commands).await
    }

    async fn on_turn_event(
        &mut self,
        event: TurnEvent,
        client_events: &mpsc::Sender<ClientEvent>,
        upstream_commands: &mpsc::Sender<UpstreamCommand>,
    ) -> Option<BridgeExit> {
        match event {
            TurnEvent::TurnStarted { timestamp_ms } => {
                if self.state == BridgeState::Speaking {
                    debug!(session_id = %self.session_id, timestamp_ms, "Barge-in, cancelling active response");
                    if upstream_commands
                        .send(UpstreamCommand::CancelResponse)
                        .await
                        .is_err()
                    {
                        return Some(BridgeExit::UpstreamFailed);
                    }
                    // Everything buffered or still in flight belongs to
                    // the cancelled response.
                    self.client_audio.clear();
                    self.stale_response = true;
                    self.state = BridgeState::Listening;
                    if client_events
                        .send(ClientEvent::SessionUpdate {
                            state: BridgeState::Listening,
                            detail: Some("interrupted".to_string()),
                        })
                        .await
                        .is_err()
                    {
                        return Some(BridgeExit::ClientDisconnected);
                    }
                } else {
                    trace!(session_id = %self.session_id, timestamp_ms, state = %self.state, "Turn started");
                }
                None
            }
            TurnEvent::TurnEnded { timestamp_ms } => {
                if self.state == BridgeState::Listening {
                    debug!(session_id = %self.session_id, timestamp_ms, "Turn ended");
                    self.finish_turn(client_events, upstream_commands).await
                } else {
                    trace!(session_id = %self.session_id, timestamp_ms, state = %self.state, "Ignoring turn end");
                    None
                }
            }
        }
    }

    /// Close the current input turn and move to PROCESSING.
    async fn finish_turn(
        &mut self,
        client_events: &mpsc::Sender<ClientEvent>,
        upstream_commands: &mpsc::Sender<UpstreamCommand>,
    ) -> Option<BridgeExit> {
        if self.turn_mode == TurnMode::ClientEnergy {
            // Flush buffered audio first so the tail of the utterance
            // lands in the turn being committed.
            while let Some(frame) = self.upstream_audio.pop_front() {
                if upstream_commands
                    .send(UpstreamCommand::AppendAudio(frame))
                    .await
                    .is_err()
                {
                    return Some(BridgeExit::UpstreamFailed);
                }
                self.stats.record_in();
            }
            if upstream_commands
                .send(UpstreamCommand::CommitTurn)
                .await
                .is_err()
            {
                return Some(BridgeExit::UpstreamFailed);
            }
            if upstream_commands
                .send(UpstreamCommand::CreateResponse)
                .await
                .is_err()
            {
                return Some(BridgeExit::UpstreamFailed);
            }
        }

        self.state = BridgeState::Processing;
        if client_events.send(ClientEvent::Processing).await.is_err() {
            return Some(BridgeExit::ClientDisconnected);
        }
        None
    }

    async fn on_upstream_event(
        &mut self,
        event: UpstreamEvent,
        client_events: &mpsc::Sender<ClientEvent>,
        upstream_commands: &mpsc::Sender<UpstreamCommand>,
    ) -> Option<BridgeExit> {
        match event {
            UpstreamEvent::SessionReady => {
                // Endpoints may acknowledge twice (created + updated).
                debug!(session_id = %self.session_id, "Duplicate readiness acknowledgment");
                None
            }
            UpstreamEvent::SpeechStarted { audio_start_ms } => {
                self.on_endpoint_vad(true, audio_start_ms, client_events, upstream_commands)
                    .await
            }
            UpstreamEvent::SpeechStopped => {
                self.on_endpoint_vad(false, None, client_events, upstream_commands)
                    .await
            }
            UpstreamEvent::InputTranscript { transcript } => {
                debug!(session_id = %self.session_id, chars = transcript.len(), "User transcript complete");
                if client_events
                    .send(ClientEvent::Transcription { transcript })
                    .await
                    .is_err()
                {
                    return Some(BridgeExit::ClientDisconnected);
                }
                None
            }
            UpstreamEvent::ResponseAudio { audio } => {
                if self.stale_response {
                    trace!(session_id = %self.session_id, "Discarding audio of cancelled response");
                    return None;
                }
                if let Some(exit) = self.enter_speaking(client_events).await {
                    return Some(exit);
                }
                self.enqueue_client(audio, client_events);
                None
            }
            UpstreamEvent::ResponseTranscriptDelta { delta } => {
                if self.stale_response {
                    return None;
                }
                if let Some(exit) = self.enter_speaking(client_events).await {
                    return Some(exit);
                }
                if client_events
                    .send(ClientEvent::TranscriptDelta { delta })
                    .await
                    .is_err()
                {
                    return Some(BridgeExit::ClientDisconnected);
                }
                None
            }
            UpstreamEvent::ResponseTranscriptDone { transcript } => {
                // Deltas already carried the text.
                debug!(session_id = %self.session_id, chars = transcript.len(), "Response transcript complete");
                None
            }
            UpstreamEvent::ResponseDone => {
                if self.stale_response {
                    debug!(session_id = %self.session_id, "Cancelled response finished");
                    self.stale_response = false;
                    return None;
                }
                if matches!(self.state, BridgeState::Speaking | BridgeState::Processing) {
                    self.state = BridgeState::Listening;
                    if client_events
                        .send(ClientEvent::SessionUpdate {
                            state: BridgeState::Listening,
                            detail: None,
                        })
                        .await
                        .is_err()
                    {
                        return Some(BridgeExit::ClientDisconnected);
                    }
                }
                None
            }
            UpstreamEvent::Error { code, message } => {
                warn!(session_id = %self.session_id, ?code, "Upstream error: {}", message);
                let _ = client_events
                    .send(ClientEvent::Error {
                        code: code.unwrap_or_else(|| "upstream_error".to_string()),
                        message,
                        recoverable: false,
                    })
                    .await;
                Some(BridgeExit::UpstreamFailed)
            }
            UpstreamEvent::Closed => {
                warn!(session_id = %self.session_id, "Upstream closed mid-session");
                let _ = client_events
                    .send(ClientEvent::Error {
                        code: "upstream_closed".to_string(),
                        message: "upstream connection closed".to_string(),
                        recoverable: false,
                    })
                    .await;
                Some(BridgeExit::UpstreamFailed)
            }
        }
    }

    async fn on_endpoint_vad(
        &mut self,
        speech: bool,
        reported_ms: Option<u64>,
        client_events: &mpsc::Sender<ClientEvent>,
        upstream_commands: &mpsc::Sender<UpstreamCommand>,
    ) -> Option<BridgeExit> {
        if self.turn_mode != TurnMode::ServerVad {
            debug!(session_id = %self.session_id, "Ignoring endpoint VAD event in client-energy mode");
            return None;
        }
        let timestamp = reported_ms.unwrap_or(self.clock_ms as u64);
        if let Some(event) = self.detector.process(VadSample::speech(timestamp, speech)) {
            return self
                .on_turn_event(event, client_events, upstream_commands)
                .await;
        }
        None
    }

    /// First fragment of a response moves the conversation to SPEAKING.
    async fn enter_speaking(
        &mut self,
        client_events: &mpsc::Sender<ClientEvent>,
    ) -> Option<BridgeExit> {
        if self.state == BridgeState::Speaking {
            return None;
        }
        self.state = BridgeState::Speaking;
        if client_events
            .send(ClientEvent::SessionUpdate {
                state: BridgeState::Speaking,
                detail: None,
            })
            .await
            .is_err()
        {
            return Some(BridgeExit::ClientDisconnected);
        }
        None
    }

    fn enqueue_upstream(&mut self, frame: Bytes, client_events: &mpsc::Sender<ClientEvent>) {
        self.upstream_audio.push_back(frame);
        if self.upstream_audio.len() > self.queue_capacity {
            self.upstream_audio.pop_front();
            self.report_drop(client_events);
        }
    }

    fn enqueue_client(&mut self, frame: Bytes, client_events: &mpsc::Sender<ClientEvent>) {
        self.client_audio.push_back(frame);
        if self.client_audio.len() > self.queue_capacity {
            self.client_audio.pop_front();
            self.report_drop(client_events);
        }
    }

    /// Report a backpressure drop without blocking on the (likely full)
    /// client channel. The count is cumulative, so a deferred report
    /// still covers every drop.
    fn report_drop(&mut self, client_events: &mpsc::Sender<ClientEvent>) {
        let total = self.stats.record_dropped();
        if client_events
            .try_send(ClientEvent::Degraded { dropped: total })
            .is_ok()
        {
            self.reported_drops = total;
        }
    }

    fn flush_pending_degraded(&mut self, client_events: &mpsc::Sender<ClientEvent>) {
        let total = self.stats.snapshot().dropped;
        if total > self.reported_drops
            && client_events
                .try_send(ClientEvent::Degraded { dropped: total })
                .is_ok()
        {
            self.reported_drops = total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::turn_detect::TurnDetectorConfig;
    use async_trait::async_trait;

    fn test_machine(config: BridgeConfig) -> RelayMachine {
        RelayMachine::new(Uuid::new_v4(), &config, Arc::new(AudioStats::default()))
    }

    fn channels() -> (
        mpsc::Sender<ClientEvent>,
        mpsc::Receiver<ClientEvent>,
        mpsc::Sender<UpstreamCommand>,
        mpsc::Receiver<UpstreamCommand>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(64);
        (event_tx, event_rx, command_tx, command_rx)
    }

    fn pcm_frame(samples: usize, amplitude: i16) -> Bytes {
        let mut data = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            data.extend_from_slice(&amplitude.to_le_bytes());
        }
        Bytes::from(data)
    }

    #[test]
    fn test_accept_frame_rejects_containers() {
        let mut machine = test_machine(BridgeConfig::default());
        assert!(machine.accept_frame(Bytes::from_static(b"OggS\x00\x02\x00\x00")).is_none());
        assert_eq!(machine.stats.snapshot().rejected, 1);
    }

    #[test]
    fn test_accept_frame_strips_wav_header() {
        let mut machine = test_machine(BridgeConfig::default());
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&[0u8; 4]);
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(&[0u8; 32]);
        wav.extend_from_slice(&pcm_frame(8, 1000));

        let frame = machine.accept_frame(Bytes::from(wav)).unwrap();
        assert_eq!(frame.len(), 16);
        assert_eq!(machine.stats.snapshot().rejected, 0);
    }

    #[test]
    fn test_accept_frame_resamples_to_upstream_rate() {
        let mut machine = test_machine(BridgeConfig {
            client_sample_rate: 12000,
            upstream_sample_rate: 24000,
            ..Default::default()
        });

        let frame = machine.accept_frame(pcm_frame(10, 500)).unwrap();
        assert_eq!(frame.len(), 40);
    }

    #[test]
    fn test_enqueue_drops_oldest_and_counts() {
        let mut machine = test_machine(BridgeConfig {
            audio_buffer_frames: 2,
            ..Default::default()
        });
        let (event_tx, mut event_rx, _command_tx, _command_rx) = channels();

        machine.enqueue_client(pcm_frame(2, 1), &event_tx);
        machine.enqueue_client(pcm_frame(2, 2), &event_tx);
        machine.enqueue_client(pcm_frame(2, 3), &event_tx);

        assert_eq!(machine.client_audio.len(), 2);
        // Oldest frame (amplitude 1) is gone.
        let front = machine.client_audio.front().unwrap();
        assert_eq!(i16::from_le_bytes([front[0], front[1]]), 2);
        assert_eq!(machine.stats.snapshot().dropped, 1);

        let degraded = event_rx.try_recv().unwrap();
        assert_eq!(degraded, ClientEvent::Degraded { dropped: 1 });
    }

    #[tokio::test]
    async fn test_barge_in_cancels_and_clears() {
        let mut machine = test_machine(BridgeConfig::default());
        let (event_tx, mut event_rx, command_tx, mut command_rx) = channels();

        machine.state = BridgeState::Speaking;
        machine.client_audio.push_back(pcm_frame(4, 9));

        let exit = machine
            .on_turn_event(
                TurnEvent::TurnStarted { timestamp_ms: 42 },
                &event_tx,
                &command_tx,
            )
            .await;

        assert_eq!(exit, None);
        assert_eq!(machine.state, BridgeState::Listening);
        assert!(machine.stale_response);
        assert!(machine.client_audio.is_empty());
        assert_eq!(command_rx.recv().await.unwrap(), UpstreamCommand::CancelResponse);

        let update = event_rx.recv().await.unwrap();
        assert_eq!(
            update,
            ClientEvent::SessionUpdate {
                state: BridgeState::Listening,
                detail: Some("interrupted".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_stale_fragments_suppressed_until_done() {
        let mut machine = test_machine(BridgeConfig::default());
        let (event_tx, mut event_rx, command_tx, _command_rx) = channels();

        machine.state = BridgeState::Listening;
        machine.stale_response = true;

        let audio = machine
            .on_upstream_event(
                UpstreamEvent::ResponseAudio {
                    audio: pcm_frame(4, 5),
                },
                &event_tx,
                &command_tx,
            )
            .await;
        assert_eq!(audio, None);
        assert!(machine.client_audio.is_empty());

        let done = machine
            .on_upstream_event(UpstreamEvent::ResponseDone, &event_tx, &command_tx)
            .await;
        assert_eq!(done, None);
        assert!(!machine.stale_response);
        assert!(event_rx.try_recv().is_err());

        // The next response flows again.
        machine.state = BridgeState::Processing;
        machine
            .on_upstream_event(
                UpstreamEvent::ResponseAudio {
                    audio: pcm_frame(4, 6),
                },
                &event_tx,
                &command_tx,
            )
            .await;
        assert_eq!(machine.client_audio.len(), 1);
        assert_eq!(
            event_rx.try_recv().unwrap(),
            ClientEvent::SessionUpdate {
                state: BridgeState::Speaking,
                detail: None,
            }
        );
    }

    #[tokio::test]
    async fn test_turn_end_commits_in_client_energy_mode() {
        let mut machine = test_machine(BridgeConfig {
            turn_mode: TurnMode::ClientEnergy,
            detector: TurnDetectorConfig::default(),
            ..Default::default()
        });
        let (event_tx, mut event_rx, command_tx, mut command_rx) = channels();

        machine.upstream_audio.push_back(pcm_frame(4, 7));

        let exit = machine
            .on_turn_event(
                TurnEvent::TurnEnded { timestamp_ms: 800 },
                &event_tx,
                &command_tx,
            )
            .await;

        assert_eq!(exit, None);
        assert_eq!(machine.state, BridgeState::Processing);
        // Buffered tail flushes ahead of the commit.
        assert!(matches!(
            command_rx.recv().await.unwrap(),
            UpstreamCommand::AppendAudio(_)
        ));
        assert_eq!(command_rx.recv().await.unwrap(), UpstreamCommand::CommitTurn);
        assert_eq!(command_rx.recv().await.unwrap(), UpstreamCommand::CreateResponse);
        assert_eq!(event_rx.recv().await.unwrap(), ClientEvent::Processing);
    }

    #[tokio::test]
    async fn test_turn_end_sends_no_commands_in_server_vad_mode() {
        let mut machine = test_machine(BridgeConfig::default());
        let (event_tx, mut event_rx, command_tx, mut command_rx) = channels();

        let exit = machine
            .on_upstream_event(UpstreamEvent::SpeechStarted { audio_start_ms: Some(10) }, &event_tx, &command_tx)
            .await;
        assert_eq!(exit, None);

        let exit = machine
            .on_upstream_event(UpstreamEvent::SpeechStopped, &event_tx, &command_tx)
            .await;
        assert_eq!(exit, None);
        assert_eq!(machine.state, BridgeState::Processing);
        assert_eq!(event_rx.recv().await.unwrap(), ClientEvent::Processing);
        assert!(command_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_upstream_error_is_fatal() {
        let mut machine = test_machine(BridgeConfig::default());
        let (event_tx, mut event_rx, command_tx, _command_rx) = channels();

        let exit = machine
            .on_upstream_event(
                UpstreamEvent::Error {
                    code: Some("session_expired".to_string()),
                    message: "session expired".to_string(),
                },
                &event_tx,
                &command_tx,
            )
            .await;

        assert_eq!(exit, Some(BridgeExit::UpstreamFailed));
        assert!(matches!(
            event_rx.recv().await.unwrap(),
            ClientEvent::Error { recoverable: false, .. }
        ));
    }

    /// Connector that always refuses, for exercising the recoverable
    /// initialization failure path.
    struct RefusingConnector;

    #[async_trait]
    impl UpstreamConnector for RefusingConnector {
        async fn open(&self, _setup: SessionSetup) -> Result<UpstreamChannel, UpstreamError> {
            Err(UpstreamError::Connect("no route".to_string()))
        }

        fn provider_info(&self) -> &'static str {
            "refusing"
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_recoverable() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        let bridge = VoiceSessionBridge::new(
            Uuid::new_v4(),
            BridgeConfig::default(),
            Arc::new(RefusingConnector),
            SessionSetup::default(),
            ClientChannel {
                frames: frame_rx,
                events: event_tx,
            },
            Arc::new(AudioStats::default()),
            None,
            shutdown_rx,
        );

        let exit = bridge.run().await;
        assert_eq!(exit, BridgeExit::ConnectFailed);

        let event = event_rx.recv().await.unwrap();
        assert!(matches!(
            event,
            ClientEvent::Error { recoverable: true, .. }
        ));
        drop(frame_tx);
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

use orato::core::bridge::TurnMode;
use orato::core::knowledge::{ExtractionOutcome, KnowledgeContext};
use orato::core::registry::{SessionId, SessionState};
use orato::core::upstream::{
    SessionSetup, UPSTREAM_CHANNEL_CAPACITY, UpstreamChannel, UpstreamCommand, UpstreamConnector,
    UpstreamError, UpstreamEvent,
};
use orato::{ServerConfig, routes, state::AppState};

type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const RESPONSE_AUDIO: &[u8] = &[0x42; 480];

/// In-memory upstream endpoint: acknowledges the session, records every
/// command, and answers a create-response command with a short scripted
/// reply.
struct ScriptedConnector {
    received: Arc<Mutex<Vec<UpstreamCommand>>>,
}

#[async_trait]
impl UpstreamConnector for ScriptedConnector {
    async fn open(&self, _setup: SessionSetup) -> Result<UpstreamChannel, UpstreamError> {
        let (command_tx, mut command_rx) =
            mpsc::channel::<UpstreamCommand>(UPSTREAM_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(UPSTREAM_CHANNEL_CAPACITY);
        let received = Arc::clone(&self.received);

        tokio::spawn(async move {
            let _ = event_tx.send(UpstreamEvent::SessionReady).await;
            while let Some(command) = command_rx.recv().await {
                received.lock().push(command.clone());
                match command {
                    UpstreamCommand::CreateResponse => {
                        let script = [
                            UpstreamEvent::InputTranscript {
                                transcript: "what are your hours".to_string(),
                            },
                            UpstreamEvent::ResponseAudio {
                                audio: Bytes::from_static(RESPONSE_AUDIO),
                            },
                            UpstreamEvent::ResponseTranscriptDelta {
                                delta: "We are open ".to_string(),
                            },
                            UpstreamEvent::ResponseTranscriptDelta {
                                delta: "nine to five.".to_string(),
                            },
                            UpstreamEvent::ResponseTranscriptDone {
                                transcript: "We are open nine to five.".to_string(),
                            },
                            UpstreamEvent::ResponseDone,
                        ];
                        for event in script {
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    UpstreamCommand::Close => break,
                    _ => {}
                }
            }
        });

        Ok(UpstreamChannel {
            commands: command_tx,
            events: event_rx,
        })
    }

    fn provider_info(&self) -> &'static str {
        "scripted"
    }
}

struct RefusingConnector;

#[async_trait]
impl UpstreamConnector for RefusingConnector {
    async fn open(&self, _setup: SessionSetup) -> Result<UpstreamChannel, UpstreamError> {
        Err(UpstreamError::Connect("endpoint unreachable".to_string()))
    }

    fn provider_info(&self) -> &'static str {
        "refusing"
    }
}

fn test_config(turn_mode: TurnMode) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        openai_api_key: None,
        realtime_url: "wss://api.openai.com/v1/realtime".to_string(),
        realtime_model: "gpt-4o-realtime-preview".to_string(),
        realtime_voice: "alloy".to_string(),
        knowledge_dir: PathBuf::from("knowledge"),
        max_sessions: 8,
        idle_timeout_secs: 1800,
        sweep_interval_secs: 60,
        context_ttl_secs: 3600,
        drain_timeout_secs: 5,
        sample_rate: 24000,
        client_sample_rate: 24000,
        audio_buffer_frames: 64,
        turn_mode,
        vad_threshold: 0.5,
        vad_start_dwell: 3,
        vad_end_silence: 25,
        connect_timeout_secs: 10,
    }
}

fn sample_outcome() -> ExtractionOutcome {
    ExtractionOutcome {
        documents: vec![KnowledgeContext::new("faq", "We are open nine to five.")],
        failed: vec![],
    }
}

async fn spawn_server(app_state: Arc<AppState>) -> SocketAddr {
    let app = routes::api::create_api_router()
        .merge(routes::ws::create_ws_router())
        .with_state(app_state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Next frame from the socket, or None once the connection is gone.
async fn next_message(read: &mut WsRead) -> Option<Message> {
    match timeout(Duration::from_secs(5), read.next()).await {
        Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => None,
        Ok(Some(Ok(msg))) => Some(msg),
        Err(_) => panic!("timed out waiting for a WebSocket message"),
    }
}

async fn next_json(read: &mut WsRead) -> Value {
    match next_message(read).await {
        Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a JSON message, got {other:?}"),
    }
}

async fn wait_for_state(app_state: &AppState, id: SessionId, state: SessionState) {
    for _ in 0..200 {
        if app_state
            .registry
            .status(id)
            .map(|s| s.state == state)
            .unwrap_or(false)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {id} never reached {state}");
}

#[tokio::test]
async fn test_voice_session_conversation_flow() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let connector = Arc::new(ScriptedConnector {
        received: Arc::clone(&received),
    });
    let app_state = AppState::with_connector(test_config(TurnMode::ClientEnergy), connector);
    let addr = spawn_server(Arc::clone(&app_state)).await;

    let session = app_state.registry.create_session(sample_outcome()).unwrap();
    let url = format!("ws://127.0.0.1:{}/ws/{}", addr.port(), session.id);
    let (ws_stream, _) = connect_async(url).await.expect("Failed to connect");
    let (mut write, mut read) = ws_stream.split();

    // Attach walks the session through ready into listening
    let ready = next_json(&mut read).await;
    assert_eq!(ready["type"], "session_update");
    assert_eq!(ready["state"], "ready");

    let listening = next_json(&mut read).await;
    assert_eq!(listening["type"], "session_update");
    assert_eq!(listening["state"], "listening");

    // One quiet audio frame, then an explicit end of turn
    write
        .send(Message::Binary(vec![0u8; 320].into()))
        .await
        .unwrap();
    write
        .send(Message::Text(r#"{"type":"commit_turn"}"#.into()))
        .await
        .unwrap();

    let processing = next_json(&mut read).await;
    assert_eq!(processing["type"], "processing");

    let transcription = next_json(&mut read).await;
    assert_eq!(transcription["type"], "transcription");
    assert_eq!(transcription["transcript"], "what are your hours");

    let speaking = next_json(&mut read).await;
    assert_eq!(speaking["type"], "session_update");
    assert_eq!(speaking["state"], "speaking");

    // The response body: transcript deltas plus one binary audio frame,
    // then the return to listening. Binary frames ride a drained queue,
    // so their position relative to the JSON events is not fixed.
    let mut messages = Vec::new();
    loop {
        let msg = next_message(&mut read).await.expect("socket closed early");
        if let Message::Text(ref text) = msg {
            let json: Value = serde_json::from_str(text).unwrap();
            if json["type"] == "session_update" && json["state"] == "listening" {
                break;
            }
        }
        messages.push(msg);
    }

    write
        .send(Message::Text(r#"{"type":"end"}"#.into()))
        .await
        .unwrap();
    while let Some(msg) = next_message(&mut read).await {
        messages.push(msg);
    }

    let binary_frames: Vec<&Message> = messages
        .iter()
        .filter(|m| matches!(m, Message::Binary(_)))
        .collect();
    assert_eq!(binary_frames.len(), 1);
    match binary_frames[0] {
        Message::Binary(data) => assert_eq!(data.as_ref(), RESPONSE_AUDIO),
        _ => unreachable!(),
    }

    let json_messages: Vec<Value> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Text(text) => Some(serde_json::from_str(text).unwrap()),
            _ => None,
        })
        .collect();
    let deltas: Vec<&str> = json_messages
        .iter()
        .filter(|j| j["type"] == "transcript_delta")
        .map(|j| j["delta"].as_str().unwrap())
        .collect();
    assert_eq!(deltas, vec!["We are open ", "nine to five."]);
    assert_eq!(json_messages.last().unwrap()["type"], "complete");

    // The upstream saw the committed turn and the final close
    for _ in 0..200 {
        if received.lock().len() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let commands = received.lock().clone();
    assert_eq!(commands.len(), 4);
    assert!(matches!(
        commands[0],
        UpstreamCommand::AppendAudio(ref audio) if audio.len() == 320
    ));
    assert_eq!(commands[1], UpstreamCommand::CommitTurn);
    assert_eq!(commands[2], UpstreamCommand::CreateResponse);
    assert_eq!(commands[3], UpstreamCommand::Close);

    // A completed session is released from the registry
    for _ in 0..200 {
        if app_state.registry.status(session.id).is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(app_state.registry.status(session.id).is_err());
}

#[tokio::test]
async fn test_ws_unknown_session_is_rejected() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let connector = Arc::new(ScriptedConnector { received });
    let app_state = AppState::with_connector(test_config(TurnMode::ServerVad), connector);
    let addr = spawn_server(app_state).await;

    let url = format!("ws://127.0.0.1:{}/ws/{}", addr.port(), Uuid::new_v4());
    let (ws_stream, _) = connect_async(url).await.expect("Failed to connect");
    let (_write, mut read) = ws_stream.split();

    let error = next_json(&mut read).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "session_not_found");
    assert_eq!(error["recoverable"], false);

    // Nothing but the close follows
    assert!(next_message(&mut read).await.is_none());
}

#[tokio::test]
async fn test_ws_upstream_connect_failure_reverts_session() {
    let app_state =
        AppState::with_connector(test_config(TurnMode::ServerVad), Arc::new(RefusingConnector));
    let addr = spawn_server(Arc::clone(&app_state)).await;

    let session = app_state.registry.create_session(sample_outcome()).unwrap();
    let url = format!("ws://127.0.0.1:{}/ws/{}", addr.port(), session.id);
    let (ws_stream, _) = connect_async(url).await.expect("Failed to connect");
    let (_write, mut read) = ws_stream.split();

    let error = next_json(&mut read).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "upstream_connect_failed");
    assert_eq!(error["recoverable"], true);

    assert!(next_message(&mut read).await.is_none());

    // The session survives the failed attempt and accepts a retry
    wait_for_state(&app_state, session.id, SessionState::Created).await;
}

#[tokio::test]
async fn test_ws_malformed_command_gets_recoverable_error() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let connector = Arc::new(ScriptedConnector { received });
    let app_state = AppState::with_connector(test_config(TurnMode::ServerVad), connector);
    let addr = spawn_server(Arc::clone(&app_state)).await;

    let session = app_state.registry.create_session(sample_outcome()).unwrap();
    let url = format!("ws://127.0.0.1:{}/ws/{}", addr.port(), session.id);
    let (ws_stream, _) = connect_async(url).await.expect("Failed to connect");
    let (mut write, mut read) = ws_stream.split();

    next_json(&mut read).await; // ready
    next_json(&mut read).await; // listening

    write
        .send(Message::Text("this is not json".into()))
        .await
        .unwrap();

    let error = next_json(&mut read).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "invalid_message");
    assert_eq!(error["recoverable"], true);

    // The connection is still usable afterwards
    write
        .send(Message::Text(r#"{"type":"end"}"#.into()))
        .await
        .unwrap();
    let complete = next_json(&mut read).await;
    assert_eq!(complete["type"], "complete");
}

#[tokio::test]
async fn test_ws_commit_turn_ignored_under_endpoint_vad() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let connector = Arc::new(ScriptedConnector {
        received: Arc::clone(&received),
    });
    let app_state = AppState::with_connector(test_config(TurnMode::ServerVad), connector);
    let addr = spawn_server(Arc::clone(&app_state)).await;

    let session = app_state.registry.create_session(sample_outcome()).unwrap();
    let url = format!("ws://127.0.0.1:{}/ws/{}", addr.port(), session.id);
    let (ws_stream, _) = connect_async(url).await.expect("Failed to connect");
    let (mut write, mut read) = ws_stream.split();

    next_json(&mut read).await; // ready
    next_json(&mut read).await; // listening

    // The endpoint owns turn boundaries, so an explicit commit is a no-op
    write
        .send(Message::Text(r#"{"type":"commit_turn"}"#.into()))
        .await
        .unwrap();
    write
        .send(Message::Text(r#"{"type":"end"}"#.into()))
        .await
        .unwrap();

    let complete = next_json(&mut read).await;
    assert_eq!(complete["type"], "complete");
    assert!(next_message(&mut read).await.is_none());

    for _ in 0..200 {
        if !received.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(received.lock().clone(), vec![UpstreamCommand::Close]);
}

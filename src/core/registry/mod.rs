//! Session registry
//!
//! Owns the map of live sessions: creation against the concurrency limit,
//! client attachment (which spawns the bridge task), status reads, and the
//! drain-then-close teardown path shared by explicit end requests and the
//! idle sweeper. The map is the only cross-session synchronization point.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::bridge::{BridgeConfig, BridgeExit, ClientChannel, TurnMode, VoiceSessionBridge};
use crate::core::context::ContextCacheBuilder;
use crate::core::knowledge::ExtractionOutcome;
use crate::core::upstream::{SessionSetup, UpstreamConnector};

mod session;

pub use session::{Session, SessionId, SessionState, SessionStatus};

/// Registry precondition failures, mapped to HTTP statuses at the edge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {0} already has a client attached")]
    Conflict(SessionId),

    #[error("session limit of {0} reached")]
    ResourceExhausted(usize),
}

/// Result of an end request. Ending a session that is already gone or
/// already closing is a successful no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    Closed,
    AlreadyClosed,
}

/// Registry tuning, derived from server configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long to wait for a bridge to drain on teardown before
    /// abandoning it.
    pub drain_timeout: Duration,
    pub context_ttl: Duration,
    /// Synthesis voice requested from the upstream endpoint.
    pub voice: String,
    pub bridge: BridgeConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            idle_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(5),
            context_ttl: Duration::from_secs(3600),
            voice: "alloy".to_string(),
            bridge: BridgeConfig::default(),
        }
    }
}

pub struct SessionRegistry {
    config: RegistryConfig,
    connector: Arc<dyn UpstreamConnector>,
    context_builder: ContextCacheBuilder,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, connector: Arc<dyn UpstreamConnector>) -> Arc<Self> {
        let context_builder = ContextCacheBuilder::new(config.context_ttl);
        Arc::new(Self {
            config,
            connector,
            context_builder,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Allocate a session in CREATED state.
    pub fn create_session(
        &self,
        knowledge: ExtractionOutcome,
    ) -> Result<Arc<Session>, RegistryError> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.config.max_sessions {
            return Err(RegistryError::ResourceExhausted(self.config.max_sessions));
        }

        let session = Arc::new(Session::new(knowledge));
        let id = session.id;
        sessions.insert(id, Arc::clone(&session));
        info!(
            session_id = %id,
            documents = session.knowledge.documents.len(),
            failed_documents = session.knowledge.failed.len(),
            "Session created"
        );
        Ok(session)
    }

    /// Attach a client connection: build or reuse the context prefix and
    /// spawn the bridge task. At most one live client per session.
    pub fn attach(
        self: &Arc<Self>,
        id: SessionId,
        client: ClientChannel,
    ) -> Result<Arc<Session>, RegistryError> {
        let session = self.lookup(id)?;

        {
            let mut state = session.state.lock();
            match *state {
                SessionState::Created => *state = SessionState::Active,
                SessionState::Active => return Err(RegistryError::Conflict(id)),
                SessionState::Closing | SessionState::Closed => {
                    return Err(RegistryError::NotFound(id));
                }
            }
        }
        session.touch();

        let prefix = {
            let mut slot = session.cached_prefix.lock();
            self.context_builder
                .get_or_build(&mut slot, &session.knowledge.documents)
        };
        info!(
            session_id = %id,
            tokens = prefix.token_count,
            knowledge_tokens = prefix.knowledge_tokens,
            cache_eligible = prefix.cache_eligible,
            content_hash = %prefix.hash_hex(),
            "Context prefix ready"
        );

        let setup = SessionSetup {
            instructions: prefix.content.clone(),
            cache_eligible: prefix.cache_eligible,
            voice: self.config.voice.clone(),
            server_vad: self.config.bridge.turn_mode == TurnMode::ServerVad,
            ..SessionSetup::default()
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let bridge = VoiceSessionBridge::new(
            id.as_uuid(),
            self.config.bridge.clone(),
            Arc::clone(&self.connector),
            setup,
            client,
            Arc::clone(&session.stats),
            extraction_warning(&session.knowledge),
            shutdown_rx,
        );

        *session.shutdown.lock() = Some(shutdown_tx);

        let registry = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let exit = bridge.run().await;
            if let Some(registry) = registry.upgrade() {
                registry.finalize(id, exit);
            }
            exit
        });
        *session.bridge_task.lock() = Some(handle);

        Ok(session)
    }

    /// Read-only status; never blocks on session work.
    pub fn status(&self, id: SessionId) -> Result<SessionStatus, RegistryError> {
        Ok(self.lookup(id)?.status_snapshot())
    }

    /// Signal the bridge to drain and close, then release the session.
    /// Idempotent and safe to race with itself, attach, and the sweeper.
    pub async fn end_session(&self, id: SessionId) -> EndOutcome {
        let Some(session) = self.sessions.read().get(&id).cloned() else {
            return EndOutcome::AlreadyClosed;
        };

        let was = {
            let mut state = session.state.lock();
            match *state {
                SessionState::Closing | SessionState::Closed => {
                    return EndOutcome::AlreadyClosed;
                }
                previous => {
                    *state = SessionState::Closing;
                    previous
                }
            }
        };

        if was == SessionState::Active {
            if let Some(tx) = session.shutdown.lock().as_ref() {
                let _ = tx.send(());
            }
            let handle = session.bridge_task.lock().take();
            if let Some(mut handle) = handle {
                match timeout(self.config.drain_timeout, &mut handle).await {
                    Ok(Ok(exit)) => debug!(session_id = %id, ?exit, "Bridge drained"),
                    Ok(Err(e)) => warn!(session_id = %id, "Bridge task failed: {}", e),
                    Err(_) => {
                        warn!(
                            session_id = %id,
                            drain_timeout = ?self.config.drain_timeout,
                            "Bridge did not drain in time, aborting"
                        );
                        handle.abort();
                    }
                }
            }
        }

        self.sessions.write().remove(&id);
        *session.state.lock() = SessionState::Closed;
        info!(session_id = %id, "Session ended");
        EndOutcome::Closed
    }

    /// Number of live session records, for the health endpoint.
    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    /// Periodic reclamation of idle sessions. Runs for the process
    /// lifetime; spawned once at startup.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        loop {
            ticker.tick().await;
            self.sweep_idle().await;
        }
    }

    /// One sweep pass: close every ACTIVE or never-attached CREATED
    /// session idle beyond the timeout, through the normal drain path.
    pub async fn sweep_idle(&self) {
        let idle_timeout = self.config.idle_timeout;
        let expired: Vec<SessionId> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, session)| {
                matches!(
                    session.state(),
                    SessionState::Created | SessionState::Active
                ) && session.idle() > idle_timeout
            })
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            warn!(session_id = %id, idle_timeout = ?idle_timeout, "Sweeping idle session");
            self.end_session(id).await;
        }
    }

    /// Called by the bridge task as it exits. A recoverable connect
    /// failure returns the session to CREATED for a retry; anything else
    /// releases it.
    fn finalize(&self, id: SessionId, exit: BridgeExit) {
        if exit == BridgeExit::ConnectFailed {
            if let Some(session) = self.sessions.read().get(&id).cloned() {
                let mut state = session.state.lock();
                if *state == SessionState::Active {
                    *state = SessionState::Created;
                    info!(session_id = %id, "Session reverted to created after connect failure");
                }
            }
            return;
        }

        if let Some(session) = self.sessions.write().remove(&id) {
            *session.state.lock() = SessionState::Closed;
            info!(session_id = %id, ?exit, "Session closed");
        }
    }

    fn lookup(&self, id: SessionId) -> Result<Arc<Session>, RegistryError> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }
}

/// One-line summary of failed documents for the client-facing warning.
fn extraction_warning(outcome: &ExtractionOutcome) -> Option<String> {
    if outcome.failed.is_empty() {
        return None;
    }
    let names: Vec<&str> = outcome
        .failed
        .iter()
        .map(|f| f.document_id.as_str())
        .collect();
    Some(format!(
        "{} knowledge document(s) unavailable: {}",
        names.len(),
        names.join(", ")
    ))
}

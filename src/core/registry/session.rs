//! One live session record

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::audio::{AudioStats, AudioStatsSnapshot};
use crate::core::bridge::BridgeExit;
use crate::core::context::CachedPrefix;
use crate::core::knowledge::ExtractionOutcome;

/// Opaque session identifier handed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Registry-level lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Allocated, no client attached yet.
    Created,
    /// A client is attached and the bridge task is running.
    Active,
    /// Teardown in progress.
    Closing,
    /// All resources released.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of one session for the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub state: SessionState,
    pub idle_ms: u64,
    pub created_at_ms: u64,
    pub stats: AudioStatsSnapshot,
}

/// One end-to-end voice interaction instance.
///
/// Mutable pieces are individually locked so status reads never contend
/// with bridge work; activity tracking is a lone atomic.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub(crate) state: Mutex<SessionState>,
    /// Monotonic base for activity accounting.
    epoch: Instant,
    created_unix_ms: u64,
    /// Milliseconds since `epoch` of the last frame in either direction.
    last_activity_ms: AtomicU64,
    pub(crate) stats: Arc<AudioStats>,
    pub(crate) cached_prefix: Mutex<Option<Arc<CachedPrefix>>>,
    /// Extraction outcome captured at creation; immutable afterwards.
    pub knowledge: ExtractionOutcome,
    pub(crate) shutdown: Mutex<Option<broadcast::Sender<()>>>,
    pub(crate) bridge_task: Mutex<Option<JoinHandle<BridgeExit>>>,
}

impl Session {
    pub(crate) fn new(knowledge: ExtractionOutcome) -> Self {
        let created_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            id: SessionId::new(),
            state: Mutex::new(SessionState::Created),
            epoch: Instant::now(),
            created_unix_ms,
            last_activity_ms: AtomicU64::new(0),
            stats: Arc::new(AudioStats::default()),
            cached_prefix: Mutex::new(None),
            knowledge,
            shutdown: Mutex::new(None),
            bridge_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Record activity now. `fetch_max` keeps the timestamp monotonic even
    /// under concurrent touches.
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last frame in either direction.
    pub fn idle(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub fn status_snapshot(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id,
            state: self.state(),
            idle_ms: self.idle().as_millis() as u64,
            created_at_ms: self.created_unix_ms,
            stats: self.stats.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_starts_created() {
        let session = Session::new(ExtractionOutcome::default());
        assert_eq!(session.state(), SessionState::Created);
        assert!(session.cached_prefix.lock().is_none());
    }

    #[test]
    fn test_touch_is_monotonic() {
        let session = Session::new(ExtractionOutcome::default());
        session.touch();
        let first = session.last_activity_ms.load(Ordering::Relaxed);
        // A stale concurrent touch can never move the timestamp backwards.
        session.last_activity_ms.fetch_max(first.saturating_sub(1), Ordering::Relaxed);
        assert!(session.last_activity_ms.load(Ordering::Relaxed) >= first);
    }

    #[test]
    fn test_session_id_display_is_uuid() {
        let id = SessionId::new();
        assert_eq!(id.to_string(), id.as_uuid().to_string());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SessionState::Active).unwrap(),
            "\"active\""
        );
        assert_eq!(SessionState::Closing.as_str(), "closing");
    }
}

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::knowledge::TextDirExtractor;
use crate::core::registry::SessionRegistry;
use crate::core::upstream::{RealtimeConnector, UpstreamConnector};

/// Application state that can be shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    /// Session registry that owns every live voice session
    pub registry: Arc<SessionRegistry>,
    /// Extractor used to scan the knowledge directory at session start
    pub extractor: TextDirExtractor,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let connector = Arc::new(RealtimeConnector::new(config.realtime_config()));
        Self::with_connector(config, connector)
    }

    /// Build state around a specific upstream connector. Tests use this to
    /// stand in an in-memory endpoint for the realtime one.
    pub fn with_connector(
        config: ServerConfig,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Arc<Self> {
        let registry = SessionRegistry::new(config.registry_config(), connector);

        Arc::new(Self {
            config,
            registry,
            extractor: TextDirExtractor,
        })
    }
}

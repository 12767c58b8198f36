pub mod audio;
pub mod bridge;
pub mod context;
pub mod knowledge;
pub mod registry;
pub mod turn_detect;
pub mod upstream;

// Re-export commonly used types for convenience
pub use bridge::{
    BridgeConfig, BridgeError, BridgeExit, BridgeState, ClientChannel, ClientCommand, ClientEvent,
    ClientFrame, TurnMode, VoiceSessionBridge,
};

pub use context::{CACHE_MIN_TOKENS, CachedPrefix, ContextCacheBuilder, DEFAULT_CONTEXT_TTL};

pub use knowledge::{
    ExtractionOutcome, FailedDocument, KnowledgeContext, KnowledgeError, KnowledgeExtractor,
    TextDirExtractor,
};

pub use registry::{
    EndOutcome, RegistryConfig, RegistryError, Session, SessionId, SessionRegistry, SessionState,
    SessionStatus,
};

pub use turn_detect::{TurnDetector, TurnDetectorConfig, TurnEvent, TurnState, VadSample};

pub use upstream::{
    RealtimeConfig, RealtimeConnector, SessionSetup, UpstreamChannel, UpstreamCommand,
    UpstreamConnector, UpstreamError, UpstreamEvent,
};

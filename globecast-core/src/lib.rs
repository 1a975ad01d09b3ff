pub mod config;
pub mod directory;
pub mod error;
pub mod ingest;
pub mod playback;
pub mod proxy;

pub use config::{
    load_globecast_config, AbrSection, DirectorySection, GlobecastConfig, IngestSection,
    PlaybackSection, PreferencesSection, ProxySection, RoutingSection, DEFAULT_USER_AGENT,
};
pub use directory::{
    resolve_channel, Channel, ChannelDirectory, DirectoryError, DirectoryResult,
    StaticChannelDirectory, StreamRoute, StreamSource,
};
pub use error::{ConfigError, Result};
pub use ingest::{
    HlsIngestionFactory, IngestError, IngestEvent, IngestEventSender, Ingestion, IngestionFactory,
    QualityLadder, QualityTier, SessionEvent, SessionId, TierIndex, TierSelection,
};
pub use playback::{
    MemoryPreferenceStore, PlaybackController, PlaybackHandle, PlaybackOptions, PlaybackState,
    PlayerSnapshot, PreferenceError, PreferenceStore, Preferences, SqlitePreferenceStore,
};
pub use proxy::{router, ProxyError, ProxyServer, ProxyState, StreamRequest};

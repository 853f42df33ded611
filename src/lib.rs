//! Duplex audio streaming engine for realtime voice chat
//!
//! Captures microphone audio, streams it to a conversational speech service
//! over a WebSocket, and plays synthesized replies back gaplessly while
//! keeping an ordered transcript. Everything is driven through a single
//! event loop; see [`session`] for the architecture.

pub mod audio;
pub mod metrics;
pub mod playback;
pub mod session;
pub mod settings;

pub use metrics::{ErrorRecord, MetricsCollector, MetricsSummary, SessionMetrics};
pub use session::{
    spawn, spawn_with_devices, Connector, EngineConfig, EngineSnapshot, Event, ServerEvent,
    ServiceCredentials, SessionHandle, SessionState, Speaker, StubConnector, TranscriptSegment,
    TransportError, TransportSession, WsConnector,
};
pub use settings::{load_settings, save_settings, EngineSettings, VoiceId, DEFAULT_PERSONA};

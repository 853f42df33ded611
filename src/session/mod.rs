//! Duplex streaming session
//!
//! Connects the capture pipeline to a conversational speech service over a
//! WebSocket, fans server events out to playback and transcript state, and
//! exposes a handle for driving the engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ frames ┌──────────────┐ audio.append ┌──────────────┐
//! │ MicInput │ ──────▶ │ capture pump │ ────────────▶ │ Transport    │
//! └──────────┘         └──────────────┘               │ Session (WS) │
//!                                                     └──────┬───────┘
//!                                        ServerEvent stream  │
//!                                                            ▼
//!                                              ┌────────────────────┐
//!                                              │ SessionController  │
//!                                              │ (single event loop)│
//!                                              └─────┬────────┬─────┘
//!                                                    ▼        ▼
//!                                      PlaybackScheduler   TranscriptAggregator
//! ```
//!
//! # Module Structure
//!
//! - [`protocol`]: wire messages and the PCM16/base64 codec
//! - [`transport`]: WebSocket session with buffered sends and ordered events
//! - [`transcript`]: turn-by-turn transcript aggregation
//! - [`controller`]: the event loop that owns every piece of session state

pub mod controller;
pub mod protocol;
pub mod transcript;
pub mod transport;

pub use controller::{
    spawn, spawn_with_devices, EngineConfig, EngineSnapshot, Event, SessionHandle, SessionState,
};
pub use protocol::{
    decode_audio, encode_frame, ClientMessage, DecodeError, EncodedAudioBlock, ServerMessage,
    SessionConfig, Speaker,
};
pub use transcript::{TranscriptAggregator, TranscriptSegment};
pub use transport::{
    Connector, ServerEvent, ServiceCredentials, StubConnector, TransportSession, WsConnector,
};

/// Errors that can occur on the transport session
#[derive(Debug, Clone)]
pub enum TransportError {
    /// API key not found in the environment or .env file
    MissingCredentials,
    /// WebSocket connection could not be established
    ConnectionFailed(String),
    /// WebSocket-level failure after the connection opened
    WebSocketError(String),
    /// Unexpected or malformed message from the service
    ProtocolError(String),
    /// Send on a session that has already closed
    SendFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::MissingCredentials => {
                write!(f, "Missing service credentials (set VOICELOOP_API_KEY)")
            }
            TransportError::ConnectionFailed(e) => write!(f, "Connection failed: {}", e),
            TransportError::WebSocketError(e) => write!(f, "WebSocket error: {}", e),
            TransportError::ProtocolError(e) => write!(f, "Protocol error: {}", e),
            TransportError::SendFailed(e) => write!(f, "Send failed: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

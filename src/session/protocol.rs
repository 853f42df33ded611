//! Wire protocol for the duplex speech service
//!
//! Serde types for the JSON messages exchanged over the session WebSocket,
//! plus the PCM16/base64 codec both directions of the stream share.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::audio::CAPTURE_SAMPLE_RATE;
use crate::settings::EngineSettings;

// ============================================================================
// Client -> server messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Configure the session. Must be the first message on a fresh connection.
    #[serde(rename = "session.configure")]
    SessionConfigure { session: SessionConfig },
    /// One capture frame of base64-encoded PCM16 audio
    #[serde(rename = "audio.append")]
    AudioAppend { audio: String, mime_type: String },
}

impl ClientMessage {
    pub fn session_configure(config: SessionConfig) -> Self {
        ClientMessage::SessionConfigure { session: config }
    }

    /// Encode a capture frame into an `audio.append` message.
    pub fn audio_append(samples: &[f32]) -> Self {
        let block = encode_frame(samples);
        ClientMessage::AudioAppend {
            audio: block.data,
            mime_type: block.mime_type,
        }
    }
}

/// Session configuration sent in `session.configure`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    /// Requested response modalities. Always `["audio"]`: text arrives as
    /// transcription deltas, not as a modality of its own.
    pub response_modalities: Vec<String>,
    /// Voice the service should synthesize with
    pub voice: String,
    /// System instruction (persona) for the conversation
    pub system_instruction: String,
    pub enable_input_transcription: bool,
    pub enable_output_transcription: bool,
}

impl SessionConfig {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        SessionConfig {
            response_modalities: vec!["audio".to_string()],
            voice: settings.voice.as_str().to_string(),
            system_instruction: settings.persona.clone(),
            enable_input_transcription: true,
            enable_output_transcription: true,
        }
    }
}

// ============================================================================
// Server -> client messages
// ============================================================================

/// Messages received from server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// One chunk of base64-encoded PCM16 synthesized audio
    #[serde(rename = "audio.delta")]
    AudioDelta { audio: String },
    /// Partial transcription text for one speaker
    #[serde(rename = "transcript.delta")]
    TranscriptDelta { text: String, speaker: Speaker },
    /// The agent finished its turn
    #[serde(rename = "turn.complete")]
    TurnComplete,
    /// The user barged in; pending synthesis was dropped server-side
    #[serde(rename = "interrupted")]
    Interrupted,
    #[serde(rename = "error")]
    Error { message: String },
    /// Any message type this client does not handle
    #[serde(other)]
    Unknown,
}

/// Which side of the conversation a transcript delta belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

// ============================================================================
// PCM16 codec
// ============================================================================

/// A frame of PCM16 audio, base64-encoded for the wire
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAudioBlock {
    pub data: String,
    pub mime_type: String,
}

/// Errors from decoding a synthesized audio chunk
#[derive(Debug, Clone)]
pub enum DecodeError {
    InvalidBase64(String),
    /// Payload byte count is not a whole number of 16-bit samples
    TruncatedSample,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidBase64(e) => write!(f, "Invalid base64 payload: {}", e),
            DecodeError::TruncatedSample => write!(f, "Payload ends mid-sample"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode float samples as base64 PCM16, little-endian.
///
/// Samples are clamped to [-1.0, 1.0] before quantization.
pub fn encode_frame(samples: &[f32]) -> EncodedAudioBlock {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let value = (clamped * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    EncodedAudioBlock {
        data: general_purpose::STANDARD.encode(&bytes),
        mime_type: format!("audio/pcm;rate={}", CAPTURE_SAMPLE_RATE),
    }
}

/// Decode a base64 PCM16 payload back into float samples in [-1.0, 1.0).
pub fn decode_audio(data: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = general_purpose::STANDARD
        .decode(data)
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::TruncatedSample);
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();
    Ok(samples)
}

// ============================================================================
// Tests
// ============================================================================

//! Voice server wire protocol
//!
//! All payloads are JSON text frames on the streaming WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `ws://<host>/ws/audio`
//! 2. Receive `session_id` assigning the session identity
//! 3. Stream microphone blocks as `{ "audio": [f32, ...] }`
//! 4. Receive synthesized speech as `audio_chunk` (base64 LE PCM16)
//! 5. Receive `session_end` when the server terminates the session

use serde::{Deserialize, Serialize};

/// Default streaming endpoint of the voice server
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8000/ws/audio";

/// Default base URL for out-of-band session control
pub const DEFAULT_CONTROL_URL: &str = "http://localhost:8000";

/// Sample rate used on both directions of the wire
pub const WIRE_SAMPLE_RATE: u32 = 16_000;

// ============================================================================
// Client Messages (sent TO the voice server)
// ============================================================================

/// Messages sent from the client to the voice server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientMessage {
    /// One capture block of raw floating-point samples
    Audio { audio: Vec<f32> },
}

impl ClientMessage {
    /// Number of samples carried by this message
    pub fn sample_count(&self) -> usize {
        match self {
            ClientMessage::Audio { audio } => audio.len(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Server Messages (received FROM the voice server)
// ============================================================================

/// Messages received from the voice server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Assigns the session identity for this connection
    SessionId { session_id: String },

    /// The server terminated the session
    SessionEnd,

    /// Synthesized audio
    AudioChunk {
        /// Base64-encoded little-endian PCM16 mono at 16kHz
        audio: String,
    },

    /// Catch-all for message types we don't handle
    #[serde(other)]
    Unrecognized,
}

impl ServerMessage {
    /// Parse a text frame.
    ///
    /// Malformed JSON and known types with missing fields map to
    /// `Unrecognized` so a bad payload never becomes audio or a state change.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Protocol: failed to parse server message: {}", e);
                ServerMessage::Unrecognized
            }
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SessionId { .. } => "session_id",
            ServerMessage::SessionEnd => "session_end",
            ServerMessage::AudioChunk { .. } => "audio_chunk",
            ServerMessage::Unrecognized => "unrecognized",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_audio_serialization() {
        let msg = ClientMessage::Audio {
            audio: vec![0.5, -0.25, 0.0],
        };
        let json = msg.to_json().unwrap();

        assert_eq!(json, r#"{"audio":[0.5,-0.25,0.0]}"#);
        assert_eq!(msg.sample_count(), 3);
    }

    #[test]
    fn test_server_session_id_deserialization() {
        let msg = ServerMessage::parse(r#"{"type":"session_id","session_id":"abc123"}"#);

        assert_eq!(
            msg,
            ServerMessage::SessionId {
                session_id: "abc123".to_string()
            }
        );
    }

    #[test]
    fn test_server_session_end_deserialization() {
        let msg = ServerMessage::parse(r#"{"type":"session_end"}"#);
        assert_eq!(msg, ServerMessage::SessionEnd);
    }

    #[test]
    fn test_server_audio_chunk_deserialization() {
        let msg = ServerMessage::parse(r#"{"type":"audio_chunk","audio":"AAAAAAAAAAA="}"#);

        match msg {
            ServerMessage::AudioChunk { audio } => assert_eq!(audio, "AAAAAAAAAAA="),
            other => panic!("Expected AudioChunk, got {:?}", other),
        }
    }

    #[test]
    fn test_server_unknown_type() {
        let msg = ServerMessage::parse(r#"{"type":"transcript","text":"hello"}"#);
        assert_eq!(msg, ServerMessage::Unrecognized);
    }

    #[test]
    fn test_malformed_payloads_are_unrecognized() {
        assert_eq!(ServerMessage::parse("not json"), ServerMessage::Unrecognized);
        assert_eq!(ServerMessage::parse("{}"), ServerMessage::Unrecognized);
        // Known type, required field missing
        assert_eq!(
            ServerMessage::parse(r#"{"type":"audio_chunk"}"#),
            ServerMessage::Unrecognized
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"session_id"}"#),
            ServerMessage::Unrecognized
        );
    }
}

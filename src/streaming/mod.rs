//! Streaming transport to the voice server
//!
//! This module owns the persistent WebSocket used in both directions:
//! microphone blocks go out as float arrays, synthesized speech comes back as
//! base64 PCM16 chunks alongside session control messages.
//!
//! # Architecture
//!
//! ```text
//! CaptureStream ──▶ codec::encode ──▶ AudioSender ──▶ writer task ──▶ WebSocket
//!                                                                        │
//! PlaybackScheduler ◀── TransportEvent::Audio ◀── codec::decode ◀── reader task
//! SessionLifecycle  ◀── TransportEvent::Session* / Closed ◀──────────────┘
//! ```
//!
//! # Failure Strategy
//!
//! - Initial connection retries with exponential backoff
//! - Mid-session disconnects close the transport; the user reconnects explicitly
//! - Outbound audio is dropped (never queued for retry) while the link is down

pub mod codec;
mod protocol;
mod transport;

pub use codec::{CodecError, SampleFrame};
pub use protocol::{
    ClientMessage, ServerMessage, DEFAULT_CONTROL_URL, DEFAULT_SERVER_URL, WIRE_SAMPLE_RATE,
};
pub use transport::{
    dispatch, AudioSender, ConnectOptions, ConnectionId, LinkState, SendOutcome, TransportEvent,
    TransportSession,
};

/// Errors that can occur on the streaming transport
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Server URL could not be turned into a WebSocket request
    InvalidUrl(String),
    /// Failed to establish WebSocket connection
    ConnectionFailed(String),
    /// WebSocket protocol error
    ProtocolError(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to send a frame
    SendFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::InvalidUrl(e) => write!(f, "Invalid server URL: {}", e),
            TransportError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to voice server: {}", e)
            }
            TransportError::ProtocolError(e) => write!(f, "WebSocket protocol error: {}", e),
            TransportError::Disconnected(e) => write!(f, "WebSocket disconnected: {}", e),
            TransportError::SendFailed(e) => write!(f, "Failed to send frame: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

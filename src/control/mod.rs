//! Out-of-band session control
//!
//! The voice server exposes a plain HTTP endpoint to terminate a session
//! independently of the streaming channel.

mod client;

pub use client::ControlClient;

/// Errors from a control request. Reported to the user, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequestError {
    /// Request could not be sent or no response arrived
    Network(String),
    /// Server answered with a non-success status
    Api { status: u16, message: String },
    /// Response body was not what the endpoint returns
    Parse(String),
}

impl std::fmt::Display for ControlRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlRequestError::Network(e) => write!(f, "Network error: {}", e),
            ControlRequestError::Api { status, message } => {
                write!(f, "Server error ({}): {}", status, message)
            }
            ControlRequestError::Parse(e) => write!(f, "Failed to parse response: {}", e),
        }
    }
}

impl std::error::Error for ControlRequestError {}

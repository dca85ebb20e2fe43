//! Conversion between device samples and wire payloads
//!
//! Outbound blocks travel as raw floats (no quantization on send). Inbound
//! audio is base64 of little-endian PCM16, normalized by 32768 on decode.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

use super::protocol::ClientMessage;

/// Floating-point samples in [-1.0, 1.0], 16kHz mono
pub type SampleFrame = Vec<f32>;

/// Shortest base64 payload worth decoding (anything shorter is truncated junk)
pub const MIN_PAYLOAD_CHARS: usize = 10;

/// Standard alphabet, padding optional and loose trailing bits accepted, as
/// browsers' `atob` does
const INBOUND: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Divisor used to normalize PCM16 into floating range
const PCM16_SCALE: f32 = 32768.0;

/// Errors that can occur while decoding inbound audio
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Payload too short to hold audio
    TooShort { len: usize },
    /// Payload is not valid base64
    InvalidBase64(String),
    /// Odd byte count; the trailing byte was dropped and the rest recovered
    Misaligned { bytes: usize, recovered: SampleFrame },
}

impl CodecError {
    /// Whether the frame must be discarded
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CodecError::Misaligned { .. })
    }

    /// Usable samples salvaged from a recoverable error
    pub fn into_recovered(self) -> Option<SampleFrame> {
        match self {
            CodecError::Misaligned { recovered, .. } => Some(recovered),
            _ => None,
        }
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::TooShort { len } => write!(f, "Audio payload too short ({} chars)", len),
            CodecError::InvalidBase64(e) => write!(f, "Audio payload is not valid base64: {}", e),
            CodecError::Misaligned { bytes, .. } => {
                write!(f, "Audio payload has odd length ({} bytes), last byte dropped", bytes)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Wrap one capture block into the outbound envelope
pub fn encode(samples: &[f32]) -> ClientMessage {
    ClientMessage::Audio {
        audio: samples.to_vec(),
    }
}

/// Decode a base64 PCM16 payload into normalized samples
pub fn decode(payload: &str) -> Result<SampleFrame, CodecError> {
    if payload.len() < MIN_PAYLOAD_CHARS {
        return Err(CodecError::TooShort { len: payload.len() });
    }

    let bytes = INBOUND
        .decode(payload)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;

    if bytes.len() < 2 {
        return Err(CodecError::TooShort { len: payload.len() });
    }

    let samples: SampleFrame = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect();

    if bytes.len() % 2 != 0 {
        return Err(CodecError::Misaligned {
            bytes: bytes.len(),
            recovered: samples,
        });
    }

    Ok(samples)
}

/// Decode with the inbound boundary policy applied.
///
/// Fatal errors are logged and the chunk dropped; a misaligned chunk is
/// logged and its recovered samples returned.
pub fn decode_for_playback(payload: &str) -> Option<SampleFrame> {
    match decode(payload) {
        Ok(samples) => Some(samples),
        Err(e) if e.is_fatal() => {
            log::debug!("Codec: dropping inbound chunk: {}", e);
            None
        }
        Err(e) => {
            log::warn!("Codec: {}", e);
            e.into_recovered()
        }
    }
}

/// Quantize floats to PCM16 the way the voice server does before forwarding
pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

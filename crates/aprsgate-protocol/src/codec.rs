//! JSON codec for client frames.
//!
//! Client frames travel as WebSocket text messages, one JSON object each.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a frame as JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is too large.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns an error if the input is too large or not a valid frame.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{ClientRequest, ServerEvent};

    #[test]
    fn test_decode_login() {
        let req: ClientRequest =
            decode(r#"{"type":"login","callsign":"K8SDR","passcode":"14750"}"#).unwrap();
        assert_eq!(
            req,
            ClientRequest::Login {
                callsign: "K8SDR".into(),
                passcode: "14750".into()
            }
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        let result: Result<ClientRequest, _> = decode(r#"{"type":"subscribe"}"#);
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let text = format!(r#"{{"type":"ping","pad":"{}"}}"#, "x".repeat(MAX_FRAME_SIZE));
        let result: Result<ClientRequest, _> = decode(&text);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge(_))));

        let event = ServerEvent::error(1, "y".repeat(MAX_FRAME_SIZE));
        assert!(matches!(encode(&event), Err(ProtocolError::FrameTooLarge(_))));
    }

    #[test]
    fn test_encode_pong() {
        let text = encode(&ServerEvent::Pong { timestamp: Some(7) }).unwrap();
        assert_eq!(text, r#"{"type":"pong","timestamp":7}"#);
    }
}

//! Outbound APRS-IS line formatting.
//!
//! Outbound messages have the shape
//! `FROM>DEST,HOP1,HOP2::ADDRESSEE:payload`, with the addressee padded to
//! nine characters. Lines sent upstream are CRLF-terminated.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::callsign::{normalize, pad_addressee};

/// Maximum message text length, excluding any id suffix.
pub const MAX_TEXT_LENGTH: usize = 67;

/// Destination (tocall) used for generated messages.
pub const DEFAULT_DESTINATION: &str = "APRS";

/// Line terminator for upstream writes.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Cut message text to [`MAX_TEXT_LENGTH`] characters.
#[must_use]
pub fn truncate_text(text: &str) -> &str {
    match text.char_indices().nth(MAX_TEXT_LENGTH) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The part of a message after the addressee field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `text{id}`.
    Numbered { text: String, id: String },
    /// `text{id}ack`, acknowledging the addressee's message `ack`.
    ReplyAck {
        text: String,
        id: String,
        ack_id: String,
    },
    /// `ack<id>`.
    Ack(String),
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Numbered { text, id } => write!(f, "{}{{{id}}}", truncate_text(text)),
            Payload::ReplyAck { text, id, ack_id } => {
                write!(f, "{}{{{id}}}{ack_id}", truncate_text(text))
            }
            Payload::Ack(id) => write!(f, "ack{id}"),
        }
    }
}

/// A message to be written upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Station the message is sent on behalf of.
    pub from: String,
    /// Destination (tocall) field.
    pub destination: String,
    /// Path hops, normally ending in the gateway.
    pub path: Vec<String>,
    /// Receiving station.
    pub addressee: String,
    /// Message payload.
    pub payload: Payload,
}

impl OutboundMessage {
    /// Create a message with the default destination and an empty path.
    #[must_use]
    pub fn new(from: impl Into<String>, addressee: impl Into<String>, payload: Payload) -> Self {
        Self {
            from: from.into(),
            destination: DEFAULT_DESTINATION.to_string(),
            path: Vec::new(),
            addressee: addressee.into(),
            payload,
        }
    }

    /// Set the path hops.
    #[must_use]
    pub fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }

    /// Format as a line without terminator.
    #[must_use]
    pub fn to_line(&self) -> String {
        self.to_string()
    }

    /// Format as CRLF-terminated bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        encode_line(&self.to_line())
    }
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{}", normalize(&self.from), self.destination)?;
        for hop in &self.path {
            write!(f, ",{hop}")?;
        }
        write!(f, "::{}:{}", pad_addressee(&self.addressee), self.payload)
    }
}

/// Terminate a raw line with CRLF, replacing any existing line ending.
#[must_use]
pub fn encode_line(line: &str) -> Bytes {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut buf = BytesMut::with_capacity(line.len() + LINE_TERMINATOR.len());
    buf.put_slice(line.as_bytes());
    buf.put_slice(LINE_TERMINATOR);
    buf.freeze()
}

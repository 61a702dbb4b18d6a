//! Link abstraction traits.
//!
//! [`Uplink`] is the outbound side other components send through;
//! [`PacketSink`] receives the packets the link reads.

use aprsgate_protocol::{OutboundMessage, Packet};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Link errors.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No upstream connection is currently established.
    #[error("APRS-IS link is not active")]
    Inactive,

    /// Dialing the upstream server took too long.
    #[error("Connection to {0} timed out")]
    Timeout(String),

    /// A write to the upstream server took too long.
    #[error("Write to {0} timed out")]
    WriteTimeout(String),

    /// The connection was dropped after a failed write.
    #[error("Connection reset after a failed write")]
    Reset,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of the upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Authenticating,
    Streaming,
}

impl LinkState {
    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Authenticating => "authenticating",
            LinkState::Streaming => "streaming",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that can write lines to the upstream network.
///
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait Uplink: Send + Sync {
    /// Write one raw line. The line terminator is added by the implementation.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Inactive`] when no connection is established.
    async fn send_raw(&self, line: &str) -> Result<(), LinkError>;

    /// Format and write an outbound message.
    async fn send_message(&self, message: &OutboundMessage) -> Result<(), LinkError> {
        self.send_raw(&message.to_line()).await
    }

    /// Check if a connection is currently established.
    fn is_active(&self) -> bool;
}

/// Receives packets read from the upstream link.
///
/// Called from the link's read loop, so implementations must return quickly
/// and hand real work off to their own tasks.
pub trait PacketSink: Send + Sync {
    /// Handle one parsed packet.
    fn on_packet(&self, packet: Packet);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state_display() {
        assert_eq!(LinkState::Streaming.to_string(), "streaming");
        assert_eq!(LinkState::Disconnected.as_str(), "disconnected");
    }

    #[test]
    fn test_inactive_error_message() {
        assert_eq!(LinkError::Inactive.to_string(), "APRS-IS link is not active");
    }
}

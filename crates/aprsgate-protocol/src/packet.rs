//! Typed APRS-IS packets.
//!
//! A [`Packet`] is one successfully parsed upstream line. Exactly one
//! [`PacketBody`] variant is set; lines that match no grammar never become a
//! packet and are reported as [`ParseError::Unrecognized`] instead.

use thiserror::Error;

/// Addressee prefix reserved for bulletins and announcements.
pub const BULLETIN_PREFIX: &str = "BLN";

/// Parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The line matches none of the known message grammars.
    #[error("not a recognized APRS message packet")]
    Unrecognized,
}

/// Packet kinds, mostly useful for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Message,
    Bulletin,
    GroupBulletin,
    Announcement,
    Telemetry,
    Response,
}

impl PacketKind {
    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Message => "message",
            PacketKind::Bulletin => "bulletin",
            PacketKind::GroupBulletin => "group-bulletin",
            PacketKind::Announcement => "announcement",
            PacketKind::Telemetry => "telemetry",
            PacketKind::Response => "response",
        }
    }
}

/// Whether a bare response acknowledges or rejects a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Ack,
    Rej,
}

impl ResponseKind {
    /// Wire prefix (`ack` or `rej`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::Ack => "ack",
            ResponseKind::Rej => "rej",
        }
    }
}

/// Telemetry configuration tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryTag {
    Parm,
    Unit,
    Eqns,
    Bits,
}

impl TelemetryTag {
    /// All tags, in matching order.
    pub const ALL: [TelemetryTag; 4] = [
        TelemetryTag::Parm,
        TelemetryTag::Unit,
        TelemetryTag::Eqns,
        TelemetryTag::Bits,
    ];

    /// The body prefix including the trailing dot, e.g. `PARM.`.
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            TelemetryTag::Parm => "PARM.",
            TelemetryTag::Unit => "UNIT.",
            TelemetryTag::Eqns => "EQNS.",
            TelemetryTag::Bits => "BITS.",
        }
    }
}

/// A person-to-person message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody {
    /// Addressee, right-trimmed of padding.
    pub addressee: String,
    /// Message text with any id suffix removed.
    pub text: String,
    /// Message id (1-5 alphanumerics; 2 characters is the reply-ack format).
    pub id: Option<String>,
    /// Piggybacked acknowledgment of one of the addressee's own messages.
    pub ack_id: Option<String>,
}

/// A bare `ack`/`rej` for a previously sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    /// Addressee, right-trimmed of padding.
    pub addressee: String,
    /// Acknowledge or reject.
    pub kind: ResponseKind,
    /// Id of the message being answered.
    pub id: String,
    /// Trailing reply-ack id, new format only.
    pub ack_id: Option<String>,
}

/// The decoded information field of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Message(MessageBody),
    Response(ResponseBody),
    /// General bulletin (`BLN0`..`BLN9`, empty group).
    Bulletin {
        slot: char,
        text: String,
    },
    /// Bulletin addressed to a named group.
    GroupBulletin {
        slot: char,
        group: String,
        text: String,
    },
    /// Announcement (`BLNA`..`BLNZ`).
    Announcement {
        slot: char,
        group: String,
        text: String,
    },
    /// Telemetry channel definition sent to a station.
    Telemetry {
        addressee: String,
        tag: TelemetryTag,
        payload: String,
    },
}

/// A parsed upstream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Originating station.
    pub source: String,
    /// Destination (tocall) field of the header.
    pub destination: String,
    /// Digipeater hops, in the order they appear on the wire.
    pub path: Vec<String>,
    /// Decoded information field.
    pub body: PacketBody,
    /// The original line, kept for diagnostics.
    pub raw: String,
}

impl Packet {
    /// Get the packet kind.
    #[must_use]
    pub fn kind(&self) -> PacketKind {
        match &self.body {
            PacketBody::Message(_) => PacketKind::Message,
            PacketBody::Response(_) => PacketKind::Response,
            PacketBody::Bulletin { .. } => PacketKind::Bulletin,
            PacketBody::GroupBulletin { .. } => PacketKind::GroupBulletin,
            PacketBody::Announcement { .. } => PacketKind::Announcement,
            PacketBody::Telemetry { .. } => PacketKind::Telemetry,
        }
    }

    /// Addressee of station-directed packets.
    #[must_use]
    pub fn addressee(&self) -> Option<&str> {
        match &self.body {
            PacketBody::Message(m) => Some(&m.addressee),
            PacketBody::Response(r) => Some(&r.addressee),
            PacketBody::Telemetry { addressee, .. } => Some(addressee),
            _ => None,
        }
    }

    /// True for deliverable person-to-person messages.
    ///
    /// Messages addressed to a `BLN` slot are bulletins in disguise and are
    /// not deliverable.
    #[must_use]
    pub fn is_user_message(&self) -> bool {
        match &self.body {
            PacketBody::Message(m) => {
                !m.addressee.is_empty() && !m.addressee.starts_with(BULLETIN_PREFIX)
            }
            _ => false,
        }
    }

    /// The message body, if this is a message.
    #[must_use]
    pub fn as_message(&self) -> Option<&MessageBody> {
        match &self.body {
            PacketBody::Message(m) => Some(m),
            _ => None,
        }
    }

    /// The response body, if this is a bare ack/rej.
    #[must_use]
    pub fn as_response(&self) -> Option<&ResponseBody> {
        match &self.body {
            PacketBody::Response(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(addressee: &str) -> Packet {
        Packet {
            source: "W1ABC".into(),
            destination: "APRS".into(),
            path: vec![],
            body: PacketBody::Message(MessageBody {
                addressee: addressee.into(),
                text: "hi".into(),
                id: None,
                ack_id: None,
            }),
            raw: String::new(),
        }
    }

    #[test]
    fn test_user_message_classification() {
        assert!(message("K8SDR").is_user_message());
        assert!(!message("BLN1").is_user_message());
        assert!(!message("").is_user_message());
    }

    #[test]
    fn test_packet_kind() {
        let packet = message("K8SDR");
        assert_eq!(packet.kind(), PacketKind::Message);
        assert_eq!(packet.kind().as_str(), "message");
        assert_eq!(packet.addressee(), Some("K8SDR"));
    }
}

//! # aprsgate-protocol
//!
//! Wire formats for the aprsgate APRS-IS messaging gateway.
//!
//! This crate has no I/O. It covers both sides of the gateway:
//!
//! - **Upstream** - parsing APRS-IS lines into typed [`Packet`]s and
//!   formatting [`OutboundMessage`]s
//! - **Callsigns** - base callsign reduction, validation, passcodes
//! - **Clients** - JSON [`ClientRequest`] / [`ServerEvent`] frames
//!
//! ## Example
//!
//! ```rust
//! use aprsgate_protocol::parse;
//!
//! let packet = parse("SRCUSER>APRS,qAC,K8SDR-10::TESTUSER :Hello there{12}").unwrap();
//! let message = packet.as_message().unwrap();
//! assert_eq!(message.text, "Hello there");
//! assert_eq!(message.id.as_deref(), Some("12"));
//! ```

pub mod callsign;
pub mod codec;
pub mod frames;
pub mod packet;
pub mod parser;
pub mod passcode;
pub mod wire;

pub use callsign::{
    base_callsign, is_valid_callsign, normalize, pad_addressee, same_station, ConversationKey,
    ADDRESSEE_WIDTH,
};
pub use codec::{decode, encode, ProtocolError};
pub use frames::{
    ClientRequest, DeliveryStatus, DuplicateNotice, PushMessage, RouteHop, ServerEvent,
    StatusUpdate,
};
pub use packet::{
    MessageBody, Packet, PacketBody, PacketKind, ParseError, ResponseBody, ResponseKind,
    TelemetryTag, BULLETIN_PREFIX,
};
pub use parser::parse;
pub use passcode::{passcode, verify_passcode};
pub use wire::{
    encode_line, truncate_text, OutboundMessage, Payload, DEFAULT_DESTINATION, MAX_TEXT_LENGTH,
};

//! # aprsgate-core
//!
//! Reliability and routing for the aprsgate APRS-IS messaging gateway.
//!
//! - **Conversation** - per-station-pair message id state and dedup
//! - **Reliability** - acks, retry detection and outbound id allocation
//! - **Router** - fan-out to live client sessions, history replay, keepalive
//! - **Store** - message store and station directory seams
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌───────────────┐
//! │ LinkManager │────▶│ ReliabilityEng. │────▶│ SessionRouter │──▶ clients
//! └─────────────┘     └─────────────────┘     └───────────────┘
//!        ▲                     │
//!        └──── acks / sends ───┘
//! ```

pub mod conversation;
pub mod reliability;
pub mod router;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_utils;

pub use conversation::{
    next_message_id, Allocation, ConversationTable, InboundOutcome, MessageState,
    MAX_TRACKED_IDS,
};
pub use reliability::{
    EngineStats, GatewayIdentity, InboundDisposition, InboundQueue, ReliabilityEngine, SendError,
    SentMessage,
};
pub use router::{
    build_route, dedupe_route, Attachment, ReplaySummary, RouterConfig, RouterStats,
    SessionRouter, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_TIMEOUT,
};
pub use session::{ClientId, ClientSink, Session, SinkError};
pub use store::{
    now_millis, Directory, DirectoryError, MemoryDirectory, MemoryStore, MessageStore,
    StoreError, StoredMessage, StoredMessageId,
};

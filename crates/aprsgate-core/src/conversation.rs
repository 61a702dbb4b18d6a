//! Per-conversation message id state.
//!
//! Each [`ConversationKey`] owns one [`MessageState`] for the life of the
//! process. All decisions for a key happen under that key's map entry, so they
//! are serialized per conversation while different conversations proceed
//! independently.

use aprsgate_protocol::ConversationKey;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};

/// Maximum number of received ids a conversation keeps retry counters for.
pub const MAX_TRACKED_IDS: usize = 100;

/// Allocate the id that follows `last`.
///
/// Ids are two-digit, zero-padded and roll over from `99` to `00`. An empty or
/// non-numeric `last` starts the sequence at `01`.
///
/// ```rust
/// use aprsgate_core::next_message_id;
///
/// assert_eq!(next_message_id(""), "01");
/// assert_eq!(next_message_id("05"), "06");
/// assert_eq!(next_message_id("99"), "00");
/// ```
#[must_use]
pub fn next_message_id(last: &str) -> String {
    match last.trim().parse::<u32>() {
        Ok(n) => format!("{:02}", (n % 100 + 1) % 100),
        Err(_) => "01".to_string(),
    }
}

/// Result of recording an inbound message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// First time this id was seen in a row.
    New,
    /// Retransmission of the last received id.
    Duplicate { retry_count: u32 },
}

impl InboundOutcome {
    /// Check if the id was a retransmission.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, InboundOutcome::Duplicate { .. })
    }
}

/// An id allocated for a locally originated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The new message id.
    pub id: String,
    /// Last id received from the remote station, to piggyback as a reply-ack.
    pub reply_ack: Option<String>,
}

/// Message id bookkeeping for one conversation.
#[derive(Debug, Clone, Default)]
pub struct MessageState {
    /// Last id we sent.
    pub last_sent_id: Option<String>,
    /// Last id we received.
    pub last_received_id: Option<String>,
    retries: HashMap<String, u32>,
    /// Insertion order of `retries`, oldest first.
    order: VecDeque<String>,
}

impl MessageState {
    /// Get the retry counter for a received id.
    #[must_use]
    pub fn retry_count(&self, id: &str) -> u32 {
        self.retries.get(id).copied().unwrap_or(0)
    }

    /// Number of ids with a retry counter.
    #[must_use]
    pub fn tracked_ids(&self) -> usize {
        self.retries.len()
    }

    fn bump_retry(&mut self, id: &str) -> u32 {
        if let Some(count) = self.retries.get_mut(id) {
            *count += 1;
            return *count;
        }

        if self.order.len() >= MAX_TRACKED_IDS {
            if let Some(oldest) = self.order.pop_front() {
                self.retries.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.retries.insert(id.to_string(), 1);
        1
    }
}

/// All conversations known to the gateway.
#[derive(Debug, Default)]
pub struct ConversationTable {
    states: DashMap<ConversationKey, MessageState>,
}

impl ConversationTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received message id and report whether it is a duplicate.
    ///
    /// Ids are compared as opaque strings against the last received id only.
    pub fn record_inbound(&self, key: &ConversationKey, id: &str) -> InboundOutcome {
        let mut state = self.states.entry(key.clone()).or_default();

        if state.last_received_id.as_deref() == Some(id) {
            InboundOutcome::Duplicate {
                retry_count: state.bump_retry(id),
            }
        } else {
            state.last_received_id = Some(id.to_string());
            InboundOutcome::New
        }
    }

    /// Allocate the next outbound id and record it as the last sent id.
    pub fn allocate_outbound(&self, key: &ConversationKey) -> Allocation {
        let mut state = self.states.entry(key.clone()).or_default();

        let id = next_message_id(state.last_sent_id.as_deref().unwrap_or_default());
        state.last_sent_id = Some(id.clone());

        Allocation {
            id,
            reply_ack: state.last_received_id.clone(),
        }
    }

    /// Get a copy of a conversation's state.
    #[must_use]
    pub fn get(&self, key: &ConversationKey) -> Option<MessageState> {
        self.states.get(key).map(|s| s.clone())
    }

    /// Number of conversations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Check if no conversation has been seen yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

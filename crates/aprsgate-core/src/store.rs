//! Message store and station directory.
//!
//! The gateway only talks to persistence through [`MessageStore`] and
//! [`Directory`]. [`MemoryStore`] and [`MemoryDirectory`] back tests and
//! single-process deployments.

use aprsgate_protocol::base_callsign;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or rejected the operation.
    #[error("Message store unavailable: {0}")]
    Unavailable(String),
}

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The lookup could not be completed.
    #[error("Directory lookup failed: {0}")]
    Lookup(String),
}

/// Identifier assigned by the store.
pub type StoredMessageId = i64;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: StoredMessageId,
    pub to: String,
    pub from: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Pushed to a live client at least once.
    pub delivered: bool,
}

impl StoredMessage {
    /// Check if the message was sent to `callsign`'s station.
    #[must_use]
    pub fn is_incoming_for(&self, callsign: &str) -> bool {
        base_callsign(&self.to) == base_callsign(callsign)
    }

    /// Check if `callsign`'s station sent or received the message.
    #[must_use]
    pub fn involves(&self, callsign: &str) -> bool {
        let base = base_callsign(callsign);
        base_callsign(&self.to) == base || base_callsign(&self.from) == base
    }
}

/// Durable message history.
///
/// Callsigns match on their base form, so any SSID of a station sees the
/// station's whole history. Implementations must be safe to call from many
/// tasks at once.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return its id.
    async fn store(&self, to: &str, from: &str, text: &str)
        -> Result<StoredMessageId, StoreError>;

    /// All messages sent or received by `callsign`, oldest first.
    async fn list_history(&self, callsign: &str) -> Result<Vec<StoredMessage>, StoreError>;

    /// Mark messages delivered. Marking an id twice is not an error.
    async fn mark_delivered(&self, ids: &[StoredMessageId]) -> Result<(), StoreError>;

    /// Messages addressed to `callsign` that were never delivered, oldest first.
    async fn list_undelivered(&self, callsign: &str) -> Result<Vec<StoredMessage>, StoreError>;
}

/// Answers which stations this gateway serves.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Check if a base callsign belongs to a local account.
    async fn is_served(&self, base: &str) -> Result<bool, DirectoryError>;
}

/// In-memory [`MessageStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: RwLock<Vec<StoredMessage>>,
    next_id: AtomicI64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Check if nothing was stored yet.
    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn store(
        &self,
        to: &str,
        from: &str,
        text: &str,
    ) -> Result<StoredMessageId, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.messages.write().await.push(StoredMessage {
            id,
            to: to.to_string(),
            from: from.to_string(),
            text: text.to_string(),
            created_at: now_millis(),
            delivered: false,
        });
        Ok(id)
    }

    async fn list_history(&self, callsign: &str) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.involves(callsign))
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, ids: &[StoredMessageId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: HashSet<_> = ids.iter().copied().collect();
        for message in self.messages.write().await.iter_mut() {
            if ids.contains(&message.id) {
                message.delivered = true;
            }
        }
        Ok(())
    }

    async fn list_undelivered(&self, callsign: &str) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| !m.delivered && m.is_incoming_for(callsign))
            .cloned()
            .collect())
    }
}

/// In-memory [`Directory`] holding a set of base callsigns.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    callsigns: RwLock<HashSet<String>>,
}

impl MemoryDirectory {
    /// Create a directory serving the given callsigns.
    #[must_use]
    pub fn new<I, S>(callsigns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            callsigns: RwLock::new(Self::collect(callsigns)),
        }
    }

    /// Replace the whole set. Returns the new size.
    pub async fn replace<I, S>(&self, callsigns: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = Self::collect(callsigns);
        let len = set.len();
        *self.callsigns.write().await = set;
        len
    }

    /// Add one callsign.
    pub async fn insert(&self, callsign: &str) -> bool {
        self.callsigns.write().await.insert(base_callsign(callsign))
    }

    /// Number of served callsigns.
    pub async fn len(&self) -> usize {
        self.callsigns.read().await.len()
    }

    fn collect<I, S>(callsigns: I) -> HashSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        callsigns
            .into_iter()
            .map(|c| base_callsign(c.as_ref()))
            .filter(|c| !c.is_empty())
            .collect()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn is_served(&self, base: &str) -> Result<bool, DirectoryError> {
        Ok(self.callsigns.read().await.contains(&base_callsign(base)))
    }
}

//! Client sessions.
//!
//! A [`Session`] groups the live client connections of one base callsign.
//! Clients are reached through the [`ClientSink`] trait so the router never
//! depends on a particular transport.

use aprsgate_protocol::ServerEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate a process-unique id.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Client sink errors.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The connection is gone.
    #[error("Client disconnected")]
    Closed,

    /// The client did not answer a ping in time.
    #[error("Client ping timed out")]
    Timeout,
}

/// A live client connection that can receive events.
#[async_trait]
pub trait ClientSink: Send + Sync {
    /// Get the client's id.
    fn id(&self) -> ClientId;

    /// Queue an event for the client without waiting for the write.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Closed`] if the connection is gone.
    fn push(&self, event: ServerEvent) -> Result<(), SinkError>;

    /// Ping the connection and wait for the transport to confirm it.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is gone or did not answer in time.
    async fn ping(&self) -> Result<(), SinkError>;

    /// Ask the transport to close the connection.
    ///
    /// Called when the gateway gives up on a client; the connection's own
    /// task does the actual teardown.
    fn close(&self);
}

/// The live clients of one base callsign.
pub struct Session {
    callsign: String,
    clients: HashMap<ClientId, Arc<dyn ClientSink>>,
}

impl Session {
    /// Create an empty session.
    #[must_use]
    pub fn new(callsign: impl Into<String>) -> Self {
        Self {
            callsign: callsign.into(),
            clients: HashMap::new(),
        }
    }

    /// Add a client. Returns `true` if it was not attached already.
    pub fn attach(&mut self, client: Arc<dyn ClientSink>) -> bool {
        let id = client.id();
        let added = self.clients.insert(id, client).is_none();
        if added {
            debug!(callsign = %self.callsign, client = %id, clients = self.clients.len(), "Client attached");
        }
        added
    }

    /// Remove a client. Returns `true` if it was attached.
    pub fn detach(&mut self, id: ClientId) -> bool {
        let removed = self.clients.remove(&id).is_some();
        if removed {
            debug!(callsign = %self.callsign, client = %id, clients = self.clients.len(), "Client detached");
        }
        removed
    }

    /// Check if a client is attached.
    #[must_use]
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Number of attached clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Check if no client is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Snapshot the attached clients, skipping `exclude`.
    #[must_use]
    pub fn clients_except(&self, exclude: Option<ClientId>) -> Vec<Arc<dyn ClientSink>> {
        self.clients
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(_, client)| client.clone())
            .collect()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("callsign", &self.callsign)
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

//! Test doubles for the core crate.

use crate::session::{ClientId, ClientSink, SinkError};
use crate::store::{
    Directory, DirectoryError, MemoryStore, MessageStore, StoreError, StoredMessage,
    StoredMessageId,
};
use aprsgate_link::{LinkError, Uplink};
use aprsgate_protocol::{PushMessage, ServerEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Uplink that records every line.
pub struct RecordingUplink {
    lines: Mutex<Vec<String>>,
    active: AtomicBool,
}

impl RecordingUplink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lines: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
        })
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uplink for RecordingUplink {
    async fn send_raw(&self, line: &str) -> Result<(), LinkError> {
        if !self.is_active() {
            return Err(LinkError::Inactive);
        }
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Client that records every event.
pub struct RecordingClient {
    id: ClientId,
    events: Mutex<Vec<ServerEvent>>,
    closed: AtomicBool,
    close_requested: AtomicBool,
    failing_pings: AtomicBool,
    pings: AtomicUsize,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ClientId::generate(),
            events: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            failing_pings: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
        })
    }

    /// Simulate the transport going away.
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether the gateway asked for the connection to be closed.
    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    pub fn fail_pings(&self) {
        self.failing_pings.store(true, Ordering::SeqCst);
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Only the pushed messages, in order.
    pub fn messages(&self) -> Vec<PushMessage> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ClientSink for RecordingClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn push(&self, event: ServerEvent) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn ping(&self) -> Result<(), SinkError> {
        if self.failing_pings.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
    }
}

/// Memory store that records `mark_delivered` calls.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    marks: Mutex<Vec<Vec<StoredMessageId>>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_calls(&self) -> Vec<Vec<StoredMessageId>> {
        self.marks.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageStore for RecordingStore {
    async fn store(
        &self,
        to: &str,
        from: &str,
        text: &str,
    ) -> Result<StoredMessageId, StoreError> {
        self.inner.store(to, from, text).await
    }

    async fn list_history(&self, callsign: &str) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.list_history(callsign).await
    }

    async fn mark_delivered(&self, ids: &[StoredMessageId]) -> Result<(), StoreError> {
        self.marks.lock().unwrap().push(ids.to_vec());
        self.inner.mark_delivered(ids).await
    }

    async fn list_undelivered(&self, callsign: &str) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.list_undelivered(callsign).await
    }
}

/// Store whose every call fails.
pub struct FailingStore;

#[async_trait]
impl MessageStore for FailingStore {
    async fn store(&self, _: &str, _: &str, _: &str) -> Result<StoredMessageId, StoreError> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn list_history(&self, _: &str) -> Result<Vec<StoredMessage>, StoreError> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn mark_delivered(&self, _: &[StoredMessageId]) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn list_undelivered(&self, _: &str) -> Result<Vec<StoredMessage>, StoreError> {
        Err(StoreError::Unavailable("down".into()))
    }
}

/// Directory whose every lookup fails.
pub struct FailingDirectory;

#[async_trait]
impl Directory for FailingDirectory {
    async fn is_served(&self, _: &str) -> Result<bool, DirectoryError> {
        Err(DirectoryError::Lookup("down".into()))
    }
}

/// Directory that serves every callsign but stalls on its first lookup.
#[derive(Default)]
pub struct SlowDirectory {
    lookups: AtomicUsize,
}

impl SlowDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for SlowDirectory {
    async fn is_served(&self, _: &str) -> Result<bool, DirectoryError> {
        if self.lookups.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(true)
    }
}

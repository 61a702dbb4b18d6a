//! Reliability engine.
//!
//! Turns the best-effort radio network into acknowledged, deduplicated
//! messaging:
//!
//! - inbound messages for served stations are stored, acknowledged once per
//!   attempt and delivered unless they repeat the last received id
//! - piggybacked reply-acks and bare `ack`/`rej` packets become status
//!   updates for locally originated messages
//! - local sends get the next id of their conversation, with the last
//!   received id piggybacked as a reply-ack

use crate::conversation::{ConversationTable, InboundOutcome};
use crate::router::{dedupe_route, SessionRouter};
use crate::session::ClientId;
use crate::store::{now_millis, Directory, MessageStore, StoredMessageId};
use aprsgate_link::{LinkError, PacketSink, Uplink};
use aprsgate_protocol::{
    base_callsign, is_valid_callsign, normalize, truncate_text, ConversationKey, DeliveryStatus,
    DuplicateNotice, MessageBody, OutboundMessage, Packet, PacketBody, Payload, PushMessage,
    ResponseBody, ResponseKind, ServerEvent, StatusUpdate, DEFAULT_DESTINATION,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Errors returned to local senders.
#[derive(Debug, Error)]
pub enum SendError {
    /// The recipient is not a valid callsign.
    #[error("Invalid recipient callsign: {0}")]
    InvalidRecipient(String),

    /// The sender is not a valid callsign.
    #[error("Invalid sender callsign: {0}")]
    InvalidSender(String),

    /// Nothing to send.
    #[error("Message text is empty")]
    EmptyMessage,

    /// The upstream link refused the message.
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// How the gateway appears in outbound packet paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayIdentity {
    /// The gateway's own callsign, as logged in upstream.
    pub callsign: String,
    /// Path hops written after the destination field.
    pub path: Vec<String>,
}

impl GatewayIdentity {
    /// Identity with the usual `TCPIP,<CALL>*` path.
    #[must_use]
    pub fn new(callsign: &str) -> Self {
        let callsign = normalize(callsign);
        Self {
            path: vec!["TCPIP".to_string(), format!("{callsign}*")],
            callsign,
        }
    }

    /// Replace the path hops.
    #[must_use]
    pub fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }
}

/// What happened to one inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundDisposition {
    /// Not a message or response for a station.
    Ignored,
    /// Addressed to a station this gateway does not serve.
    NotServed,
    /// A message was processed.
    Message {
        /// Dedup result; `None` for messages without an id.
        outcome: Option<InboundOutcome>,
        /// An `ack` went upstream.
        acked: bool,
        /// Clients the message was pushed to.
        delivered_to: usize,
    },
    /// A bare ack/rej was turned into a status update.
    Response { kind: ResponseKind, id: String },
}

/// A successfully sent local message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub conversation_key: ConversationKey,
    /// Allocated message id.
    pub id: String,
    /// The line written upstream.
    pub line: String,
    /// Store id, if persisting succeeded.
    pub stored_id: Option<StoredMessageId>,
}

/// Whether a callsign is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Served {
    Yes,
    No,
    /// Directory lookup failed.
    Unknown,
}

#[derive(Debug, Default)]
struct EngineCounters {
    inbound: AtomicU64,
    not_served: AtomicU64,
    duplicates: AtomicU64,
    acks_sent: AtomicU64,
    ack_failures: AtomicU64,
    responses: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    store_failures: AtomicU64,
}

/// Engine statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    /// Messages for served stations.
    pub inbound_messages: u64,
    /// Messages for stations this gateway does not serve.
    pub not_served: u64,
    /// Retransmissions detected.
    pub duplicates: u64,
    /// Acks written upstream.
    pub acks_sent: u64,
    /// Acks the link refused.
    pub ack_failures: u64,
    /// Bare ack/rej packets handled.
    pub responses: u64,
    /// Local messages sent upstream.
    pub messages_sent: u64,
    /// Local messages the link refused.
    pub send_failures: u64,
    /// Failed store writes.
    pub store_failures: u64,
}

struct EngineInner {
    conversations: ConversationTable,
    uplink: Arc<dyn Uplink>,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn Directory>,
    router: Arc<SessionRouter>,
    gateway: GatewayIdentity,
    counters: EngineCounters,
}

/// The reliability engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ReliabilityEngine {
    inner: Arc<EngineInner>,
}

impl ReliabilityEngine {
    /// Create an engine.
    #[must_use]
    pub fn new(
        uplink: Arc<dyn Uplink>,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn Directory>,
        router: Arc<SessionRouter>,
        gateway: GatewayIdentity,
    ) -> Self {
        info!(gateway = %gateway.callsign, path = ?gateway.path, "Creating reliability engine");
        Self {
            inner: Arc::new(EngineInner {
                conversations: ConversationTable::new(),
                uplink,
                store,
                directory,
                router,
                gateway,
                counters: EngineCounters::default(),
            }),
        }
    }

    /// Get the conversation table.
    #[must_use]
    pub fn conversations(&self) -> &ConversationTable {
        &self.inner.conversations
    }

    /// Get the session router.
    #[must_use]
    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.inner.router
    }

    /// Get the gateway identity.
    #[must_use]
    pub fn gateway(&self) -> &GatewayIdentity {
        &self.inner.gateway
    }

    /// Get engine statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        EngineStats {
            inbound_messages: c.inbound.load(Ordering::Relaxed),
            not_served: c.not_served.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            acks_sent: c.acks_sent.load(Ordering::Relaxed),
            ack_failures: c.ack_failures.load(Ordering::Relaxed),
            responses: c.responses.load(Ordering::Relaxed),
            messages_sent: c.sent.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            store_failures: c.store_failures.load(Ordering::Relaxed),
        }
    }

    /// Process one inbound packet.
    ///
    /// Failures are logged and absorbed.
    pub async fn handle_inbound(&self, packet: Packet) -> InboundDisposition {
        match &packet.body {
            PacketBody::Message(message) if packet.is_user_message() => {
                self.handle_message(&packet, message).await
            }
            PacketBody::Response(response) => self.handle_response(&packet, response).await,
            _ => InboundDisposition::Ignored,
        }
    }

    async fn handle_message(&self, packet: &Packet, message: &MessageBody) -> InboundDisposition {
        let inner = &self.inner;

        let served = self.served(&message.addressee).await;
        if served == Served::No {
            inner.counters.not_served.fetch_add(1, Ordering::Relaxed);
            trace!(addressee = %message.addressee, source = %packet.source, "Addressee not served");
            return InboundDisposition::NotServed;
        }
        inner.counters.inbound.fetch_add(1, Ordering::Relaxed);

        let key = ConversationKey::new(&message.addressee, &packet.source);
        let outcome = message
            .id
            .as_deref()
            .map(|id| inner.conversations.record_inbound(&key, id));

        debug!(
            conversation = %key,
            id = ?message.id,
            duplicate = outcome.is_some_and(|o| o.is_duplicate()),
            "Inbound message"
        );

        // Store before acking; failures only cost durability.
        let stored_id = match inner
            .store
            .store(&message.addressee, &packet.source, &message.text)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                inner.counters.store_failures.fetch_add(1, Ordering::Relaxed);
                warn!(conversation = %key, error = %e, "Failed to store inbound message");
                None
            }
        };

        let acked = match &message.id {
            Some(id) => self.send_ack(&message.addressee, &packet.source, id).await,
            None => false,
        };

        let delivered_to = match (served, outcome) {
            (Served::Unknown, _) => 0,
            (_, Some(InboundOutcome::Duplicate { retry_count })) => {
                inner.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                if let Some(id) = &message.id {
                    inner.router.notify_duplicate(DuplicateNotice {
                        conversation_key: key.clone(),
                        message_id: id.clone(),
                        retry_count,
                    });
                }
                0
            }
            _ => inner.router.deliver(
                &packet.source,
                &message.addressee,
                &message.text,
                &packet.path,
                None,
            ),
        };

        if delivered_to > 0 {
            if let Some(stored_id) = stored_id {
                if let Err(e) = inner.store.mark_delivered(&[stored_id]).await {
                    warn!(conversation = %key, error = %e, "Failed to mark message delivered");
                }
            }
        }

        if let Some(ack_id) = &message.ack_id {
            debug!(conversation = %key, id = %ack_id, "Reply-ack received");
            inner.router.notify_status(StatusUpdate {
                conversation_key: key.clone(),
                message_id: ack_id.clone(),
                status: DeliveryStatus::Delivered,
                retry_count: 0,
            });
        }

        InboundDisposition::Message {
            outcome,
            acked,
            delivered_to,
        }
    }

    async fn handle_response(&self, packet: &Packet, response: &ResponseBody) -> InboundDisposition {
        let inner = &self.inner;

        if self.served(&response.addressee).await != Served::Yes {
            inner.counters.not_served.fetch_add(1, Ordering::Relaxed);
            return InboundDisposition::NotServed;
        }
        inner.counters.responses.fetch_add(1, Ordering::Relaxed);

        let key = ConversationKey::new(&response.addressee, &packet.source);
        let status = match response.kind {
            ResponseKind::Ack => DeliveryStatus::Delivered,
            ResponseKind::Rej => DeliveryStatus::Rejected,
        };
        debug!(conversation = %key, id = %response.id, kind = response.kind.as_str(), "Response received");

        inner.router.notify_status(StatusUpdate {
            conversation_key: key,
            message_id: response.id.clone(),
            status,
            retry_count: 0,
        });

        InboundDisposition::Response {
            kind: response.kind,
            id: response.id.clone(),
        }
    }

    /// Directory membership or live interest.
    async fn served(&self, addressee: &str) -> Served {
        let base = base_callsign(addressee);
        if self.inner.router.has_interest(&base) {
            return Served::Yes;
        }
        match self.inner.directory.is_served(&base).await {
            Ok(true) => Served::Yes,
            Ok(false) => Served::No,
            Err(e) => {
                warn!(callsign = %base, error = %e, "Directory lookup failed");
                Served::Unknown
            }
        }
    }

    async fn send_ack(&self, from: &str, to: &str, id: &str) -> bool {
        let inner = &self.inner;
        let ack = OutboundMessage::new(from, to, Payload::Ack(id.to_string()))
            .with_path(inner.gateway.path.clone());

        match inner.uplink.send_message(&ack).await {
            Ok(()) => {
                inner.counters.acks_sent.fetch_add(1, Ordering::Relaxed);
                trace!(from = %from, to = %to, id = %id, "Sent ack");
                true
            }
            Err(e) => {
                inner.counters.ack_failures.fetch_add(1, Ordering::Relaxed);
                warn!(from = %from, to = %to, id = %id, error = %e, "Failed to send ack");
                false
            }
        }
    }

    /// Send a message from a local station.
    ///
    /// On success the message is stored, the sender's session gets a `sent`
    /// status, and the sender's other clients (all but `origin`) get a copy.
    ///
    /// # Errors
    ///
    /// Returns an error if either callsign is invalid, the text is empty, or
    /// the link refused the message. Nothing is queued for retry.
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        text: &str,
        origin: Option<ClientId>,
    ) -> Result<SentMessage, SendError> {
        let inner = &self.inner;

        let from = normalize(from);
        let to = normalize(to);
        if !is_valid_callsign(&from) {
            return Err(SendError::InvalidSender(from));
        }
        if !is_valid_callsign(&to) {
            return Err(SendError::InvalidRecipient(to));
        }
        let text = truncate_text(text.trim()).to_string();
        if text.is_empty() {
            return Err(SendError::EmptyMessage);
        }

        // Don't burn an id when the link is known to be down.
        if !inner.uplink.is_active() {
            inner.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(LinkError::Inactive.into());
        }

        let key = ConversationKey::new(&from, &to);
        let allocation = inner.conversations.allocate_outbound(&key);
        let payload = match allocation.reply_ack {
            Some(ack_id) => Payload::ReplyAck {
                text: text.clone(),
                id: allocation.id.clone(),
                ack_id,
            },
            None => Payload::Numbered {
                text: text.clone(),
                id: allocation.id.clone(),
            },
        };
        let message =
            OutboundMessage::new(&from, &to, payload).with_path(inner.gateway.path.clone());

        if let Err(e) = inner.uplink.send_message(&message).await {
            inner.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            warn!(conversation = %key, id = %allocation.id, error = %e, "Send failed");
            return Err(e.into());
        }
        inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        info!(conversation = %key, id = %allocation.id, "Message sent");

        let stored_id = match inner.store.store(&to, &from, &text).await {
            Ok(id) => Some(id),
            Err(e) => {
                inner.counters.store_failures.fetch_add(1, Ordering::Relaxed);
                warn!(conversation = %key, error = %e, "Failed to store sent message");
                None
            }
        };

        inner.router.notify_status(StatusUpdate {
            conversation_key: key.clone(),
            message_id: allocation.id.clone(),
            status: DeliveryStatus::Sent,
            retry_count: 0,
        });

        let echo = PushMessage {
            route: dedupe_route([
                from.as_str(),
                DEFAULT_DESTINATION,
                inner.gateway.callsign.as_str(),
                to.as_str(),
            ]),
            from: from.clone(),
            to: to.clone(),
            text,
            created_at: now_millis(),
            historical: false,
        };
        inner
            .router
            .publish(&from, ServerEvent::Message(echo), origin);

        Ok(SentMessage {
            conversation_key: key,
            id: allocation.id,
            line: message.to_line(),
            stored_id,
        })
    }
}

impl ReliabilityEngine {
    /// Start the task that handles inbound packets.
    ///
    /// Packets are handled one at a time in the order the link read them, so
    /// dedup decisions see retransmissions in upstream order. The returned
    /// queue is the [`PacketSink`] to give the link.
    #[must_use]
    pub fn spawn_inbound(&self) -> (InboundQueue, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let disposition = engine.handle_inbound(packet).await;
                trace!(?disposition, "Inbound packet handled");
            }
            debug!("Inbound queue closed");
        });

        (InboundQueue { tx }, handle)
    }
}

/// Ordered hand-off from the link's read loop to the engine.
#[derive(Debug, Clone)]
pub struct InboundQueue {
    tx: mpsc::UnboundedSender<Packet>,
}

impl PacketSink for InboundQueue {
    fn on_packet(&self, packet: Packet) {
        if self.tx.send(packet).is_err() {
            warn!("Inbound queue closed, dropping packet");
        }
    }
}

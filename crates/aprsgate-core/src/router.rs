//! Session router.
//!
//! Fans inbound traffic out to the live clients of each base callsign,
//! replays stored history when a client attaches and keeps clients alive with
//! periodic pings.

use crate::session::{ClientId, ClientSink, Session, SinkError};
use crate::store::{now_millis, MessageStore, StoredMessage};
use aprsgate_protocol::{
    base_callsign, DuplicateNotice, PushMessage, RouteHop, ServerEvent, StatusUpdate,
};
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default interval between keepalive pings.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default time a client has to answer a ping.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Ping interval; `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,
    /// Deadline for each ping.
    pub keepalive_timeout: Duration,
}

impl RouterConfig {
    /// Configuration with keepalive disabled.
    #[must_use]
    pub fn without_keepalive() -> Self {
        Self {
            keepalive_interval: None,
            ..Self::default()
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
        }
    }
}

/// Build a display route from hops, in order, without repeats.
///
/// A trailing `*` (the "has been repeated" marker) is stripped before
/// comparing, and empty hops are skipped.
#[must_use]
pub fn dedupe_route<'a, I>(hops: I) -> Vec<RouteHop>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    hops.into_iter()
        .map(|hop| hop.trim_end_matches('*'))
        .filter(|hop| !hop.is_empty() && seen.insert(hop.to_string()))
        .map(RouteHop::new)
        .collect()
}

/// Route of a received packet: sender, digipeater path, recipient.
#[must_use]
pub fn build_route(from: &str, path: &[String], to: &str) -> Vec<RouteHop> {
    dedupe_route(
        std::iter::once(from)
            .chain(path.iter().map(String::as_str))
            .chain(std::iter::once(to)),
    )
}

/// Result of replaying history to one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Messages pushed to the client.
    pub pushed: usize,
    /// Incoming messages marked delivered afterwards.
    pub marked: usize,
}

/// Handle returned by [`SessionRouter::attach`].
#[derive(Debug)]
pub struct Attachment {
    /// Base callsign the client was attached under.
    pub callsign: String,
    /// True if no other client was attached, so interest was registered.
    pub first_client: bool,
    /// False if this client was already attached; nothing new was started.
    pub newly_attached: bool,
    /// History replay running in the background.
    pub replay: JoinHandle<ReplaySummary>,
}

#[derive(Debug, Default)]
struct RouterCounters {
    registrations: AtomicU64,
    delivered: AtomicU64,
    replayed: AtomicU64,
    keepalive_failures: AtomicU64,
}

/// Router statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    /// Callsigns with at least one live client.
    pub session_count: usize,
    /// Attached clients across all sessions.
    pub client_count: usize,
    /// Interest registrations since startup.
    pub registrations: u64,
    /// Live events pushed to clients.
    pub events_delivered: u64,
    /// Historical messages pushed to clients.
    pub history_replayed: u64,
    /// Clients dropped for missing a ping.
    pub keepalive_failures: u64,
}

/// Routes events to live client sessions.
pub struct SessionRouter {
    /// Sessions indexed by base callsign.
    sessions: DashMap<String, Session>,
    /// Base callsigns with registered interest.
    interest: DashSet<String>,
    store: Arc<dyn MessageStore>,
    config: RouterConfig,
    counters: RouterCounters,
}

impl SessionRouter {
    /// Create a router.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, config: RouterConfig) -> Self {
        info!(
            keepalive_secs = config.keepalive_interval.map(|d| d.as_secs()),
            "Creating session router"
        );
        Self {
            sessions: DashMap::new(),
            interest: DashSet::new(),
            store,
            config,
            counters: RouterCounters::default(),
        }
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            session_count: self.sessions.len(),
            client_count: self.sessions.iter().map(|s| s.len()).sum(),
            registrations: self.counters.registrations.load(Ordering::Relaxed),
            events_delivered: self.counters.delivered.load(Ordering::Relaxed),
            history_replayed: self.counters.replayed.load(Ordering::Relaxed),
            keepalive_failures: self.counters.keepalive_failures.load(Ordering::Relaxed),
        }
    }

    /// Attach a client to a callsign's session.
    ///
    /// The first client registers interest in the callsign. Every attaching
    /// client gets the stored history replayed in the background, after which
    /// the incoming messages it contained are marked delivered.
    pub fn attach(self: &Arc<Self>, callsign: &str, client: Arc<dyn ClientSink>) -> Attachment {
        let base = base_callsign(callsign);

        let (first_client, newly_attached) = {
            let mut session = self
                .sessions
                .entry(base.clone())
                .or_insert_with(|| Session::new(base.clone()));
            let first = session.is_empty();
            let added = session.attach(client.clone());
            if first {
                // Registered under the session lock so a racing detach can't undo it.
                self.interest.insert(base.clone());
            }
            (first, added)
        };

        if first_client {
            self.counters.registrations.fetch_add(1, Ordering::Relaxed);
            info!(callsign = %base, "Registered interest");
        }

        if !newly_attached {
            debug!(callsign = %base, client = %client.id(), "Client already attached");
            return Attachment {
                callsign: base,
                first_client,
                newly_attached,
                replay: tokio::spawn(async { ReplaySummary::default() }),
            };
        }

        if self.config.keepalive_interval.is_some() {
            self.spawn_keepalive(base.clone(), client.clone());
        }

        let router = self.clone();
        let replay_base = base.clone();
        let replay = tokio::spawn(async move { router.replay_history(&replay_base, client).await });

        Attachment {
            callsign: base,
            first_client,
            newly_attached,
            replay,
        }
    }

    /// Detach a client. Returns `true` if it was attached.
    ///
    /// Removing the last client drops the session and its interest.
    pub fn detach(&self, callsign: &str, id: ClientId) -> bool {
        let base = base_callsign(callsign);

        let removed = match self.sessions.get_mut(&base) {
            Some(mut session) => session.detach(id),
            None => false,
        };

        let dropped = self
            .sessions
            .remove_if(&base, |_, session| {
                let empty = session.is_empty();
                if empty {
                    self.interest.remove(&base);
                }
                empty
            })
            .is_some();

        if dropped {
            info!(callsign = %base, "Unregistered interest");
        }
        removed
    }

    /// Check if any client registered interest in a callsign.
    #[must_use]
    pub fn has_interest(&self, callsign: &str) -> bool {
        self.interest.contains(&base_callsign(callsign))
    }

    /// Check if a client is attached to a callsign.
    #[must_use]
    pub fn is_attached(&self, callsign: &str, id: ClientId) -> bool {
        self.sessions
            .get(&base_callsign(callsign))
            .is_some_and(|s| s.contains(id))
    }

    /// Number of clients attached to a callsign.
    #[must_use]
    pub fn client_count(&self, callsign: &str) -> usize {
        self.sessions
            .get(&base_callsign(callsign))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Push an inbound message to every client of `base(to)` except `exclude`.
    ///
    /// Returns the number of clients the message was queued for.
    pub fn deliver(
        &self,
        from: &str,
        to: &str,
        text: &str,
        path: &[String],
        exclude: Option<ClientId>,
    ) -> usize {
        let message = PushMessage {
            from: from.to_string(),
            to: to.to_string(),
            text: text.to_string(),
            route: build_route(from, path, to),
            created_at: now_millis(),
            historical: false,
        };
        self.publish(to, ServerEvent::Message(message), exclude)
    }

    /// Tell the local side of a conversation about one of its messages.
    pub fn notify_status(&self, update: StatusUpdate) -> usize {
        let callsign = update.conversation_key.local.clone();
        self.publish(&callsign, ServerEvent::Status(update), None)
    }

    /// Tell the local side of a conversation that a retransmission arrived.
    pub fn notify_duplicate(&self, notice: DuplicateNotice) -> usize {
        let callsign = notice.conversation_key.local.clone();
        self.publish(&callsign, ServerEvent::RetryReceived(notice), None)
    }

    /// Push an event to every client of `base(callsign)` except `exclude`.
    pub fn publish(&self, callsign: &str, event: ServerEvent, exclude: Option<ClientId>) -> usize {
        let base = base_callsign(callsign);

        // Snapshot so no session lock is held while pushing.
        let clients = match self.sessions.get(&base) {
            Some(session) => session.clients_except(exclude),
            None => {
                trace!(callsign = %base, event = event.name(), "No live session");
                return 0;
            }
        };

        let mut delivered = 0;
        for client in clients {
            match client.push(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(callsign = %base, client = %client.id(), error = %e, "Push failed"),
            }
        }

        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        trace!(callsign = %base, event = event.name(), recipients = delivered, "Published event");
        delivered
    }

    /// Number of stored messages for `callsign` not yet delivered.
    pub async fn pending(&self, callsign: &str) -> usize {
        match self.store.list_undelivered(&base_callsign(callsign)).await {
            Ok(messages) => messages.len(),
            Err(e) => {
                warn!(callsign = %callsign, error = %e, "Failed to count undelivered messages");
                0
            }
        }
    }

    async fn replay_history(&self, base: &str, client: Arc<dyn ClientSink>) -> ReplaySummary {
        let history = match self.store.list_history(base).await {
            Ok(history) => history,
            Err(e) => {
                warn!(callsign = %base, error = %e, "Failed to load history");
                return ReplaySummary::default();
            }
        };

        let mut summary = ReplaySummary::default();
        let mut undelivered = Vec::new();
        for message in history {
            if !message.delivered && message.is_incoming_for(base) {
                undelivered.push(message.id);
            }
            if client.push(historical_event(message)).is_err() {
                // Nothing reached the client, so nothing is marked.
                debug!(callsign = %base, client = %client.id(), "Client left during replay");
                return summary;
            }
            summary.pushed += 1;
        }
        self.counters
            .replayed
            .fetch_add(summary.pushed as u64, Ordering::Relaxed);

        if !undelivered.is_empty() {
            match self.store.mark_delivered(&undelivered).await {
                Ok(()) => summary.marked = undelivered.len(),
                Err(e) => warn!(callsign = %base, error = %e, "Failed to mark history delivered"),
            }
        }

        debug!(
            callsign = %base,
            client = %client.id(),
            pushed = summary.pushed,
            marked = summary.marked,
            "Replayed history"
        );
        summary
    }

    fn spawn_keepalive(self: &Arc<Self>, base: String, client: Arc<dyn ClientSink>) {
        let Some(period) = self.config.keepalive_interval else {
            return;
        };
        let deadline = self.config.keepalive_timeout;
        let router = self.clone();

        tokio::spawn(async move {
            let id = client.id();
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !router.is_attached(&base, id) {
                    break;
                }

                let result = match tokio::time::timeout(deadline, client.ping()).await {
                    Ok(result) => result,
                    Err(_) => Err(SinkError::Timeout),
                };

                if let Err(e) = result {
                    router
                        .counters
                        .keepalive_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(callsign = %base, client = %id, error = %e, "Keepalive failed, detaching client");
                    client.close();
                    router.detach(&base, id);
                    break;
                }
                trace!(callsign = %base, client = %id, "Keepalive ok");
            }
        });
    }
}

fn historical_event(message: StoredMessage) -> ServerEvent {
    let route = dedupe_route([message.from.as_str(), message.to.as_str()]);
    ServerEvent::Message(PushMessage {
        from: message.from,
        to: message.to,
        text: message.text,
        route,
        created_at: message.created_at,
        historical: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_utils::{FailingStore, RecordingClient, RecordingStore};
    use aprsgate_protocol::{ConversationKey, DeliveryStatus};

    fn router_with(store: Arc<dyn MessageStore>) -> Arc<SessionRouter> {
        Arc::new(SessionRouter::new(store, RouterConfig::without_keepalive()))
    }

    fn hops(route: &[RouteHop]) -> Vec<&str> {
        route.iter().map(|h| h.callsign.as_str()).collect()
    }

    #[test]
    fn test_route_dedup() {
        let route = dedupe_route(["W1ABC", "WIDE2-2*", "WIDE2-2*", "K8SDR-10"]);
        assert_eq!(hops(&route), vec!["W1ABC", "WIDE2-2", "K8SDR-10"]);

        let route = build_route(
            "W1ABC",
            &["WIDE1-1*".into(), "WIDE1-1".into(), "".into()],
            "W1ABC",
        );
        assert_eq!(hops(&route), vec!["W1ABC", "WIDE1-1"]);
    }

    #[tokio::test]
    async fn test_second_attach_does_not_reregister_or_remark() {
        let store = Arc::new(RecordingStore::new());
        store.store("K8SDR", "W1ABC", "first").await.unwrap();
        store.store("W1ABC", "K8SDR-7", "reply").await.unwrap();
        let router = router_with(store.clone());

        let a = RecordingClient::new();
        let first = router.attach("K8SDR-7", a.clone());
        assert!(first.first_client);
        assert_eq!(first.callsign, "K8SDR");
        assert_eq!(
            first.replay.await.unwrap(),
            ReplaySummary {
                pushed: 2,
                marked: 1
            }
        );

        let b = RecordingClient::new();
        let second = router.attach("K8SDR", b.clone());
        assert!(!second.first_client);
        assert_eq!(
            second.replay.await.unwrap(),
            ReplaySummary {
                pushed: 2,
                marked: 0
            }
        );

        assert_eq!(store.mark_calls(), vec![vec![1]]);
        assert_eq!(router.stats().registrations, 1);
        assert_eq!(router.client_count("K8SDR"), 2);

        let messages = b.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.historical));
        assert_eq!(hops(&messages[0].route), vec!["W1ABC", "K8SDR"]);
    }

    #[tokio::test]
    async fn test_detach_last_client_drops_interest() {
        let router = router_with(Arc::new(MemoryStore::new()));
        let a = RecordingClient::new();
        let b = RecordingClient::new();

        router.attach("K8SDR", a.clone());
        router.attach("K8SDR-9", b.clone());
        assert!(router.has_interest("K8SDR-1"));

        assert!(router.detach("K8SDR", a.id()));
        assert!(router.has_interest("K8SDR"));
        assert!(!router.detach("K8SDR", a.id()));

        assert!(router.detach("K8SDR", b.id()));
        assert!(!router.has_interest("K8SDR"));
        assert_eq!(router.stats().session_count, 0);

        // Re-attaching registers again.
        assert!(router.attach("K8SDR", a.clone()).first_client);
        assert_eq!(router.stats().registrations, 2);
    }

    #[tokio::test]
    async fn test_deliver_excludes_sender_and_uses_base_session() {
        let router = router_with(Arc::new(MemoryStore::new()));
        let a = RecordingClient::new();
        let b = RecordingClient::new();
        router.attach("K8SDR", a.clone()).replay.await.unwrap();
        router.attach("K8SDR", b.clone()).replay.await.unwrap();

        let path = vec!["WIDE2-2*".to_string(), "WIDE2-2*".to_string()];
        assert_eq!(router.deliver("W1ABC", "K8SDR-10", "hi", &path, None), 2);
        assert_eq!(router.deliver("W1ABC", "K8SDR", "again", &[], Some(a.id())), 1);
        assert_eq!(router.deliver("W1ABC", "N0CALL", "nobody", &[], None), 0);

        assert_eq!(a.messages().len(), 1);
        let received = b.messages();
        assert_eq!(received.len(), 2);
        assert!(!received[0].historical);
        assert_eq!(hops(&received[0].route), vec!["W1ABC", "WIDE2-2", "K8SDR-10"]);
    }

    #[tokio::test]
    async fn test_status_goes_to_local_side() {
        let router = router_with(Arc::new(MemoryStore::new()));
        let client = RecordingClient::new();
        router.attach("K8SDR", client.clone()).replay.await.unwrap();

        let sent = router.notify_status(StatusUpdate {
            conversation_key: ConversationKey::new("K8SDR-7", "W1ABC"),
            message_id: "05".into(),
            status: DeliveryStatus::Delivered,
            retry_count: 0,
        });
        assert_eq!(sent, 1);
        assert!(matches!(
            client.events().last(),
            Some(ServerEvent::Status(s)) if s.message_id == "05"
        ));
    }

    #[tokio::test]
    async fn test_closed_client_is_skipped() {
        let router = router_with(Arc::new(MemoryStore::new()));
        let a = RecordingClient::new();
        let b = RecordingClient::new();
        router.attach("K8SDR", a.clone()).replay.await.unwrap();
        router.attach("K8SDR", b.clone()).replay.await.unwrap();

        a.disconnect();
        assert_eq!(router.deliver("W1ABC", "K8SDR", "hi", &[], None), 1);
    }

    #[tokio::test]
    async fn test_replay_survives_store_failure() {
        let router = router_with(Arc::new(FailingStore));
        let client = RecordingClient::new();

        let attachment = router.attach("K8SDR", client.clone());
        assert_eq!(attachment.replay.await.unwrap(), ReplaySummary::default());
        assert!(router.has_interest("K8SDR"));
        assert_eq!(router.pending("K8SDR").await, 0);
    }

    #[tokio::test]
    async fn test_keepalive_detaches_dead_client() {
        let config = RouterConfig {
            keepalive_interval: Some(Duration::from_millis(10)),
            keepalive_timeout: Duration::from_millis(10),
        };
        let router = Arc::new(SessionRouter::new(Arc::new(MemoryStore::new()), config));

        let alive = RecordingClient::new();
        let dead = RecordingClient::new();
        router.attach("K8SDR", alive.clone());
        router.attach("K8SDR", dead.clone());
        dead.fail_pings();

        tokio::time::timeout(Duration::from_secs(5), async {
            while router.is_attached("K8SDR", dead.id()) || alive.ping_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(router.is_attached("K8SDR", alive.id()));
        assert!(dead.close_requested());
        assert!(!alive.close_requested());
        assert_eq!(router.stats().keepalive_failures, 1);
    }

    #[tokio::test]
    async fn test_reattach_same_client_is_noop() {
        let store = Arc::new(RecordingStore::new());
        store.store("K8SDR", "W1ABC", "first").await.unwrap();
        let router = router_with(store.clone());
        let a = RecordingClient::new();

        let first = router.attach("K8SDR", a.clone());
        assert!(first.newly_attached);
        first.replay.await.unwrap();

        let again = router.attach("K8SDR-7", a.clone());
        assert!(!again.newly_attached);
        assert!(!again.first_client);
        assert_eq!(again.replay.await.unwrap(), ReplaySummary::default());

        assert_eq!(a.messages().len(), 1);
        assert_eq!(router.client_count("K8SDR"), 1);
        assert_eq!(router.stats().registrations, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attach_of_one_client() {
        let router = router_with(Arc::new(MemoryStore::new()));
        let client = RecordingClient::new();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let router = router.clone();
                let client = client.clone();
                tokio::spawn(async move { router.attach("K8SDR", client).newly_attached })
            })
            .collect();

        let mut newly = 0;
        for task in tasks {
            if task.await.unwrap() {
                newly += 1;
            }
        }

        assert_eq!(newly, 1);
        assert_eq!(router.stats().registrations, 1);
        assert_eq!(router.client_count("K8SDR"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_does_not_add_keepalive() {
        let config = RouterConfig {
            keepalive_interval: Some(Duration::from_secs(1)),
            keepalive_timeout: Duration::from_millis(100),
        };
        let router = Arc::new(SessionRouter::new(Arc::new(MemoryStore::new()), config));
        let client = RecordingClient::new();

        router.attach("K8SDR", client.clone());
        router.attach("K8SDR", client.clone());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(client.ping_count(), 1);
    }
}

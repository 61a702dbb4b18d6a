//! Connection handlers for the aprsgate server.
//!
//! This module wires the gateway together and handles the client connection
//! lifecycle: login, sends, keepalive and teardown.

use crate::auth::{Authenticator, PasscodeAuthenticator};
use crate::config::Config;
use crate::directory;
use crate::metrics::{self, ClientMetricsGuard};
use anyhow::Result;
use aprsgate_core::{
    ClientId, ClientSink, MemoryDirectory, MemoryStore, MessageStore, ReliabilityEngine,
    SessionRouter, SinkError,
};
use aprsgate_link::{LinkManager, Uplink};
use aprsgate_protocol::frames::error_codes;
use aprsgate_protocol::{codec, same_station, ClientRequest, ServerEvent};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// How often component statistics are copied into metrics.
const STATS_EXPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The upstream link.
    pub link: Arc<LinkManager>,
    /// Dedup, acks and sends.
    pub engine: ReliabilityEngine,
    /// Served callsigns.
    pub directory: Arc<MemoryDirectory>,
    /// Client login checks.
    pub authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    /// Build the gateway's service objects. Nothing is started.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn MessageStore>) -> Self {
        let directory = Arc::new(MemoryDirectory::new(&config.directory.callsigns));
        let link = Arc::new(LinkManager::new(config.link_config()));
        let router = Arc::new(SessionRouter::new(store.clone(), config.router_config()));
        let engine = ReliabilityEngine::new(
            link.clone(),
            store,
            directory.clone(),
            router,
            config.gateway_identity(),
        );
        let authenticator = Arc::new(PasscodeAuthenticator::new(directory.clone()));

        Self {
            config,
            link,
            engine,
            directory,
            authenticator,
        }
    }
}

/// Run the gateway: upstream link, directory refresh, metrics and the
/// HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone(), Arc::new(MemoryStore::new())));

    if let Some(file) = &config.directory.file {
        let path = PathBuf::from(shellexpand::tilde(file).into_owned());
        match directory::reload(&state.directory, &path, &config.directory.callsigns).await {
            Ok(count) => info!(path = %path.display(), callsigns = count, "Loaded directory"),
            Err(e) => warn!(error = %e, "Failed to load directory file"),
        }
        directory::spawn_refresher(
            state.directory.clone(),
            path,
            config.directory.callsigns.clone(),
            Duration::from_secs(config.directory.refresh_secs.max(1)),
        );
    }

    // Start metrics server if enabled
    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => spawn_stats_exporter(state.clone()),
            Err(e) => error!("Failed to start metrics server: {:#}", e),
        }
    }

    let (inbound, _inbound_task) = state.engine.spawn_inbound();
    tokio::spawn(state.link.clone().run(Arc::new(inbound)));

    let app = Router::new()
        .route(&config.gateway.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("aprsgate listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.gateway.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

fn spawn_stats_exporter(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_EXPORT_INTERVAL);
        loop {
            ticker.tick().await;
            metrics::export_stats(
                state.link.state(),
                &state.link.stats(),
                &state.engine.stats(),
                &state.engine.router().stats(),
            );
        }
    });
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let router = state.engine.router().stats();
    axum::Json(serde_json::json!({
        "status": if state.link.is_active() { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "link": state.link.state().as_str(),
        "sessions": router.session_count,
        "clients": router.client_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Work queued for a connection's write side.
#[derive(Debug)]
enum Outbound {
    Event(ServerEvent),
    /// Send a transport ping; answer on the sender when the pong arrives.
    Ping(oneshot::Sender<()>),
    /// Send a close frame and end the connection.
    Close,
}

/// [`ClientSink`] backed by a WebSocket connection's write queue.
struct WsClient {
    id: ClientId,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl ClientSink for WsClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn push(&self, event: ServerEvent) -> Result<(), SinkError> {
        self.tx
            .send(Outbound::Event(event))
            .map_err(|_| SinkError::Closed)
    }

    async fn ping(&self) -> Result<(), SinkError> {
        let (ack, answered) = oneshot::channel();
        self.tx
            .send(Outbound::Ping(ack))
            .map_err(|_| SinkError::Closed)?;
        answered.await.map_err(|_| SinkError::Closed)
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ClientMetricsGuard::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Arc::new(WsClient {
        id: ClientId::generate(),
        tx,
    });
    debug!(client = %client.id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Logged-in callsign.
    let mut session: Option<String> = None;
    let mut pending_ping: Option<oneshot::Sender<()>> = None;

    loop {
        tokio::select! {
            biased;

            // Events routed to this client
            Some(outbound) = rx.recv() => {
                match outbound {
                    Outbound::Event(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Ping(ack) => {
                        if sender.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                        pending_ping = Some(ack);
                    }
                    Outbound::Close => {
                        debug!(client = %client.id, "Closing unresponsive connection");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            let event = ServerEvent::error(error_codes::INVALID_FRAME, "Frames must be UTF-8 JSON");
                            if send_event(&mut sender, &event).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        if let Some(ack) = pending_ping.take() {
                            let _ = ack.send(());
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(client = %client.id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %client.id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(client = %client.id, "WebSocket stream ended");
                        break;
                    }
                };

                metrics::record_frame("inbound");
                let reply = match codec::decode::<ClientRequest>(&text) {
                    Ok(request) => handle_request(request, &state, &client, &mut session).await,
                    Err(e) => {
                        debug!(client = %client.id, error = %e, "Invalid frame");
                        Some(ServerEvent::error(error_codes::INVALID_FRAME, e.to_string()))
                    }
                };

                if let Some(reply) = reply {
                    if send_event(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    if let Some(callsign) = session {
        state.engine.router().detach(&callsign, client.id);
    }
    debug!(client = %client.id, "WebSocket disconnected");
}

/// Handle one decoded request. Returns a direct reply, if any.
async fn handle_request(
    request: ClientRequest,
    state: &AppState,
    client: &Arc<WsClient>,
    session: &mut Option<String>,
) -> Option<ServerEvent> {
    match request {
        ClientRequest::Login { callsign, passcode } => {
            if session.is_some() {
                return Some(ServerEvent::error(
                    error_codes::INVALID_REQUEST,
                    "Already logged in",
                ));
            }

            let callsign = match state.authenticator.authenticate(&callsign, &passcode).await {
                Ok(callsign) => callsign,
                Err(e) => {
                    warn!(client = %client.id, callsign = %callsign, error = %e, "Login rejected");
                    metrics::record_login("rejected");
                    return Some(ServerEvent::error(error_codes::AUTH_FAILED, e.to_string()));
                }
            };

            let router = state.engine.router();
            let pending = router.pending(&callsign).await;

            // Queued ahead of the history replay.
            if client
                .push(ServerEvent::LoggedIn {
                    callsign: callsign.clone(),
                    pending,
                })
                .is_err()
            {
                return None;
            }

            let attachment = router.attach(&callsign, client.clone());
            info!(
                client = %client.id,
                callsign = %callsign,
                first = attachment.first_client,
                pending,
                "Client logged in"
            );
            metrics::record_login("ok");
            *session = Some(callsign);
            None
        }

        ClientRequest::SendMessage { to, text, from } => {
            let Some(callsign) = session.as_deref() else {
                return Some(ServerEvent::error(
                    error_codes::AUTH_REQUIRED,
                    "Login required",
                ));
            };

            let from = from.unwrap_or_else(|| callsign.to_string());
            if !same_station(&from, callsign) {
                return Some(ServerEvent::error(
                    error_codes::INVALID_REQUEST,
                    format!("Cannot send as {from} while logged in as {callsign}"),
                ));
            }

            match state.engine.send(&from, &to, &text, Some(client.id)).await {
                Ok(sent) => {
                    debug!(client = %client.id, conversation = %sent.conversation_key, id = %sent.id, "Sent");
                    None
                }
                Err(e) => {
                    metrics::record_error("send");
                    Some(ServerEvent::error(error_codes::SEND_FAILED, e.to_string()))
                }
            }
        }

        ClientRequest::Ping { timestamp } => Some(ServerEvent::Pong { timestamp }),
    }
}

/// Send an event to the WebSocket.
async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> Result<()> {
    let text = codec::encode(event)?;
    metrics::record_frame("outbound");
    sender.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        let mut config = Config::default();
        config.link.callsign = "K8SDR-10".into();
        config.heartbeat.interval_ms = 0;
        config.directory.callsigns = vec!["K8SDR".into()];
        AppState::new(config, Arc::new(MemoryStore::new()))
    }

    fn test_client() -> (Arc<WsClient>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(WsClient {
                id: ClientId::generate(),
                tx,
            }),
            rx,
        )
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<ServerEvent> {
        match rx.try_recv() {
            Ok(Outbound::Event(event)) => Some(event),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_ws_client_ping_roundtrip() {
        let (client, mut rx) = test_client();

        let ping = tokio::spawn({
            let client = client.clone();
            async move { client.ping().await }
        });
        match rx.recv().await {
            Some(Outbound::Ping(ack)) => ack.send(()).unwrap(),
            other => panic!("expected ping, got {other:?}"),
        }
        assert!(ping.await.unwrap().is_ok());

        client.close();
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));

        drop(rx);
        assert!(matches!(
            client.push(ServerEvent::Pong { timestamp: None }),
            Err(SinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_requests_before_login() {
        let state = test_state();
        let (client, _rx) = test_client();
        let mut session = None;

        let reply = handle_request(
            ClientRequest::SendMessage {
                to: "W1ABC".into(),
                text: "hi".into(),
                from: None,
            },
            &state,
            &client,
            &mut session,
        )
        .await;
        assert!(matches!(
            reply,
            Some(ServerEvent::Error { code: error_codes::AUTH_REQUIRED, .. })
        ));

        let reply = handle_request(
            ClientRequest::Ping { timestamp: Some(7) },
            &state,
            &client,
            &mut session,
        )
        .await;
        assert_eq!(reply, Some(ServerEvent::Pong { timestamp: Some(7) }));
    }

    #[tokio::test]
    async fn test_login_then_send_without_link() {
        let state = test_state();
        let (client, mut rx) = test_client();
        let mut session = None;

        let reply = handle_request(
            ClientRequest::Login {
                callsign: "K8SDR".into(),
                passcode: "12345".into(),
            },
            &state,
            &client,
            &mut session,
        )
        .await;
        assert!(matches!(
            reply,
            Some(ServerEvent::Error { code: error_codes::AUTH_FAILED, .. })
        ));
        assert!(session.is_none());

        let reply = handle_request(
            ClientRequest::Login {
                callsign: "k8sdr-7".into(),
                passcode: "14750".into(),
            },
            &state,
            &client,
            &mut session,
        )
        .await;
        assert_eq!(reply, None);
        assert_eq!(session.as_deref(), Some("K8SDR-7"));
        assert_eq!(
            next_event(&mut rx),
            Some(ServerEvent::LoggedIn {
                callsign: "K8SDR-7".into(),
                pending: 0
            })
        );
        assert!(state.engine.router().has_interest("K8SDR"));

        let reply = handle_request(
            ClientRequest::SendMessage {
                to: "W1ABC".into(),
                text: "hi".into(),
                from: Some("W1XYZ".into()),
            },
            &state,
            &client,
            &mut session,
        )
        .await;
        assert!(matches!(
            reply,
            Some(ServerEvent::Error { code: error_codes::INVALID_REQUEST, .. })
        ));

        // The link never connected in this test.
        let reply = handle_request(
            ClientRequest::SendMessage {
                to: "W1ABC".into(),
                text: "hi".into(),
                from: None,
            },
            &state,
            &client,
            &mut session,
        )
        .await;
        match reply {
            Some(ServerEvent::Error { code, message }) => {
                assert_eq!(code, error_codes::SEND_FAILED);
                assert_eq!(message, "APRS-IS link is not active");
            }
            other => panic!("expected send failure, got {other:?}"),
        }
    }
}

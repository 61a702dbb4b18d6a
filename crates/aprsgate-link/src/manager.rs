//! The upstream APRS-IS connection.
//!
//! [`LinkManager`] owns the single shared connection and drives it through
//! `Disconnected -> Connecting -> Authenticating -> Streaming` forever,
//! waiting a fixed delay between attempts.

use aprsgate_protocol::{encode_line, parse, PacketKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, trace, warn};

use crate::login::{parse_logresp, Credential, LoginLine};
use crate::traits::{LinkError, LinkState, PacketSink, Uplink};

/// Default bound on connection attempts.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay between connection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Default bound on one upstream write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest upstream line kept, not counting the newline. Longer lines are dropped.
pub const MAX_LINE_LENGTH: usize = 2048;

/// Link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upstream `host:port`.
    pub server: String,
    /// Login sent after connecting.
    pub login: LoginLine,
    /// Bound on each connection attempt.
    pub dial_timeout: Duration,
    /// Delay before reconnecting after any failure.
    pub reconnect_delay: Duration,
    /// Bound on each write; a stalled write drops the connection.
    pub write_timeout: Duration,
}

impl LinkConfig {
    /// Create a configuration with default timings.
    #[must_use]
    pub fn new(server: impl Into<String>, login: LoginLine) -> Self {
        Self {
            server: server.into(),
            login,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// What happened to one upstream line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// Blank line or server comment.
    Comment,
    /// Matched no message grammar.
    Unrecognized,
    /// Parsed but not addressed to a station.
    Ignored(PacketKind),
    /// Handed to the packet sink.
    Dispatched(PacketKind),
}

#[derive(Debug, Default)]
struct LinkCounters {
    lines: AtomicU64,
    dispatched: AtomicU64,
    unrecognized: AtomicU64,
    oversized: AtomicU64,
    sessions: AtomicU64,
    failures: AtomicU64,
    lines_sent: AtomicU64,
}

/// Link statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkStats {
    /// Lines read from upstream.
    pub lines_received: u64,
    /// Packets handed to the sink.
    pub packets_dispatched: u64,
    /// Lines that matched no grammar.
    pub unrecognized: u64,
    /// Lines dropped for exceeding [`MAX_LINE_LENGTH`].
    pub oversized_lines: u64,
    /// Connections that reached the streaming state.
    pub sessions: u64,
    /// Connection attempts or sessions that ended in an error.
    pub failures: u64,
    /// Lines written upstream.
    pub lines_sent: u64,
}

/// Owns the upstream connection.
pub struct LinkManager {
    config: LinkConfig,
    /// Write half of the live connection; `None` while disconnected.
    writer: Mutex<Option<OwnedWriteHalf>>,
    state: watch::Sender<LinkState>,
    /// Wakes the read loop when a write drops the connection.
    reset: Notify,
    counters: LinkCounters,
}

impl LinkManager {
    /// Create a link manager. Nothing connects until [`LinkManager::run`].
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            writer: Mutex::new(None),
            state,
            reset: Notify::new(),
            counters: LinkCounters::default(),
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Get link statistics.
    #[must_use]
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            lines_received: self.counters.lines.load(Ordering::Relaxed),
            packets_dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            unrecognized: self.counters.unrecognized.load(Ordering::Relaxed),
            oversized_lines: self.counters.oversized.load(Ordering::Relaxed),
            sessions: self.counters.sessions.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            lines_sent: self.counters.lines_sent.load(Ordering::Relaxed),
        }
    }

    /// Run the connect/stream/reconnect loop. Never returns.
    pub async fn run(self: Arc<Self>, sink: Arc<dyn PacketSink>) {
        loop {
            match self.session(sink.as_ref()).await {
                Ok(()) => info!(server = %self.config.server, "APRS-IS closed the connection"),
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(server = %self.config.server, error = %e, "APRS-IS link failed");
                }
            }

            self.teardown().await;
            info!(
                delay_secs = self.config.reconnect_delay.as_secs_f64(),
                "Reconnecting to APRS-IS"
            );
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    /// One connection from dial to disconnect.
    async fn session(&self, sink: &dyn PacketSink) -> Result<(), LinkError> {
        // Registered before the writer is published so no reset is missed.
        let reset = self.reset.notified();
        tokio::pin!(reset);

        let stream = self.connect().await?;
        let reader = self.authenticate(stream).await?;

        tokio::select! {
            result = self.stream_lines(reader, sink) => result,
            () = &mut reset => Err(LinkError::Reset),
        }
    }

    async fn connect(&self) -> Result<TcpStream, LinkError> {
        self.set_state(LinkState::Connecting);
        info!(server = %self.config.server, "Connecting to APRS-IS");

        match tokio::time::timeout(
            self.config.dial_timeout,
            TcpStream::connect(&self.config.server),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(LinkError::Timeout(self.config.server.clone())),
        }
    }

    async fn authenticate(&self, stream: TcpStream) -> Result<BufReader<OwnedReadHalf>, LinkError> {
        self.set_state(LinkState::Authenticating);

        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(&encode_line(&self.config.login.to_string()))
            .await?;

        info!(
            callsign = %self.config.login.callsign,
            listen_only = self.config.login.credential == Credential::ListenOnly,
            "Sent APRS-IS login"
        );

        *self.writer.lock().await = Some(write_half);
        Ok(BufReader::new(read_half))
    }

    async fn stream_lines(
        &self,
        mut reader: BufReader<OwnedReadHalf>,
        sink: &dyn PacketSink,
    ) -> Result<(), LinkError> {
        self.counters.sessions.fetch_add(1, Ordering::Relaxed);
        self.set_state(LinkState::Streaming);

        // The feed is not guaranteed to be UTF-8.
        let mut buf = Vec::with_capacity(512);
        loop {
            buf.clear();
            if read_bounded_line(&mut reader, &mut buf).await? == 0 {
                return Ok(());
            }

            if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_LENGTH {
                self.counters.oversized.fetch_add(1, Ordering::Relaxed);
                warn!(limit = MAX_LINE_LENGTH, "Dropping oversized APRS-IS line");
                skip_rest_of_line(&mut reader, &mut buf).await?;
                continue;
            }

            let line = String::from_utf8_lossy(&buf);
            self.dispatch_line(&line, sink);
        }
    }

    /// Classify one upstream line and hand station-directed packets to `sink`.
    pub fn dispatch_line(&self, line: &str, sink: &dyn PacketSink) -> LineOutcome {
        self.counters.lines.fetch_add(1, Ordering::Relaxed);

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return LineOutcome::Comment;
        }

        if line.starts_with('#') {
            if let Some(resp) = parse_logresp(line) {
                if resp.verified {
                    info!(callsign = %resp.callsign, server = ?resp.server, "APRS-IS login verified");
                } else if self.config.login.credential == Credential::ListenOnly {
                    info!(callsign = %resp.callsign, "APRS-IS login is listen-only");
                } else {
                    warn!(callsign = %resp.callsign, "APRS-IS login unverified, outbound messages will be dropped");
                }
            }
            return LineOutcome::Comment;
        }

        let packet = match parse(line) {
            Ok(packet) => packet,
            Err(_) => {
                self.counters.unrecognized.fetch_add(1, Ordering::Relaxed);
                trace!(line = %line, "Unrecognized line");
                return LineOutcome::Unrecognized;
            }
        };

        let kind = packet.kind();
        if packet.is_user_message() || packet.as_response().is_some() {
            debug!(source = %packet.source, kind = kind.as_str(), "Dispatching packet");
            self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            sink.on_packet(packet);
            LineOutcome::Dispatched(kind)
        } else {
            trace!(source = %packet.source, kind = kind.as_str(), "Ignoring packet");
            LineOutcome::Ignored(kind)
        }
    }

    /// Drop the live connection, if any.
    async fn teardown(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Error shutting down APRS-IS socket");
            }
        }
        self.set_state(LinkState::Disconnected);
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Link state changed");
        }
    }
}

/// Read up to [`MAX_LINE_LENGTH`] + 1 bytes of the next line into `buf`.
async fn read_bounded_line(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    let limit = (MAX_LINE_LENGTH + 1) as u64;
    (&mut *reader).take(limit).read_until(b'\n', buf).await
}

/// Discard input up to and including the next newline.
async fn skip_rest_of_line(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        buf.clear();
        if read_bounded_line(reader, buf).await? == 0 || buf.last() == Some(&b'\n') {
            return Ok(());
        }
    }
}

#[async_trait]
impl Uplink for LinkManager {
    async fn send_raw(&self, line: &str) -> Result<(), LinkError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::Inactive)?;

        let line = line.trim_end_matches(['\r', '\n']);
        debug!(line = %line, "Sending to APRS-IS");

        let error = match tokio::time::timeout(
            self.config.write_timeout,
            writer.write_all(&encode_line(line)),
        )
        .await
        {
            Ok(Ok(())) => {
                self.counters.lines_sent.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Ok(Err(e)) => LinkError::Io(e),
            Err(_) => LinkError::WriteTimeout(self.config.server.clone()),
        };

        // A partial write leaves the stream unusable; reconnect.
        warn!(server = %self.config.server, error = %error, "APRS-IS write failed, dropping connection");
        drop(guard.take());
        self.set_state(LinkState::Disconnected);
        self.reset.notify_waiters();
        Err(error)
    }

    fn is_active(&self) -> bool {
        self.state() == LinkState::Streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aprsgate_protocol::Packet;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    struct ChannelSink(mpsc::UnboundedSender<Packet>);

    impl PacketSink for ChannelSink {
        fn on_packet(&self, packet: Packet) {
            let _ = self.0.send(packet);
        }
    }

    fn sink() -> (Arc<ChannelSink>, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink(tx)), rx)
    }

    fn test_config(server: String) -> LinkConfig {
        let mut config = LinkConfig::new(server, LoginLine::new("K8SDR-10").with_filter("b/K8SDR*"));
        config.dial_timeout = Duration::from_millis(500);
        config.reconnect_delay = Duration::from_millis(20);
        config
    }

    async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> String {
        let mut line = String::new();
        tokio::time::timeout(WAIT, reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        line
    }

    #[test]
    fn test_dispatch_line_classification() {
        let link = LinkManager::new(test_config("127.0.0.1:1".into()));
        let (sink, mut rx) = sink();

        assert_eq!(link.dispatch_line("# aprsc 2.1.14", sink.as_ref()), LineOutcome::Comment);
        assert_eq!(link.dispatch_line("\r\n", sink.as_ref()), LineOutcome::Comment);
        assert_eq!(
            link.dispatch_line("W1ABC>APRS:!4903.50N/07201.75W-", sink.as_ref()),
            LineOutcome::Unrecognized
        );
        assert_eq!(
            link.dispatch_line("W1ABC>APRS::BLN1     :Net tonight", sink.as_ref()),
            LineOutcome::Ignored(PacketKind::Message)
        );
        assert!(rx.try_recv().is_err());

        assert_eq!(
            link.dispatch_line("W1ABC>APRS::K8SDR    :hello{01}\r\n", sink.as_ref()),
            LineOutcome::Dispatched(PacketKind::Message)
        );
        assert_eq!(
            link.dispatch_line("W1ABC>APRS::K8SDR    :ack01", sink.as_ref()),
            LineOutcome::Dispatched(PacketKind::Response)
        );
        assert_eq!(rx.try_recv().unwrap().source, "W1ABC");

        let stats = link.stats();
        assert_eq!(stats.lines_received, 6);
        assert_eq!(stats.unrecognized, 1);
        assert_eq!(stats.packets_dispatched, 2);
    }

    #[tokio::test]
    async fn test_send_without_link() {
        let link = LinkManager::new(test_config("127.0.0.1:1".into()));
        assert!(!link.is_active());
        assert!(matches!(
            link.send_raw("K8SDR>APRS::W1ABC    :ack01").await,
            Err(LinkError::Inactive)
        ));
    }

    #[tokio::test]
    async fn test_login_stream_and_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let link = Arc::new(LinkManager::new(test_config(
            listener.local_addr().unwrap().to_string(),
        )));
        let (sink, mut rx) = sink();
        tokio::spawn(link.clone().run(sink));

        let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        let login = read_line(&mut reader).await;
        assert!(login.starts_with("user K8SDR-10 pass 14750 vers aprsgate "));
        assert!(login.ends_with(" filter b/K8SDR*\r\n"));

        write_half
            .write_all(
                b"# logresp K8SDR-10 verified, server TEST\r\n\
                  W1ABC>APRS,TCPIP*:!4903.50N/07201.75W-\r\n\
                  W1ABC>APRS,TCPIP*,qAC,T2TEST::K8SDR    :Hello{07}\r\n",
            )
            .await
            .unwrap();

        let packet = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(packet.source, "W1ABC");
        assert_eq!(packet.path, vec!["TCPIP*", "qAC", "T2TEST"]);
        assert_eq!(packet.as_message().unwrap().id.as_deref(), Some("07"));
        assert!(link.is_active());

        link.send_raw("K8SDR>APRS,TCPIP,K8SDR-10*::W1ABC    :ack07")
            .await
            .unwrap();
        assert_eq!(
            read_line(&mut reader).await,
            "K8SDR>APRS,TCPIP,K8SDR-10*::W1ABC    :ack07\r\n"
        );
        assert_eq!(link.stats().lines_sent, 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let link = Arc::new(LinkManager::new(test_config(
            listener.local_addr().unwrap().to_string(),
        )));
        let (sink, _rx) = sink();
        tokio::spawn(link.clone().run(sink));

        for _ in 0..2 {
            let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
            let (read_half, _write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);
            assert!(read_line(&mut reader).await.starts_with("user K8SDR-10 "));
            // Dropping both halves closes the connection.
        }

        let mut state = link.subscribe_state();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == LinkState::Streaming))
            .await
            .unwrap()
            .unwrap();
        assert!(link.stats().sessions >= 2);
    }

    #[tokio::test]
    async fn test_oversized_line_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let link = Arc::new(LinkManager::new(test_config(
            listener.local_addr().unwrap().to_string(),
        )));
        let (sink, mut rx) = sink();
        tokio::spawn(link.clone().run(sink));

        let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        read_line(&mut reader).await;

        let mut flood = vec![b'A'; 5000];
        flood.extend_from_slice(b"::K8SDR    :junk{01}\r\n");
        write_half.write_all(&flood).await.unwrap();
        write_half
            .write_all(b"W1ABC>APRS,TCPIP*::K8SDR    :Still here{02}\r\n")
            .await
            .unwrap();

        let packet = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(packet.as_message().unwrap().text, "Still here");
        assert!(rx.try_recv().is_err());

        let stats = link.stats();
        assert_eq!(stats.oversized_lines, 1);
        assert_eq!(stats.unrecognized, 0);
        assert_eq!(link.state(), LinkState::Streaming);
    }

    #[tokio::test]
    async fn test_stalled_write_times_out_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config(listener.local_addr().unwrap().to_string());
        config.write_timeout = Duration::from_millis(100);
        config.reconnect_delay = Duration::from_millis(500);
        let link = Arc::new(LinkManager::new(config));
        let (sink, _rx) = sink();
        tokio::spawn(link.clone().run(sink));

        // Read the login, then stop reading so the socket buffers fill up.
        let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (read_half, _write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        read_line(&mut reader).await;

        let mut state = link.subscribe_state();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == LinkState::Streaming))
            .await
            .unwrap()
            .unwrap();

        let big = "X".repeat(64 * 1024);
        let mut timed_out = false;
        for _ in 0..2000 {
            match link.send_raw(&big).await {
                Ok(()) => {}
                Err(LinkError::WriteTimeout(_)) => {
                    timed_out = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(timed_out);
        assert!(matches!(link.send_raw("x").await, Err(LinkError::Inactive)));

        // The dead connection is abandoned and a new one is dialed.
        let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (read_half, _write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        assert!(read_line(&mut reader).await.starts_with("user K8SDR-10 "));
        assert!(link.stats().failures >= 1);
    }

    #[tokio::test]
    async fn test_dial_failures_keep_retrying() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let link = Arc::new(LinkManager::new(test_config(addr)));
        let (sink, _rx) = sink();
        tokio::spawn(link.clone().run(sink));

        tokio::time::timeout(WAIT, async {
            while link.stats().failures < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_ne!(link.state(), LinkState::Streaming);
        assert!(matches!(link.send_raw("x").await, Err(LinkError::Inactive)));
    }
}

//! Metrics collection and export for aprsgate.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use aprsgate_core::{EngineStats, RouterStats};
use aprsgate_link::{LinkState, LinkStats};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CLIENTS_TOTAL: &str = "aprsgate_clients_total";
    pub const CLIENTS_ACTIVE: &str = "aprsgate_clients_active";
    pub const FRAMES_TOTAL: &str = "aprsgate_frames_total";
    pub const LOGINS_TOTAL: &str = "aprsgate_logins_total";
    pub const ERRORS_TOTAL: &str = "aprsgate_errors_total";
    pub const LINK_UP: &str = "aprsgate_link_up";
    pub const LINK_LINES_TOTAL: &str = "aprsgate_link_lines_total";
    pub const LINK_PACKETS_TOTAL: &str = "aprsgate_link_packets_total";
    pub const LINK_SESSIONS_TOTAL: &str = "aprsgate_link_sessions_total";
    pub const LINK_FAILURES_TOTAL: &str = "aprsgate_link_failures_total";
    pub const INBOUND_MESSAGES_TOTAL: &str = "aprsgate_inbound_messages_total";
    pub const DUPLICATES_TOTAL: &str = "aprsgate_duplicates_total";
    pub const ACKS_TOTAL: &str = "aprsgate_acks_total";
    pub const SENT_TOTAL: &str = "aprsgate_sent_total";
    pub const SESSIONS_ACTIVE: &str = "aprsgate_sessions_active";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CLIENTS_TOTAL,
        "Total number of client connections since server start"
    );
    metrics::describe_gauge!(names::CLIENTS_ACTIVE, "Current number of client connections");
    metrics::describe_counter!(names::FRAMES_TOTAL, "Client frames by direction");
    metrics::describe_counter!(names::LOGINS_TOTAL, "Client logins by outcome");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_gauge!(names::LINK_UP, "1 while the APRS-IS link is streaming");
    metrics::describe_counter!(names::LINK_LINES_TOTAL, "Lines read from APRS-IS");
    metrics::describe_counter!(
        names::LINK_PACKETS_TOTAL,
        "APRS-IS lines by outcome (dispatched, unrecognized)"
    );
    metrics::describe_counter!(
        names::LINK_SESSIONS_TOTAL,
        "APRS-IS connections that reached streaming"
    );
    metrics::describe_counter!(names::LINK_FAILURES_TOTAL, "Failed APRS-IS connections");
    metrics::describe_counter!(
        names::INBOUND_MESSAGES_TOTAL,
        "Inbound messages for served stations"
    );
    metrics::describe_counter!(names::DUPLICATES_TOTAL, "Retransmissions detected");
    metrics::describe_counter!(names::ACKS_TOTAL, "Acks by outcome");
    metrics::describe_counter!(names::SENT_TOTAL, "Local messages by outcome");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Callsigns with a live client");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a client frame.
pub fn record_frame(direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
}

/// Record a login attempt.
pub fn record_login(outcome: &'static str) {
    counter!(names::LOGINS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish component statistics.
///
/// The components count with their own atomics; this copies the totals.
pub fn export_stats(
    state: LinkState,
    link: &LinkStats,
    engine: &EngineStats,
    router: &RouterStats,
) {
    gauge!(names::LINK_UP).set(if state == LinkState::Streaming { 1.0 } else { 0.0 });
    counter!(names::LINK_LINES_TOTAL).absolute(link.lines_received);
    counter!(names::LINK_PACKETS_TOTAL, "outcome" => "dispatched").absolute(link.packets_dispatched);
    counter!(names::LINK_PACKETS_TOTAL, "outcome" => "unrecognized").absolute(link.unrecognized);
    counter!(names::LINK_SESSIONS_TOTAL).absolute(link.sessions);
    counter!(names::LINK_FAILURES_TOTAL).absolute(link.failures);

    counter!(names::INBOUND_MESSAGES_TOTAL).absolute(engine.inbound_messages);
    counter!(names::DUPLICATES_TOTAL).absolute(engine.duplicates);
    counter!(names::ACKS_TOTAL, "outcome" => "sent").absolute(engine.acks_sent);
    counter!(names::ACKS_TOTAL, "outcome" => "failed").absolute(engine.ack_failures);
    counter!(names::SENT_TOTAL, "outcome" => "sent").absolute(engine.messages_sent);
    counter!(names::SENT_TOTAL, "outcome" => "failed").absolute(engine.send_failures);

    gauge!(names::SESSIONS_ACTIVE).set(router.session_count as f64);
}

/// Record a new client connection.
pub fn record_connection() {
    counter!(names::CLIENTS_TOTAL).increment(1);
    gauge!(names::CLIENTS_ACTIVE).increment(1.0);
}

/// Record a client disconnection.
pub fn record_disconnection() {
    gauge!(names::CLIENTS_ACTIVE).decrement(1.0);
}

/// Metrics guard that records disconnection on drop.
pub struct ClientMetricsGuard;

impl ClientMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ClientMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClientMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

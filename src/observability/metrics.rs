//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_connections_total` (counter): accepted connections
//! - `gateway_active_connections` (gauge): live connection handlers
//! - `gateway_frames_received_total` (counter): complete frames read
//! - `gateway_decode_failures_total` (counter): well-framed but invalid messages
//! - `gateway_desync_total` (counter): connections closed on a broken frame
//! - `gateway_heartbeats_total{kind}` (counter): hello / ack / check traffic
//! - `gateway_promotions_total` (counter): temporary → identified transitions
//! - `gateway_sends_total{outcome}` (counter): outbound command results
//!
//! Recording is a no-op until a recorder is installed.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Install the Prometheus exporter listening on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint started");
    Ok(())
}

pub fn record_connection_opened() {
    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("gateway_active_connections").decrement(1.0);
}

pub fn record_frame_received() {
    counter!("gateway_frames_received_total").increment(1);
}

pub fn record_decode_failure() {
    counter!("gateway_decode_failures_total").increment(1);
}

pub fn record_desync() {
    counter!("gateway_desync_total").increment(1);
}

/// `kind` is one of "hello", "ack", "check".
pub fn record_heartbeat(kind: &'static str) {
    counter!("gateway_heartbeats_total", "kind" => kind).increment(1);
}

pub fn record_promotion() {
    counter!("gateway_promotions_total").increment(1);
}

/// `outcome` is one of "ok", "unknown_recipient", "encode_error", "write_error".
pub fn record_send(outcome: &'static str) {
    counter!("gateway_sends_total", "outcome" => outcome).increment(1);
}

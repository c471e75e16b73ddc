//! Device Metrics
//!
//! Prometheus counters and gauges for the device lifecycle, exported in
//! the text exposition format.

use prometheus::{Counter, Encoder, Gauge, Registry, TextEncoder};
use tracing::warn;

/// Collects device and relay lifecycle metrics.
pub struct Metrics {
    registry: Registry,
    connections_accepted: Counter,
    connections_denied: Counter,
    dial_failures: Counter,
    relays_opened: Counter,
    relays_closed: Counter,
    active_relays: Gauge,
    bytes_relayed: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_accepted = Counter::new(
            "relay_connections_accepted_total",
            "Total inbound connections accepted",
        )
        .expect("Failed to create connections_accepted counter");

        let connections_denied = Counter::new(
            "relay_connections_denied_total",
            "Connections rejected by the admission hook",
        )
        .expect("Failed to create connections_denied counter");

        let dial_failures = Counter::new(
            "relay_dial_failures_total",
            "Failed outbound dials to the target address",
        )
        .expect("Failed to create dial_failures counter");

        let relays_opened = Counter::new("relay_opened_total", "Relays created and registered")
            .expect("Failed to create relays_opened counter");

        let relays_closed = Counter::new("relay_closed_total", "Relays that finished closing")
            .expect("Failed to create relays_closed counter");

        let active_relays = Gauge::new("relay_active", "Relays currently registered")
            .expect("Failed to create active_relays gauge");

        let bytes_relayed = Counter::new(
            "relay_bytes_total",
            "Bytes forwarded across all closed relays",
        )
        .expect("Failed to create bytes_relayed counter");

        registry
            .register(Box::new(connections_accepted.clone()))
            .expect("Failed to register connections_accepted");
        registry
            .register(Box::new(connections_denied.clone()))
            .expect("Failed to register connections_denied");
        registry
            .register(Box::new(dial_failures.clone()))
            .expect("Failed to register dial_failures");
        registry
            .register(Box::new(relays_opened.clone()))
            .expect("Failed to register relays_opened");
        registry
            .register(Box::new(relays_closed.clone()))
            .expect("Failed to register relays_closed");
        registry
            .register(Box::new(active_relays.clone()))
            .expect("Failed to register active_relays");
        registry
            .register(Box::new(bytes_relayed.clone()))
            .expect("Failed to register bytes_relayed");

        Self {
            registry,
            connections_accepted,
            connections_denied,
            dial_failures,
            relays_opened,
            relays_closed,
            active_relays,
            bytes_relayed,
        }
    }

    pub(crate) fn record_accepted(&self) {
        self.connections_accepted.inc();
    }

    pub(crate) fn record_denied(&self) {
        self.connections_denied.inc();
    }

    pub(crate) fn record_dial_failure(&self) {
        self.dial_failures.inc();
    }

    pub(crate) fn record_relay_opened(&self, active: usize) {
        self.relays_opened.inc();
        self.active_relays.set(active as f64);
    }

    pub(crate) fn record_relay_closed(&self, active: usize, bytes: u64) {
        self.relays_closed.inc();
        self.bytes_relayed.inc_by(bytes as f64);
        self.active_relays.set(active as f64);
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.get() as u64
    }

    pub fn connections_denied(&self) -> u64 {
        self.connections_denied.get() as u64
    }

    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.get() as u64
    }

    pub fn relays_opened(&self) -> u64 {
        self.relays_opened.get() as u64
    }

    pub fn relays_closed(&self) -> u64 {
        self.relays_closed.get() as u64
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.get() as u64
    }

    /// Render all metrics in the Prometheus text format.
    pub fn export(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

//! Prometheus metrics collection and export.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use std::io;
use std::sync::{Arc, Mutex};

/// Labels for connection metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectionLabels {
    /// Dispatched protocol ("tcp", "http").
    pub protocol: String,
}

/// Labels for dropped-connection metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabels {
    /// Why the connection was dropped.
    pub reason: String,
}

/// Labels for ring-mutation metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RingLabels {
    /// Mutation kind ("create", "drop", "add", "remove").
    pub op: String,
}

/// Global metrics registry.
///
/// Initialized once at startup and shared across all tasks.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for the data plane.
///
/// Tracks accepted and dropped connections, hash-ring mutations and
/// load-balancing strategy fallbacks.
pub struct Metrics {
    registry: Registry,
    connections_total: Family<ConnectionLabels, Counter>,
    connections_dropped_total: Family<DropLabels, Counter>,
    ring_mutations_total: Family<RingLabels, Counter>,
    strategy_fallbacks_total: Counter,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let connections_total = Family::<ConnectionLabels, Counter>::default();
        registry.register(
            "proxy_connections_total",
            "Total number of dispatched connections",
            connections_total.clone(),
        );

        let connections_dropped_total = Family::<DropLabels, Counter>::default();
        registry.register(
            "proxy_connections_dropped_total",
            "Total number of dropped connections",
            connections_dropped_total.clone(),
        );

        let ring_mutations_total = Family::<RingLabels, Counter>::default();
        registry.register(
            "proxy_ring_mutations_total",
            "Total number of hash ring mutations",
            ring_mutations_total.clone(),
        );

        let strategy_fallbacks_total = Counter::default();
        registry.register(
            "proxy_strategy_fallbacks_total",
            "Total number of load balancing strategy fallbacks",
            strategy_fallbacks_total.clone(),
        );

        Self {
            registry,
            connections_total,
            connections_dropped_total,
            ring_mutations_total,
            strategy_fallbacks_total,
        }
    }

    /// Records a connection dispatched to a protocol handler.
    pub fn record_connection(protocol: &str) {
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .connections_total
                .get_or_create(&ConnectionLabels {
                    protocol: protocol.to_string(),
                })
                .inc();
        }
    }

    /// Records a connection dropped before or during forwarding.
    pub fn record_drop(reason: &str) {
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .connections_dropped_total
                .get_or_create(&DropLabels {
                    reason: reason.to_string(),
                })
                .inc();
        }
    }

    /// Records a hash-ring mutation.
    pub fn record_ring_mutation(op: &str) {
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .ring_mutations_total
                .get_or_create(&RingLabels { op: op.to_string() })
                .inc();
        }
    }

    /// Records a fallback to the default load-balancing strategy.
    pub fn record_strategy_fallback() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.strategy_fallbacks_total.inc();
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the mutex is poisoned.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}

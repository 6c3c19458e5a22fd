//! Prometheus metrics for TideMQ
//!
//! Collected in a registry owned by the broker. Exposition is left to the
//! embedding process (`Metrics::gather`).

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// All TideMQ metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    pub connections_rejected_total: IntCounterVec,
    pub session_takeovers_total: IntCounter,

    // Packet metrics (by type)
    pub packets_received_total: IntCounterVec,
    pub packets_sent_total: IntCounterVec,

    // Publish metrics
    pub publish_messages_received: IntCounter,
    pub publish_messages_delivered: IntCounter,
    pub publish_messages_queued: IntCounter,
    pub publish_messages_dropped: IntCounter,
    pub fanout_duration: Histogram,

    // Subscription metrics
    pub subscriptions_total: IntCounter,
    pub unsubscriptions_total: IntCounter,

    // Retained messages
    pub retained_messages_current: IntGauge,

    // Cluster metrics
    pub cluster_events_sent: IntCounterVec,
    pub cluster_events_received: IntCounterVec,
    pub cluster_events_suppressed: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let metric = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntCounterVec> {
    let metric = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let metric = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let fanout_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tidemq_fanout_duration_seconds",
                "Time to match and deliver one published message",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        registry.register(Box::new(fanout_duration.clone()))?;

        Ok(Metrics {
            connections_total: counter(
                &registry,
                "tidemq_connections_total",
                "Total number of accepted client connections since startup",
            )?,
            connections_current: gauge(
                &registry,
                "tidemq_connections_current",
                "Current number of connected clients",
            )?,
            connections_rejected_total: counter_vec(
                &registry,
                "tidemq_connections_rejected_total",
                "Total CONNECT attempts refused, by reason",
                &["reason"],
            )?,
            session_takeovers_total: counter(
                &registry,
                "tidemq_session_takeovers_total",
                "Connections closed because the same client id connected again",
            )?,
            packets_received_total: counter_vec(
                &registry,
                "tidemq_packets_received_total",
                "Total packets received by type",
                &["type"],
            )?,
            packets_sent_total: counter_vec(
                &registry,
                "tidemq_packets_sent_total",
                "Total packets sent by type",
                &["type"],
            )?,
            publish_messages_received: counter(
                &registry,
                "tidemq_publish_messages_received_total",
                "Total PUBLISH packets received from clients",
            )?,
            publish_messages_delivered: counter(
                &registry,
                "tidemq_publish_messages_delivered_total",
                "Total PUBLISH packets handed to connected subscribers",
            )?,
            publish_messages_queued: counter(
                &registry,
                "tidemq_publish_messages_queued_total",
                "Total messages queued for offline persistent sessions",
            )?,
            publish_messages_dropped: counter(
                &registry,
                "tidemq_publish_messages_dropped_total",
                "Total fan-out copies that could not be delivered or queued",
            )?,
            fanout_duration,
            subscriptions_total: counter(
                &registry,
                "tidemq_subscriptions_total",
                "Total subscriptions granted since startup",
            )?,
            unsubscriptions_total: counter(
                &registry,
                "tidemq_unsubscriptions_total",
                "Total subscriptions removed since startup",
            )?,
            retained_messages_current: gauge(
                &registry,
                "tidemq_retained_messages_current",
                "Current number of retained messages",
            )?,
            cluster_events_sent: counter_vec(
                &registry,
                "tidemq_cluster_events_sent_total",
                "Cluster events broadcast, by kind",
                &["kind"],
            )?,
            cluster_events_received: counter_vec(
                &registry,
                "tidemq_cluster_events_received_total",
                "Cluster events dispatched to watchers, by kind",
                &["kind"],
            )?,
            cluster_events_suppressed: counter(
                &registry,
                "tidemq_cluster_events_suppressed_total",
                "Cluster events discarded because this broker sent them",
            )?,
            registry,
        })
    }

    /// Snapshot of every metric family, for an external exporter
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    // Helper methods for common operations

    pub fn client_connected(&self) {
        self.connections_total.inc();
        self.connections_current.inc();
    }

    pub fn client_disconnected(&self) {
        self.connections_current.dec();
    }

    pub fn connection_rejected(&self, reason: &str) {
        self.connections_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn packet_received(&self, packet_type: &str) {
        self.packets_received_total
            .with_label_values(&[packet_type])
            .inc();
    }

    pub fn packet_sent(&self, packet_type: &str) {
        self.packets_sent_total
            .with_label_values(&[packet_type])
            .inc();
    }

    pub fn subscription_added(&self) {
        self.subscriptions_total.inc();
    }

    pub fn subscription_removed(&self) {
        self.unsubscriptions_total.inc();
    }

    pub fn cluster_event_sent(&self, kind: &str) {
        self.cluster_events_sent.with_label_values(&[kind]).inc();
    }

    pub fn cluster_event_received(&self, kind: &str) {
        self.cluster_events_received.with_label_values(&[kind]).inc();
    }
}
